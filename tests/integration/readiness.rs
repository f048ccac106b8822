#[path = "common/mod.rs"]
mod common;

use std::{path::Path, time::Duration};

use devsup::{
    config::ServiceDescriptor,
    host::Host,
    readiness::{Readiness, ReadinessProbe},
    retry::RetryPolicy,
    test_utils::descriptor,
};
use tempfile::tempdir;

fn service(port: u16, dir: &Path, alternates: &[&str]) -> ServiceDescriptor {
    let mut service = descriptor("backend", port, dir);
    service.alternate_readiness_paths = alternates.iter().map(|p| p.to_string()).collect();
    service
}

#[test]
fn responding_server_is_ready_on_first_attempt() {
    let dir = tempdir().unwrap();
    let port = common::serve_http(&["/"]);
    let probe = ReadinessProbe::new(&Host::os().unwrap());

    let readiness = probe.wait_ready(
        &service(port, dir.path(), &[]),
        RetryPolicy::new(5, Duration::from_millis(50)),
    );

    assert_eq!(
        readiness,
        Readiness::Ready {
            attempts: 1,
            url: format!("http://127.0.0.1:{port}/")
        }
    );
}

#[test]
fn alternate_path_rescues_a_404_root() {
    let dir = tempdir().unwrap();
    let port = common::serve_http(&["/docs"]);
    let probe = ReadinessProbe::new(&Host::os().unwrap());
    let service = service(port, dir.path(), &["/docs"]);

    let readiness = probe.wait_ready(&service, RetryPolicy::new(3, Duration::from_millis(50)));

    assert!(matches!(readiness, Readiness::Ready { ref url, .. } if url.ends_with("/docs")));
    assert!(probe.is_responsive(&service));
}

#[test]
fn error_status_is_not_ready() {
    let dir = tempdir().unwrap();
    let port = common::serve_http(&[]);
    let probe = ReadinessProbe::new(&Host::os().unwrap());

    let readiness = probe.wait_ready(
        &service(port, dir.path(), &[]),
        RetryPolicy::new(2, Duration::from_millis(10)),
    );

    assert_eq!(readiness, Readiness::Timeout { attempts: 2 });
}

#[test]
fn closed_port_times_out_after_max_attempts() {
    let dir = tempdir().unwrap();
    let port = common::free_port();
    let probe = ReadinessProbe::new(&Host::os().unwrap());

    let readiness = probe.wait_ready(
        &service(port, dir.path(), &[]),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );

    assert_eq!(readiness, Readiness::Timeout { attempts: 3 });
    assert!(!probe.is_responsive(&service(port, dir.path(), &[])));
}

#[test]
fn late_server_is_picked_up_by_a_later_attempt() {
    let dir = tempdir().unwrap();
    let port = common::free_port();
    common::serve_http_later(port, Duration::from_millis(300), &["/"]);
    let probe = ReadinessProbe::new(&Host::os().unwrap());

    let readiness = probe.wait_ready(
        &service(port, dir.path(), &[]),
        RetryPolicy::new(40, Duration::from_millis(100)),
    );

    match readiness {
        Readiness::Ready { attempts, .. } => assert!(attempts > 1),
        other => panic!("expected ready, got {other:?}"),
    }
}
