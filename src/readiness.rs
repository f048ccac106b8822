//! HTTP readiness polling.
use std::sync::Arc;

use serde::Deserialize;
use strum_macros::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::{
    config::ServiceDescriptor,
    host::{Host, HttpCheck},
    retry::{PollOutcome, RetryPolicy},
};

/// How a readiness timeout is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Report the service as degraded and carry on.
    #[default]
    BestEffort,
    /// Abort the command with `ReadinessTimeout`.
    FailFast,
}

/// Result of waiting for a service to answer HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32, url: String },
    Timeout { attempts: u32 },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }
}

pub struct ReadinessProbe {
    http: Arc<dyn HttpCheck>,
}

impl ReadinessProbe {
    pub fn new(host: &Host) -> Self {
        Self {
            http: host.http.clone(),
        }
    }

    /// Polls the readiness URLs until one answers or `policy` runs out of attempts.
    pub fn wait_ready(&self, descriptor: &ServiceDescriptor, policy: RetryPolicy) -> Readiness {
        let urls = descriptor.readiness_urls();
        let mut answered: Option<String> = None;

        let outcome = policy.poll(|attempt| {
            debug!(
                "Readiness probe {attempt}/{} for '{}'",
                policy.max_attempts.max(1),
                descriptor.name
            );
            answered = self.first_responding(&urls);
            answered.is_some()
        });

        match (outcome, answered) {
            (PollOutcome::Satisfied { attempts }, Some(url)) => {
                info!("'{}' is ready at {url} (attempt {attempts})", descriptor.name);
                Readiness::Ready { attempts, url }
            }
            (outcome, _) => {
                let attempts = outcome.attempts();
                warn!(
                    "'{}' did not answer on {} after {attempts} attempts",
                    descriptor.name,
                    urls.join(" or ")
                );
                Readiness::Timeout { attempts }
            }
        }
    }

    /// Single-shot check used by status reporting.
    pub fn is_responsive(&self, descriptor: &ServiceDescriptor) -> bool {
        self.first_responding(&descriptor.readiness_urls()).is_some()
    }

    fn first_responding(&self, urls: &[String]) -> Option<String> {
        urls.iter().find(|url| self.http.responds(url)).cloned()
    }
}
