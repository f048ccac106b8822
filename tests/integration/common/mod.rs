#![allow(dead_code)]

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Writes `body` as `devsup.yaml` inside `dir` and returns its path.
pub fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("devsup.yaml");
    fs::write(&path, body).expect("failed to write config");
    path
}

/// Asks the kernel for a port that is currently free on the loopback interface.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener.local_addr().expect("no local addr").port()
}

pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}

pub fn wait_for_content(path: &Path, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.contains(needle)
        {
            return content;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {needle:?} in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn read_pid(path: &Path) -> u32 {
    fs::read_to_string(path)
        .expect("failed to read pid file")
        .trim()
        .parse()
        .expect("pid file does not hold a pid")
}

/// Whether `pid` exists and is not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
}

/// Minimal HTTP/1.1 server answering `200 ok` on `ok_paths` and `404` elsewhere.
///
/// Runs on a background thread for the rest of the test process.
pub fn serve_http(ok_paths: &'static [&'static str]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind http server");
    let port = listener.local_addr().expect("no local addr").port();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            answer(stream, ok_paths);
        }
    });
    port
}

/// Like [`serve_http`] but only starts listening on `port` after `delay`.
pub fn serve_http_later(port: u16, delay: Duration, ok_paths: &'static [&'static str]) {
    thread::spawn(move || {
        thread::sleep(delay);
        let listener = TcpListener::bind(("127.0.0.1", port)).expect("failed to bind late server");
        for stream in listener.incoming().flatten() {
            answer(stream, ok_paths);
        }
    });
}

fn answer(mut stream: TcpStream, ok_paths: &[&str]) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    loop {
        let mut header = String::new();
        match reader.read_line(&mut header) {
            Ok(0) | Err(_) => break,
            Ok(_) if header == "\r\n" || header == "\n" => break,
            Ok(_) => {}
        }
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = if ok_paths.contains(&path) {
        ("200 OK", "ok")
    } else {
        ("404 Not Found", "missing")
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}
