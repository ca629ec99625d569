//! Bounded execution of collaborator tools (pmc, pgrep, ethtool, ...).
//!
//! Each invocation owns its `Child` directly while a helper thread drains
//! stdout. If the deadline passes the child is killed and reaped, which
//! closes the pipe and lets the helper finish.

use crate::traits::CommandRunner;
use log::debug;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on captured output per invocation.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        SystemCommandRunner { timeout }
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Option<String> {
        let mut child = match Command::new(program)
            .args(args)
            .env("LANG", "C")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                debug!("[Cmd] {} unavailable: {}", program, e);
                return None;
            }
        };

        let stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                reap(&mut child);
                return None;
            }
        };

        let reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).ok().map(|_| buf)
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(e) => {
                    debug!("[Cmd] {} wait failed: {}", program, e);
                    break None;
                }
            }
            if Instant::now() >= deadline {
                debug!("[Cmd] {} timed out after {:?}", program, self.timeout);
                reap(&mut child);
                drop(child);
                // The reader may still be blocked on a grandchild holding
                // the pipe; it ends on its own once that closes.
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let output = reader.join().ok().flatten()?;
        match status {
            Some(s) if s.success() => Some(String::from_utf8_lossy(&output).into_owned()),
            Some(s) => {
                debug!("[Cmd] {} exited with {}", program, s);
                None
            }
            None => None,
        }
    }
}

/// Kill (if still running) and wait for a child, bounded by `REAP_TIMEOUT`.
pub(crate) fn reap(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(Some(status)) => return Some(status),
        Ok(None) => {}
        Err(_) => return None,
    }
    let _ = child.kill();
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(_) => return None,
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
