//! Packet-capture subprocess and the parsing of its output lines.
//!
//! The capture tool is `tcpdump -e`, which prints the link-layer header in
//! front of the transport addresses. Nothing past the address prefix of a
//! line is decoded.

use crate::command::reap;
use crate::traits::CommandRunner;
use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use regex::Regex;
use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, LazyLock, Mutex};

/// A running capture. Dropping it must not leave the subprocess behind.
pub trait CaptureProcess: Send {
    /// Line oriented output. Yields `None` after the first call.
    fn take_output(&mut self) -> Option<Box<dyn BufRead + Send>>;

    /// Kill and reap synchronously. Idempotent.
    fn terminate(&mut self);
}

pub trait CaptureLauncher: Send + Sync {
    fn launch(&self, interface: &str, port: u16) -> Result<Box<dyn CaptureProcess>>;
}

/// Pids of every live capture subprocess, for last-resort cleanup at exit.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: Mutex<HashSet<u32>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32) {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).insert(pid);
    }

    fn unregister(&self, pid: u32) {
        self.pids.lock().unwrap_or_else(|e| e.into_inner()).remove(&pid);
    }

    pub fn live(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        pids.sort_unstable();
        pids
    }

    /// SIGKILL every registered capture subprocess.
    pub fn kill_all(&self) {
        let pids: Vec<u32> = self
            .pids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for pid in pids {
            warn!("[Capture] Force killing leftover capture pid {}", pid);
            force_kill(pid);
        }
    }
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill(pid: u32) {
    debug!("[Capture] No forced kill available for pid {} on this platform", pid);
}

pub struct TcpdumpLauncher {
    program: String,
    registry: Arc<ChildRegistry>,
}

impl TcpdumpLauncher {
    pub fn new(program: &str, registry: Arc<ChildRegistry>) -> Self {
        TcpdumpLauncher {
            program: program.to_string(),
            registry,
        }
    }

    fn args(interface: &str, port: u16) -> Vec<String> {
        vec![
            "-i".to_string(),
            interface.to_string(),
            "-l".to_string(), // line buffered
            "-n".to_string(),
            "-e".to_string(),
            "udp".to_string(),
            "dst".to_string(),
            "port".to_string(),
            port.to_string(),
        ]
    }
}

impl CaptureLauncher for TcpdumpLauncher {
    fn launch(&self, interface: &str, port: u16) -> Result<Box<dyn CaptureProcess>> {
        let child = Command::new(&self.program)
            .args(Self::args(interface, port))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {} on {}", self.program, interface))?;
        let pid = child.id();
        self.registry.register(pid);
        debug!("[Capture {}] {} started (pid {})", interface, self.program, pid);
        Ok(Box::new(TcpdumpProcess {
            child,
            pid,
            registry: self.registry.clone(),
            finished: false,
        }))
    }
}

struct TcpdumpProcess {
    child: Child,
    pid: u32,
    registry: Arc<ChildRegistry>,
    finished: bool,
}

impl CaptureProcess for TcpdumpProcess {
    fn take_output(&mut self) -> Option<Box<dyn BufRead + Send>> {
        let stdout = self.child.stdout.take()?;
        Some(Box::new(BufReader::new(stdout)))
    }

    fn terminate(&mut self) {
        if self.finished {
            return;
        }
        if reap(&mut self.child).is_none() {
            warn!("[Capture] pid {} did not exit after kill", self.pid);
            return;
        }
        self.finished = true;
        self.registry.unregister(self.pid);
    }
}

impl Drop for TcpdumpProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Addresses pulled from one captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    pub link_source: String,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub destination_port: u16,
}

// `<ts> <src mac> > <dst mac>, ethertype ..., length N: <src ip>.<port> > <dst ip>.<port>: UDP ...`
static FRAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?P<mac>[0-9a-fA-F]{2}(?::[0-9a-fA-F]{2}){5}) > [^,]+,.*?",
        r"(?P<src>(?:\d{1,3}\.){3}\d{1,3}|[0-9a-fA-F:]*:[0-9a-fA-F:]*)\.(?P<sport>\d+) > ",
        r"(?P<dst>(?:\d{1,3}\.){3}\d{1,3}|[0-9a-fA-F:]*:[0-9a-fA-F:]*)\.(?P<dport>\d+):",
    ))
    .expect("capture line pattern is valid")
});

/// Parse one capture line; only frames addressed to `port` are returned.
pub fn parse_capture_line(line: &str, port: u16) -> Option<CapturedFrame> {
    let caps = FRAME_PATTERN.captures(line)?;
    let destination_port: u16 = caps.name("dport")?.as_str().parse().ok()?;
    if destination_port != port {
        return None;
    }
    Some(CapturedFrame {
        link_source: caps.name("mac")?.as_str().to_ascii_lowercase(),
        source: caps.name("src")?.as_str().parse().ok()?,
        destination: caps.name("dst")?.as_str().parse().ok()?,
        destination_port,
    })
}

/// Check that the capture tool answers `--version` before workers start
/// hammering it with restarts. Bounded by the runner's timeout.
pub fn ensure_available(runner: &dyn CommandRunner, program: &str) -> Result<()> {
    match runner.run(program, &["--version".to_string()]) {
        Some(_) => Ok(()),
        None => Err(anyhow!("capture tool {} unavailable", program)),
    }
}
