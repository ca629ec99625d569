//! In-memory capture launcher for tests. Output lines are pushed through a
//! channel; terminating or crashing a process closes it.

use super::capture::{CaptureLauncher, CaptureProcess};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Feed = Arc<Mutex<Option<Sender<String>>>>;

#[derive(Default)]
pub struct FakeLauncher {
    launches: Mutex<HashMap<String, usize>>,
    feeds: Mutex<HashMap<String, Feed>>,
    live: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self, interface: &str) -> usize {
        self.launches.lock().unwrap().get(interface).copied().unwrap_or(0)
    }

    /// Processes launched and not yet terminated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Push a line to the current process on `interface`.
    pub fn emit(&self, interface: &str, line: &str) -> bool {
        let feed = self.feeds.lock().unwrap().get(interface).cloned();
        match feed {
            Some(feed) => match feed.lock().unwrap().as_ref() {
                Some(tx) => tx.send(line.to_string()).is_ok(),
                None => false,
            },
            None => false,
        }
    }

    /// Simulate the subprocess dying: its output reaches EOF.
    pub fn crash(&self, interface: &str) {
        if let Some(feed) = self.feeds.lock().unwrap().get(interface) {
            feed.lock().unwrap().take();
        }
    }
}

impl CaptureLauncher for FakeLauncher {
    fn launch(&self, interface: &str, _port: u16) -> Result<Box<dyn CaptureProcess>> {
        *self.launches.lock().unwrap().entry(interface.to_string()).or_default() += 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("no capture tool"));
        }
        let (tx, rx) = mpsc::channel();
        let feed: Feed = Arc::new(Mutex::new(Some(tx)));
        self.feeds.lock().unwrap().insert(interface.to_string(), feed.clone());
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            output: Some(ChannelReader {
                rx,
                pending: Vec::new(),
                pos: 0,
            }),
            feed,
            live: self.live.clone(),
            terminated: false,
        }))
    }
}

struct FakeProcess {
    output: Option<ChannelReader>,
    feed: Feed,
    live: Arc<AtomicUsize>,
    terminated: bool,
}

impl CaptureProcess for FakeProcess {
    fn take_output(&mut self) -> Option<Box<dyn BufRead + Send>> {
        let reader = self.output.take()?;
        Some(Box::new(BufReader::new(reader)))
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.feed.lock().unwrap().take();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct ChannelReader {
    rx: Receiver<String>,
    pending: Vec<u8>,
    pos: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(mut line) => {
                    line.push('\n');
                    self.pending = line.into_bytes();
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub const SYNC_FROM_20: &str = "12:00:00.000001 00:1b:21:aa:bb:cc > 01:00:5e:00:01:81, ethertype IPv4 (0x0800), length 86: 192.168.1.20.319 > 224.0.1.129.319: UDP, length 44";
pub const SYNC_FROM_5: &str = "12:00:00.000002 00:1b:21:00:00:05 > 01:00:5e:00:01:81, ethertype IPv4 (0x0800), length 86: 192.168.1.5.319 > 224.0.1.129.319: UDP, length 44";
