//! One capture worker per monitored interface.
//!
//! The worker owns its capture subprocess for the whole of its life. A reader
//! thread turns the subprocess output into a channel of lines so the worker
//! loop can wake up every poll interval and notice that it is no longer
//! wanted, even while the capture is silent.

use super::capture::{parse_capture_line, CaptureLauncher, CaptureProcess};
use super::peers::PeerTable;
use super::{MonitorMode, SharedConfig};
use crate::config::MonitorTiming;
use log::{debug, info, warn};
use serde::Serialize;
use std::io::BufRead;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Everything a worker needs, handed over at spawn time.
pub struct WorkerContext {
    pub interface: String,
    pub addresses: Vec<IpAddr>,
    pub launcher: Arc<dyn CaptureLauncher>,
    pub peers: Arc<PeerTable>,
    pub config: SharedConfig,
    pub timing: MonitorTiming,
}

/// Exponential restart delay, capped.
#[derive(Debug)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Backoff {
            min,
            max: max.max(min),
            current: min,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

enum Exit {
    Unwanted,
    Crashed,
}

pub struct WorkerHandle {
    interface: String,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(ctx: WorkerContext) -> std::io::Result<Self> {
        let interface = ctx.interface.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let state = Arc::new(Mutex::new(WorkerState::Starting));

        let worker = Worker {
            ctx,
            stop: stop.clone(),
            state: state.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("capture-{}", interface))
            .spawn(move || worker.run())?;

        Ok(WorkerHandle {
            interface,
            stop,
            state,
            thread: Some(thread),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the worker to wind down without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != WorkerState::Stopped {
            *state = WorkerState::Stopping;
        }
    }

    /// Signal and wait. Returns once the subprocess has been killed and
    /// reaped.
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("[Capture {}] Worker thread panicked", self.interface);
                set_state(&self.state, WorkerState::Stopped);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<WorkerState>, next: WorkerState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

struct Worker {
    ctx: WorkerContext,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
}

impl Worker {
    fn still_wanted(&self) -> bool {
        if self.stop.load(Ordering::SeqCst) {
            return false;
        }
        let config = self.ctx.config.read().unwrap_or_else(|e| e.into_inner());
        config.mode == MonitorMode::Passive && config.interfaces.contains(&self.ctx.interface)
    }

    /// Sleep in poll-sized slices. False if the worker stopped being wanted.
    fn pause(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        let slice = self.ctx.timing.worker_poll();
        while Instant::now() < deadline {
            if !self.still_wanted() {
                return false;
            }
            thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
        }
        self.still_wanted()
    }

    fn run(self) {
        let iface = self.ctx.interface.clone();
        let port = self.ctx.timing.ptp_event_port;
        let mut backoff = Backoff::new(self.ctx.timing.backoff_min(), self.ctx.timing.backoff_max());
        info!("[Capture {}] Worker started", iface);

        while self.still_wanted() {
            set_state(&self.state, WorkerState::Starting);
            let mut process = match self.ctx.launcher.launch(&iface, port) {
                Ok(p) => p,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("[Capture {}] Launch failed: {:#}, retrying in {:?}", iface, e, delay);
                    if !self.pause(delay) {
                        break;
                    }
                    continue;
                }
            };

            let started = Instant::now();
            let exit = self.pump(process.as_mut());
            process.terminate();

            match exit {
                Exit::Unwanted => break,
                Exit::Crashed => {
                    if started.elapsed() >= backoff.max {
                        backoff.reset();
                    }
                    let delay = backoff.next_delay();
                    warn!("[Capture {}] Capture exited unexpectedly, restarting in {:?}", iface, delay);
                    if !self.pause(delay) {
                        break;
                    }
                }
            }
        }

        set_state(&self.state, WorkerState::Stopped);
        info!("[Capture {}] Worker stopped", iface);
    }

    /// Feed capture lines into the peer table until the output ends or the
    /// interface is no longer wanted. Terminates the process before the
    /// reader thread is joined so the join cannot hang.
    fn pump(&self, process: &mut dyn CaptureProcess) -> Exit {
        let iface = &self.ctx.interface;
        let Some(output) = process.take_output() else {
            return Exit::Crashed;
        };

        let (tx, rx) = mpsc::channel::<String>();
        let reader = match thread::Builder::new()
            .name(format!("capture-{}-reader", iface))
            .spawn(move || forward_lines(output, tx))
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[Capture {}] Could not start reader: {}", iface, e);
                return Exit::Crashed;
            }
        };

        set_state(&self.state, WorkerState::Running);
        debug!("[Capture {}] Capture running", iface);

        let poll = self.ctx.timing.worker_poll();
        let exit = loop {
            if !self.still_wanted() {
                set_state(&self.state, WorkerState::Stopping);
                break Exit::Unwanted;
            }
            match rx.recv_timeout(poll) {
                Ok(line) => self.record(&line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Exit::Crashed,
            }
        };

        process.terminate();
        drop(rx);
        if reader.join().is_err() {
            warn!("[Capture {}] Reader thread panicked", iface);
        }
        exit
    }

    fn record(&self, line: &str) {
        let Some(frame) = parse_capture_line(line, self.ctx.timing.ptp_event_port) else {
            return;
        };
        let is_self = self.ctx.addresses.contains(&frame.source);
        self.ctx
            .peers
            .observe(frame.source, &frame.link_source, &self.ctx.interface, is_self);
    }
}

fn forward_lines(output: Box<dyn BufRead + Send>, tx: mpsc::Sender<String>) {
    for line in output.lines() {
        let Ok(line) = line else {
            break;
        };
        if tx.send(line).is_err() {
            break;
        }
    }
}
