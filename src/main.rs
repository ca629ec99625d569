use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use ptpdash::command::SystemCommandRunner;
use ptpdash::config::DashboardConfig;
use ptpdash::dashboard::{Dashboard, Queries};
use ptpdash::monitor::capture::ensure_available;
use ptpdash::monitor::MonitorMode;
use ptpdash::net::list_interfaces;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "linuxptp status, BMCA and network monitor", long_about = None)]
struct Args {
    /// JSON configuration file (defaults apply to missing keys)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the current PTP status snapshot
    Status,
    /// Run the best master clock comparison against the current grandmaster
    Bmca,
    /// Print the last daemon log lines
    Logs {
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: usize,
    },
    /// List interfaces that can be monitored
    Interfaces,
    /// Watch PTP event traffic until Ctrl+C
    Monitor {
        /// Interface to capture on (repeatable)
        #[arg(short, long = "interface", required = true)]
        interfaces: Vec<String>,

        #[arg(long, default_value = "passive")]
        mode: MonitorMode,

        /// Seconds between peer table prints
        #[arg(long, default_value_t = 5)]
        every: u64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => DashboardConfig::load(path)?,
        None => DashboardConfig::default(),
    };

    match args.command {
        Cmd::Interfaces => print_json(&list_interfaces()),
        Cmd::Status => print_json(&Queries::system(&cfg).status()),
        Cmd::Bmca => print_json(&Queries::system(&cfg).bmca()),
        Cmd::Logs { lines } => {
            print!("{}", Queries::system(&cfg).recent_logs(lines));
            Ok(())
        }
        Cmd::Monitor {
            interfaces,
            mode,
            every,
        } => run_monitor(&cfg, mode, &interfaces, Duration::from_secs(every.max(1))),
    }
}

fn run_monitor(cfg: &DashboardConfig, mode: MonitorMode, interfaces: &[String], every: Duration) -> Result<()> {
    if mode == MonitorMode::Passive {
        let runner = SystemCommandRunner::new(cfg.tools.command_timeout());
        ensure_available(&runner, &cfg.tools.tcpdump)?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let dashboard = Dashboard::new(cfg)?;
    dashboard
        .apply_monitor_config(mode, interfaces)
        .map_err(|e| anyhow!("monitor configuration rejected: {}", e))?;
    info!("Monitoring {:?} on {}", mode, interfaces.join(", "));

    let mut last_print = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
        if last_print.elapsed() >= every {
            let peers = dashboard.list_peers();
            if peers.is_empty() {
                warn!("[Monitor] No PTP event traffic seen yet");
            }
            print_json(&peers)?;
            last_print = Instant::now();
        }
    }

    dashboard.shutdown();
    info!("Exiting.");
    Ok(())
}
