//! Invocations of the linuxptp and system tools the dashboard reads from.
//!
//! Argument lists are fixed here because the extractor depends on the exact
//! output each one produces.

use crate::config::ToolConfig;
use crate::extract::{self, Field, Pick};
use crate::traits::CommandRunner;
use chrono::{Local, TimeZone};
use log::debug;
use std::sync::Arc;

pub const STATUS_DATASETS: &[&str] = &[
    "GET CURRENT_DATA_SET",
    "GET PORT_DATA_SET",
    "GET TIME_STATUS_NP",
    "GET PARENT_DATA_SET",
];

pub const BMCA_DATASETS: &[&str] = &[
    "GET DEFAULT_DATA_SET",
    "GET PARENT_DATA_SET",
    "GET TIME_PROPERTIES_DATA_SET",
];

#[derive(Clone)]
pub struct PtpTools {
    runner: Arc<dyn CommandRunner>,
    cfg: ToolConfig,
}

impl PtpTools {
    pub fn new(runner: Arc<dyn CommandRunner>, cfg: ToolConfig) -> Self {
        PtpTools { runner, cfg }
    }

    fn run(&self, program: &str, args: Vec<String>) -> Option<String> {
        self.runner.run(program, &args)
    }

    /// `pgrep -x ptp4l` produced a pid.
    pub fn daemon_running(&self) -> bool {
        self.run(&self.cfg.pgrep, vec!["-x".into(), self.cfg.daemon_process.clone()])
            .is_some_and(|out| !out.trim().is_empty())
    }

    /// `pgrep -f phc2sys` produced a pid.
    pub fn clock_sync_running(&self) -> bool {
        self.run(&self.cfg.pgrep, vec!["-f".into(), self.cfg.clock_sync_process.clone()])
            .is_some_and(|out| !out.trim().is_empty())
    }

    /// One batched unicast management query (`pmc -u -b 0 -d <domain> ...`).
    pub fn query_datasets(&self, datasets: &[&str]) -> Option<String> {
        let mut args = vec![
            "-u".to_string(),
            "-b".to_string(),
            "0".to_string(),
            "-d".to_string(),
            self.cfg.pmc_domain.to_string(),
        ];
        args.extend(datasets.iter().map(|d| d.to_string()));
        let out = self.run(&self.cfg.pmc, args)?;
        // pmc exits 0 even when nothing answers; only the echoed requests remain.
        if out.contains("RESPONSE") {
            Some(out)
        } else {
            debug!("[Tools] pmc returned no RESPONSE blocks");
            None
        }
    }

    /// Index N of `/dev/ptpN` backing `interface`.
    pub fn phc_index(&self, interface: &str) -> Option<i64> {
        let out = self.run(&self.cfg.ethtool, vec!["-T".into(), interface.to_string()])?;
        extract::int(&out, Field::PhcIndex, Pick::First)
    }

    /// Raw epoch seconds of the interface's hardware clock.
    pub fn phc_seconds(&self, interface: &str) -> Option<i64> {
        let index = self.phc_index(interface)?;
        let device = format!("/dev/ptp{}", index);
        let out = self.run(&self.cfg.phc_ctl, vec![device, "get".into()])?;
        extract::int(&out, Field::PhcSeconds, Pick::First)
    }

    /// Hardware clock time rendered in local time.
    pub fn hardware_time(&self, interface: &str) -> Option<String> {
        let secs = self.phc_seconds(interface)?;
        Local
            .timestamp_opt(secs, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    }

    /// Last `lines` journal entries of the daemon units. Empty on failure.
    pub fn recent_logs(&self, lines: usize) -> String {
        let mut args = Vec::new();
        for unit in &self.cfg.log_units {
            args.push("-u".to_string());
            args.push(unit.clone());
        }
        args.extend([
            "-n".to_string(),
            lines.to_string(),
            "--no-pager".to_string(),
            "--output".to_string(),
            "cat".to_string(),
        ]);
        self.run(&self.cfg.journalctl, args).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockCommandRunner;
    use mockall::predicate::*;

    fn tools(mock: MockCommandRunner) -> PtpTools {
        PtpTools::new(Arc::new(mock), ToolConfig::default())
    }

    #[test]
    fn test_daemon_running_uses_exact_match() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .with(eq("pgrep"), eq(vec!["-x".to_string(), "ptp4l".to_string()]))
            .times(1)
            .returning(|_, _| Some("4242\n".to_string()));
        assert!(tools(mock).daemon_running());
    }

    #[test]
    fn test_daemon_not_running_when_pgrep_fails() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(|_, _| None);
        let t = tools(mock);
        assert!(!t.daemon_running());
        assert!(!t.clock_sync_running());
    }

    #[test]
    fn test_query_datasets_arguments() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|program, args| {
                program == "pmc"
                    && args[..5] == ["-u", "-b", "0", "-d", "0"]
                    && args[5..] == STATUS_DATASETS.iter().map(|s| s.to_string()).collect::<Vec<_>>()[..]
            })
            .times(1)
            .returning(|_, _| Some("\t001122.fffe.334455-1 seq 0 RESPONSE MANAGEMENT PORT_DATA_SET\n".to_string()));
        assert!(tools(mock).query_datasets(STATUS_DATASETS).is_some());
    }

    #[test]
    fn test_query_without_response_is_none() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_, _| Some("sending: GET PORT_DATA_SET\n".to_string()));
        assert!(tools(mock).query_datasets(STATUS_DATASETS).is_none());
    }

    #[test]
    fn test_phc_seconds_chains_ethtool_and_phc_ctl() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .with(eq("ethtool"), eq(vec!["-T".to_string(), "eth0".to_string()]))
            .times(1)
            .returning(|_, _| Some("PTP Hardware Clock: 3\n".to_string()));
        mock.expect_run()
            .with(eq("phc_ctl"), eq(vec!["/dev/ptp3".to_string(), "get".to_string()]))
            .times(1)
            .returning(|_, _| Some("phc_ctl[1.2]: clock time is 1700000000.5 or ...\n".to_string()));
        let t = tools(mock);
        assert_eq!(t.phc_seconds("eth0"), Some(1_700_000_000));
    }

    #[test]
    fn test_hardware_time_absent_without_phc() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_, _| Some("PTP Hardware Clock: none\n".to_string()));
        assert_eq!(tools(mock).hardware_time("eth0"), None);
    }

    #[test]
    fn test_recent_logs_arguments_and_fallback() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|program, args| {
                program == "journalctl"
                    && args == ["-u", "ptp4l", "-u", "phc2sys-custom", "-n", "50", "--no-pager", "--output", "cat"]
            })
            .times(1)
            .returning(|_, _| None);
        assert_eq!(tools(mock).recent_logs(50), "");
    }
}
