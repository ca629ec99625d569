use crate::extract::{self, Field, Pick};
use crate::ptp::{aggregate_port_states, ClockIdentity, PortState};
use crate::tools::{PtpTools, STATUS_DATASETS};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Normalized view of the local PTP stack, rebuilt on every poll.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub ptp_daemon_running: bool,
    pub clock_sync_running: bool,
    pub port_state: PortState,
    pub offset_ns: f64,
    pub path_delay_ns: f64,
    /// -1 when unknown.
    pub steps_removed: i64,
    /// Display string; carries a " (Self)" suffix when we are the grandmaster.
    pub grandmaster_id: String,
    pub is_self_grandmaster: bool,
    pub gm_present: bool,
    pub hardware_time: Option<String>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            ptp_daemon_running: false,
            clock_sync_running: false,
            port_state: PortState::Unknown,
            offset_ns: 0.0,
            path_delay_ns: 0.0,
            steps_removed: -1,
            grandmaster_id: "Unknown".to_string(),
            is_self_grandmaster: false,
            gm_present: false,
            hardware_time: None,
        }
    }
}

/// Anything that can produce a fresh snapshot.
pub trait SnapshotSource: Send + Sync {
    fn build(&self) -> StatusSnapshot;
}

pub struct StatusBuilder {
    tools: PtpTools,
    ptp4l_conf: PathBuf,
}

impl StatusBuilder {
    pub fn new(tools: PtpTools, ptp4l_conf: PathBuf) -> Self {
        StatusBuilder { tools, ptp4l_conf }
    }
}

impl SnapshotSource for StatusBuilder {
    fn build(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot::default();

        if let Some(iface) = crate::config::read_configured_interface(&self.ptp4l_conf) {
            snapshot.hardware_time = self.tools.hardware_time(&iface);
        }

        if !self.tools.daemon_running() {
            debug!("[Status] ptp4l not running");
            return snapshot;
        }
        snapshot.ptp_daemon_running = true;
        snapshot.clock_sync_running = self.tools.clock_sync_running();

        match self.tools.query_datasets(STATUS_DATASETS) {
            Some(output) => apply_datasets(&mut snapshot, &output),
            None => debug!("[Status] pmc gave no data"),
        }
        snapshot
    }
}

/// Fill a snapshot from pmc output, then enforce the time-source invariant.
pub fn apply_datasets(snapshot: &mut StatusSnapshot, output: &str) {
    let states = extract::aggregate(output, Field::PortState, |raw| {
        raw.iter().map(|s| PortState::from(*s)).collect::<Vec<_>>()
    });
    snapshot.port_state = aggregate_port_states(&states);

    match extract::float(output, Field::OffsetFromMaster, Pick::First) {
        Some(v) => snapshot.offset_ns = v,
        None => debug!("[Status] offsetFromMaster missing"),
    }
    match extract::float(output, Field::MeanPathDelay, Pick::First) {
        Some(v) => snapshot.path_delay_ns = v,
        None => debug!("[Status] meanPathDelay missing"),
    }
    match extract::int(output, Field::StepsRemoved, Pick::First) {
        Some(v) => snapshot.steps_removed = v,
        None => debug!("[Status] stepsRemoved missing"),
    }
    snapshot.gm_present = extract::flag(output, Field::GmPresent, Pick::First).unwrap_or(false);

    let local = extract::identity(output, Field::ClockIdentity, Pick::First)
        .or_else(|| extract::identity(output, Field::ResponderIdentity, Pick::First));
    let grandmaster = extract::identity(output, Field::GrandmasterIdentity, Pick::First);
    apply_grandmaster(snapshot, local, grandmaster);

    enforce_time_source(snapshot);
}

fn apply_grandmaster(
    snapshot: &mut StatusSnapshot,
    local: Option<ClockIdentity>,
    grandmaster: Option<ClockIdentity>,
) {
    let Some(gm) = grandmaster else {
        debug!("[Status] grandmasterIdentity missing");
        return;
    };
    snapshot.grandmaster_id = gm.to_string();
    if local == Some(gm) {
        snapshot.is_self_grandmaster = true;
        snapshot.grandmaster_id.push_str(" (Self)");
    }
}

/// MASTER / GRAND_MASTER means the local clock is the time source: nothing
/// to be offset from and no hops to a grandmaster.
pub fn enforce_time_source(snapshot: &mut StatusSnapshot) {
    if snapshot.port_state.is_time_source() {
        snapshot.offset_ns = 0.0;
        snapshot.path_delay_ns = 0.0;
        snapshot.steps_removed = 0;
        snapshot.is_self_grandmaster = true;
    }
}
