//! Local replay of the IEEE 1588 dataset comparison.
//!
//! Explains, one criterion at a time, why the local clock wins or loses
//! against the grandmaster ptp4l currently follows. Only the dataset
//! comparison part of the algorithm is replayed (no topology / steps
//! removed comparison, no state decision).

use crate::extract::{self, Field, Pick};
use crate::ptp::ClockIdentity;
use crate::tools::{PtpTools, BMCA_DATASETS};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// IEEE 1588 defaults used when a numeric field is missing from the output.
const DEFAULT_PRIORITY: u8 = 128;
const DEFAULT_CLOCK_CLASS: u8 = 248;
const DEFAULT_CLOCK_ACCURACY: u8 = 0xFE;
const DEFAULT_VARIANCE: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockDescriptor {
    pub priority1: u8,
    pub priority2: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub identity: ClockIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Win,
    Lose,
    Tie,
}

impl From<Ordering> for Outcome {
    /// Lower value wins.
    fn from(local_vs_remote: Ordering) -> Self {
        match local_vs_remote {
            Ordering::Less => Outcome::Win,
            Ordering::Greater => Outcome::Lose,
            Ordering::Equal => Outcome::Tie,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionStep {
    pub criterion: String,
    pub local: String,
    pub remote: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
    Unknown,
}

/// TIME_PROPERTIES_DATA_SET flags shown next to the trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeProperties {
    pub current_utc_offset: Option<i64>,
    pub current_utc_offset_valid: Option<bool>,
    pub leap61: Option<bool>,
    pub leap59: Option<bool>,
    pub ptp_timescale: Option<bool>,
    pub time_traceable: Option<bool>,
    pub frequency_traceable: Option<bool>,
    pub time_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmcaReport {
    pub local: Option<ClockDescriptor>,
    pub grandmaster: Option<ClockDescriptor>,
    pub time_properties: TimeProperties,
    pub trace: Vec<DecisionStep>,
    pub winner: Winner,
    pub verdict: String,
}

impl BmcaReport {
    /// The management query produced nothing usable.
    pub fn no_response() -> Self {
        BmcaReport {
            local: None,
            grandmaster: None,
            time_properties: TimeProperties::default(),
            trace: Vec::new(),
            winner: Winner::Unknown,
            verdict: "no response from ptp4l".to_string(),
        }
    }
}

fn hex2(v: u64) -> String {
    format!("0x{:02X}", v)
}

fn step(criterion: &str, local: String, remote: String, ord: Ordering) -> DecisionStep {
    DecisionStep {
        criterion: criterion.to_string(),
        local,
        remote,
        outcome: Outcome::from(ord),
    }
}

/// Compare two descriptors and return the ordered trace and the winner.
///
/// Stops at the first criterion that is not a tie. Identity only decides
/// when every earlier criterion tied.
pub fn compare(local: &ClockDescriptor, remote: &ClockDescriptor) -> (Vec<DecisionStep>, Winner) {
    if local.identity == remote.identity {
        let only = DecisionStep {
            criterion: "Identity".to_string(),
            local: "local is grandmaster".to_string(),
            remote: remote.identity.to_string(),
            outcome: Outcome::Win,
        };
        return (vec![only], Winner::Local);
    }

    let criteria = [
        step(
            "Priority1",
            local.priority1.to_string(),
            remote.priority1.to_string(),
            local.priority1.cmp(&remote.priority1),
        ),
        step(
            "ClockClass",
            local.clock_class.to_string(),
            remote.clock_class.to_string(),
            local.clock_class.cmp(&remote.clock_class),
        ),
        step(
            "ClockAccuracy",
            hex2(local.clock_accuracy.into()),
            hex2(remote.clock_accuracy.into()),
            local.clock_accuracy.cmp(&remote.clock_accuracy),
        ),
        step(
            "OffsetScaledLogVariance",
            hex2(local.offset_scaled_log_variance.into()),
            hex2(remote.offset_scaled_log_variance.into()),
            local.offset_scaled_log_variance.cmp(&remote.offset_scaled_log_variance),
        ),
        step(
            "Priority2",
            local.priority2.to_string(),
            remote.priority2.to_string(),
            local.priority2.cmp(&remote.priority2),
        ),
    ];

    let mut trace = Vec::with_capacity(criteria.len() + 1);
    for s in criteria {
        let outcome = s.outcome;
        trace.push(s);
        match outcome {
            Outcome::Win => return (trace, Winner::Local),
            Outcome::Lose => return (trace, Winner::Remote),
            Outcome::Tie => {}
        }
    }

    let tiebreak = step(
        "Identity",
        local.identity.to_string(),
        remote.identity.to_string(),
        local.identity.cmp(&remote.identity),
    );
    let winner = if tiebreak.outcome == Outcome::Win {
        Winner::Local
    } else {
        Winner::Remote
    };
    trace.push(tiebreak);
    (trace, winner)
}

fn u8_field(output: &str, field: Field, default: u8) -> u8 {
    match extract::int(output, field, Pick::First).and_then(|v| u8::try_from(v).ok()) {
        Some(v) => v,
        None => {
            debug!("[BMCA] {:?} missing, using {}", field, default);
            default
        }
    }
}

fn u16_field(output: &str, field: Field, default: u16) -> u16 {
    match extract::int(output, field, Pick::First).and_then(|v| u16::try_from(v).ok()) {
        Some(v) => v,
        None => {
            debug!("[BMCA] {:?} missing, using 0x{:04X}", field, default);
            default
        }
    }
}

/// Local descriptor from DEFAULT_DATA_SET rows.
pub fn parse_local(output: &str) -> Option<ClockDescriptor> {
    let identity = extract::identity(output, Field::ClockIdentity, Pick::First)?;
    Some(ClockDescriptor {
        priority1: u8_field(output, Field::Priority1, DEFAULT_PRIORITY),
        priority2: u8_field(output, Field::Priority2, DEFAULT_PRIORITY),
        clock_class: u8_field(output, Field::ClockClass, DEFAULT_CLOCK_CLASS),
        clock_accuracy: u8_field(output, Field::ClockAccuracy, DEFAULT_CLOCK_ACCURACY),
        offset_scaled_log_variance: u16_field(output, Field::OffsetScaledLogVariance, DEFAULT_VARIANCE),
        identity,
    })
}

/// Grandmaster descriptor from the `grandmaster*` / `gm.*` rows of
/// PARENT_DATA_SET.
pub fn parse_grandmaster(output: &str) -> Option<ClockDescriptor> {
    let identity = extract::identity(output, Field::GrandmasterIdentity, Pick::First)?;
    Some(ClockDescriptor {
        priority1: u8_field(output, Field::GmPriority1, DEFAULT_PRIORITY),
        priority2: u8_field(output, Field::GmPriority2, DEFAULT_PRIORITY),
        clock_class: u8_field(output, Field::GmClockClass, DEFAULT_CLOCK_CLASS),
        clock_accuracy: u8_field(output, Field::GmClockAccuracy, DEFAULT_CLOCK_ACCURACY),
        offset_scaled_log_variance: u16_field(output, Field::GmOffsetScaledLogVariance, DEFAULT_VARIANCE),
        identity,
    })
}

pub fn parse_time_properties(output: &str) -> TimeProperties {
    TimeProperties {
        current_utc_offset: extract::int(output, Field::CurrentUtcOffset, Pick::First),
        current_utc_offset_valid: extract::flag(output, Field::CurrentUtcOffsetValid, Pick::First),
        leap61: extract::flag(output, Field::Leap61, Pick::First),
        leap59: extract::flag(output, Field::Leap59, Pick::First),
        ptp_timescale: extract::flag(output, Field::PtpTimescale, Pick::First),
        time_traceable: extract::flag(output, Field::TimeTraceable, Pick::First),
        frequency_traceable: extract::flag(output, Field::FrequencyTraceable, Pick::First),
        time_source: extract::text(output, Field::TimeSource, Pick::First).map(str::to_string),
    }
}

/// Build a full report from one batched pmc output.
pub fn report_from_output(output: &str) -> BmcaReport {
    let (Some(local), Some(grandmaster)) = (parse_local(output), parse_grandmaster(output)) else {
        debug!("[BMCA] local or grandmaster identity missing");
        return BmcaReport::no_response();
    };

    let (trace, winner) = compare(&local, &grandmaster);
    let deciding = trace.last().map(|s| s.criterion.as_str()).unwrap_or("nothing");
    let verdict = if local.identity == grandmaster.identity {
        "local is grandmaster".to_string()
    } else if winner == Winner::Local {
        format!("local clock wins on {}", deciding)
    } else {
        format!("grandmaster wins on {}", deciding)
    };

    BmcaReport {
        local: Some(local),
        grandmaster: Some(grandmaster),
        time_properties: parse_time_properties(output),
        trace,
        winner,
        verdict,
    }
}

pub struct BmcaSimulator {
    tools: PtpTools,
}

impl BmcaSimulator {
    pub fn new(tools: PtpTools) -> Self {
        BmcaSimulator { tools }
    }

    pub fn simulate(&self) -> BmcaReport {
        let report = match self.tools.query_datasets(BMCA_DATASETS) {
            Some(output) => report_from_output(&output),
            None => BmcaReport::no_response(),
        };
        info!("[BMCA] {:?}: {}", report.winner, report.verdict);
        report
    }
}
