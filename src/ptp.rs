use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PTP_EVENT_PORT: u16 = 319;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortState {
    Unknown,
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Passive,
    Uncalibrated,
    Slave,
    Master,
    GrandMaster,
}

impl PortState {
    /// Local clock is the time source for this port.
    pub fn is_time_source(self) -> bool {
        matches!(self, PortState::Master | PortState::GrandMaster)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Unknown => "UNKNOWN",
            PortState::Initializing => "INITIALIZING",
            PortState::Faulty => "FAULTY",
            PortState::Disabled => "DISABLED",
            PortState::Listening => "LISTENING",
            PortState::PreMaster => "PRE_MASTER",
            PortState::Passive => "PASSIVE",
            PortState::Uncalibrated => "UNCALIBRATED",
            PortState::Slave => "SLAVE",
            PortState::Master => "MASTER",
            PortState::GrandMaster => "GRAND_MASTER",
        }
    }
}

impl From<&str> for PortState {
    fn from(v: &str) -> Self {
        match v.to_ascii_uppercase().as_str() {
            "INITIALIZING" => PortState::Initializing,
            "FAULTY" => PortState::Faulty,
            "DISABLED" => PortState::Disabled,
            "LISTENING" => PortState::Listening,
            "PRE_MASTER" => PortState::PreMaster,
            "PASSIVE" => PortState::Passive,
            "UNCALIBRATED" => PortState::Uncalibrated,
            "SLAVE" | "CLIENT" => PortState::Slave,
            "MASTER" | "SERVER" => PortState::Master,
            "GRAND_MASTER" => PortState::GrandMaster,
            _ => PortState::Unknown,
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combine per-port states into the one state the dashboard shows.
///
/// SLAVE on any port wins; all MASTER gives MASTER; any UNCALIBRATED gives
/// UNCALIBRATED; otherwise the first port's state is reported.
pub fn aggregate_port_states(states: &[PortState]) -> PortState {
    let Some(first) = states.first() else {
        return PortState::Unknown;
    };
    if states.contains(&PortState::Slave) {
        PortState::Slave
    } else if states.iter().all(|s| *s == PortState::Master) {
        PortState::Master
    } else if states.contains(&PortState::Uncalibrated) {
        PortState::Uncalibrated
    } else {
        *first
    }
}

/// 64-bit IEEE 1588 clock identity.
///
/// linuxptp prints it as `001122.fffe.334455`; colon separated forms are
/// accepted as well.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct ClockIdentity(pub u64);

impl ClockIdentity {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl FromStr for ClockIdentity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s
            .trim()
            .chars()
            .filter(|c| *c != '.' && *c != ':')
            .collect();
        if hex.len() != 16 {
            return Err(format!("clock identity '{}' is not 8 bytes", s));
        }
        u64::from_str_radix(&hex, 16)
            .map(ClockIdentity)
            .map_err(|e| format!("clock identity '{}': {}", s, e))
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl Serialize for ClockIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
