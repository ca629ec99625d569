//! Field extraction from collaborator text output.
//!
//! All scraping of pmc / ethtool / phc_ctl output goes through the pattern
//! table below, so a change in a tool's output format is fixed in one place.
//! Extraction never fails: a missing or malformed field is `None`.

use crate::ptp::ClockIdentity;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    // PORT_DATA_SET
    PortState,
    // CURRENT_DATA_SET
    StepsRemoved,
    OffsetFromMaster,
    MeanPathDelay,
    // TIME_STATUS_NP
    GmPresent,
    // DEFAULT_DATA_SET
    ClockIdentity,
    Priority1,
    Priority2,
    ClockClass,
    ClockAccuracy,
    OffsetScaledLogVariance,
    // PARENT_DATA_SET
    GrandmasterIdentity,
    GmPriority1,
    GmPriority2,
    GmClockClass,
    GmClockAccuracy,
    GmOffsetScaledLogVariance,
    // TIME_PROPERTIES_DATA_SET
    CurrentUtcOffset,
    CurrentUtcOffsetValid,
    Leap61,
    Leap59,
    PtpTimescale,
    TimeTraceable,
    FrequencyTraceable,
    TimeSource,
    /// Identity prefix of a management RESPONSE header line.
    ResponderIdentity,
    /// `ethtool -T` hardware clock index.
    PhcIndex,
    /// `phc_ctl get` epoch seconds.
    PhcSeconds,
}

/// Which occurrence to return when a label repeats (one block per port).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    First,
    Last,
}

const IDENTITY: &str = r"[0-9a-fA-F]{6}\.[0-9a-fA-F]{4}\.[0-9a-fA-F]{6}";

/// `label value` rows as printed by pmc, one per line.
const DATASET_LABELS: &[(Field, &str)] = &[
    (Field::PortState, "portState"),
    (Field::StepsRemoved, "stepsRemoved"),
    (Field::OffsetFromMaster, "offsetFromMaster"),
    (Field::MeanPathDelay, "meanPathDelay"),
    (Field::GmPresent, "gmPresent"),
    (Field::ClockIdentity, "clockIdentity"),
    (Field::Priority1, "priority1"),
    (Field::Priority2, "priority2"),
    (Field::ClockClass, "clockClass"),
    (Field::ClockAccuracy, "clockAccuracy"),
    (Field::OffsetScaledLogVariance, "offsetScaledLogVariance"),
    (Field::GrandmasterIdentity, "grandmasterIdentity"),
    (Field::GmPriority1, "grandmasterPriority1"),
    (Field::GmPriority2, "grandmasterPriority2"),
    (Field::GmClockClass, "gm.ClockClass"),
    (Field::GmClockAccuracy, "gm.ClockAccuracy"),
    (Field::GmOffsetScaledLogVariance, "gm.OffsetScaledLogVariance"),
    (Field::CurrentUtcOffset, "currentUtcOffset"),
    (Field::CurrentUtcOffsetValid, "currentUtcOffsetValid"),
    (Field::Leap61, "leap61"),
    (Field::Leap59, "leap59"),
    (Field::PtpTimescale, "ptpTimescale"),
    (Field::TimeTraceable, "timeTraceable"),
    (Field::FrequencyTraceable, "frequencyTraceable"),
    (Field::TimeSource, "timeSource"),
];

static PATTERNS: LazyLock<HashMap<Field, Regex>> = LazyLock::new(|| {
    let mut table: HashMap<Field, Regex> = DATASET_LABELS
        .iter()
        .map(|(field, label)| {
            // Anchored to line start so `priority1` does not match inside
            // `grandmasterPriority1`.
            let pattern = format!(r"(?m)^[ \t]*{}[ \t]+(\S+)", regex::escape(label));
            (*field, Regex::new(&pattern).expect("dataset label pattern is valid"))
        })
        .collect();

    let special = [
        (
            Field::ResponderIdentity,
            format!(r"(?m)^[ \t]*({})-\d+[ \t]+seq[ \t]+\d+[ \t]+RESPONSE", IDENTITY),
        ),
        (
            Field::PhcIndex,
            r"(?:PTP Hardware Clock|Hardware timestamp provider index):[ \t]+(\d+)".to_string(),
        ),
        (Field::PhcSeconds, r"clock time is (\d+)\.".to_string()),
    ];
    for (field, pattern) in special {
        table.insert(field, Regex::new(&pattern).expect("special pattern is valid"));
    }
    table
});

/// Every captured value of `field`, in output order.
pub fn all(output: &str, field: Field) -> Vec<&str> {
    match PATTERNS.get(&field) {
        Some(re) => re
            .captures_iter(output)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect(),
        None => Vec::new(),
    }
}

/// Raw text of the first or last occurrence.
pub fn text(output: &str, field: Field, pick: Pick) -> Option<&str> {
    let re = PATTERNS.get(&field)?;
    match pick {
        Pick::First => re.captures(output).and_then(|c| c.get(1)).map(|m| m.as_str()),
        Pick::Last => all(output, field).pop(),
    }
}

/// Reduce every occurrence with a caller supplied priority rule.
pub fn aggregate<T, F>(output: &str, field: Field, rule: F) -> T
where
    F: FnOnce(&[&str]) -> T,
{
    rule(&all(output, field))
}

/// Decimal or `0x` prefixed hexadecimal integer.
pub fn int(output: &str, field: Field, pick: Pick) -> Option<i64> {
    text(output, field, pick).and_then(parse_int)
}

pub fn float(output: &str, field: Field, pick: Pick) -> Option<f64> {
    text(output, field, pick).and_then(|v| v.parse::<f64>().ok())
}

/// `1`/`0` or `true`/`false`.
pub fn flag(output: &str, field: Field, pick: Pick) -> Option<bool> {
    match text(output, field, pick)?.to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

pub fn identity(output: &str, field: Field, pick: Pick) -> Option<ClockIdentity> {
    text(output, field, pick).and_then(|v| v.parse().ok())
}

fn parse_int(v: &str) -> Option<i64> {
    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        v.parse::<i64>().ok()
    }
}
