use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::metrics::Rows;

pub use std::string::String as Uid;

const MIB: u64 = 1_048_576;

/// Accumulated usage per UID for one scope of the active window, plus the
/// count of rows that carried a job id no user could be attributed from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeUsage {
    // Ordered so downstream decisions come out in UID sort order.
    pub totals: BTreeMap<Uid, u64>,
    pub dropped_rows: u64,
}

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?P<proc>[^.]+)\.(?P<uid>\d+)$").unwrap())
}

/// Extract the UID from a `<proc>.<uid>` job identifier. Identifiers in any
/// other form belong to I/O that cannot be attributed to a user.
pub fn job_id_uid(job_id: &str) -> Option<&str> {
    job_id_pattern()
        .captures(job_id)
        .and_then(|captures| captures.name("uid"))
        .map(|m| m.as_str())
}

/// Collapse raw metric rows into per-UID totals. The store reports rates per
/// collection interval; multiplying by the interval recovers the totals the
/// budgets are expressed in. Rows with unattributable job ids or non-numeric
/// values are dropped and counted.
pub fn accumulate(
    rows: &Rows,
    job_id_column: usize,
    value_column: usize,
    collect_interval_seconds: u64,
) -> ScopeUsage {
    let mut usage = ScopeUsage::default();
    for row in &rows.values {
        let job_id = row.get(job_id_column).and_then(|v| v.as_str());
        let value = row.get(value_column).and_then(row_value);
        match (job_id.and_then(job_id_uid), value) {
            (Some(uid), Some(value)) => {
                *usage.totals.entry(uid.to_owned()).or_insert(0) +=
                    value * collect_interval_seconds;
            }
            _ => {
                usage.dropped_rows += 1;
            }
        }
    }
    usage
}

fn row_value(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|float| float as u64))
}

/// Accumulators are kept in bytes; convert only when presenting to humans.
pub fn bytes_to_mib(bytes: u64) -> u64 {
    bytes / MIB
}
