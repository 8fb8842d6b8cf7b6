//! Retention selection shared by local and remote pruning.

use chrono::{DateTime, NaiveDateTime, Utc};

const RUN_ID_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Run id for a run starting at `at`, e.g. `20261019T031500123Z`.
pub fn format_run_id(at: DateTime<Utc>) -> String {
    at.format(RUN_ID_FORMAT).to_string()
}

/// Recover the start time from a run id, ignoring a collision suffix (`-2`).
pub fn parse_run_id(id: &str) -> Option<DateTime<Utc>> {
    let base = id.split_once('-').map(|(base, _)| base).unwrap_or(id);
    NaiveDateTime::parse_from_str(base, RUN_ID_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Ids to delete: runs older than `cutoff`, never touching the `keep` newest.
pub fn select_expired(mut runs: Vec<RunEntry>, cutoff: DateTime<Utc>, keep: usize) -> Vec<String> {
    runs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    runs.into_iter()
        .skip(keep)
        .filter(|run| run.created_at < cutoff)
        .map(|run| run.id)
        .collect()
}
