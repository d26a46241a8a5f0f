//! Aggregate statistics over records and batches.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::Serialize;

use super::{record_repo, DatabaseError};

/// Counts by status plus timing averages, as shown on the QC dashboard.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QcStats {
    pub total_records: u64,
    /// Record counts keyed by status name.
    pub by_status: BTreeMap<String, u64>,
    /// Batch counts keyed by status name.
    pub batches_by_status: BTreeMap<String, u64>,
    /// Mean seconds from conversion start to rendition.
    pub avg_conversion_secs: Option<f64>,
    /// Mean seconds from submission to a final remote verdict.
    pub avg_qc_secs: Option<f64>,
    pub total_retries: u64,
}

/// Computes the current statistics snapshot.
pub fn snapshot(conn: &Connection) -> Result<QcStats, DatabaseError> {
    let mut stats = QcStats::default();

    for (status, count) in record_repo::count_by_status(conn)? {
        stats.total_records += count;
        stats.by_status.insert(status.as_str().to_string(), count);
    }

    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM qc_batches GROUP BY status")?;
    let batch_counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    stats.batches_by_status.extend(batch_counts);

    // julianday() understands the RFC 3339 timestamps written by the repos.
    stats.avg_conversion_secs = conn.query_row(
        "SELECT AVG((julianday(converted_at) - julianday(conversion_started_at)) * 86400.0)
         FROM qc_records
         WHERE converted_at IS NOT NULL AND conversion_started_at IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    stats.avg_qc_secs = conn.query_row(
        "SELECT AVG((julianday(completed_at) - julianday(submitted_at)) * 86400.0)
         FROM qc_records
         WHERE completed_at IS NOT NULL AND submitted_at IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    stats.total_retries = conn.query_row(
        "SELECT COALESCE(SUM(retry_count), 0) FROM qc_records",
        [],
        |r| r.get(0),
    )?;

    Ok(stats)
}
