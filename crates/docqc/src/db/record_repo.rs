//! Record repository: CRUD operations for the `qc_records` table.
//!
//! Functions take a `&Connection` so the store can compose several of them
//! inside one locked transaction.

use std::path::{Path, PathBuf};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;

use super::{format_timestamp, parse_timestamp, parse_timestamp_opt, DatabaseError};
use crate::model::{DocumentRole, IssueCounts, QcRecord, QcStatus};

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn record_from_row(row: &Row<'_>) -> Result<QcRecord, rusqlite::Error> {
    let status: String = row.get("status")?;
    let status = status
        .parse::<QcStatus>()
        .map_err(|e| conversion_err(4, e))?;
    let role: String = row.get("role")?;
    let role = role.parse::<DocumentRole>().unwrap_or_else(|e| {
        log::warn!("{}, defaulting to unknown", e);
        DocumentRole::Unknown
    });
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let conversion_started_at: Option<String> = row.get("conversion_started_at")?;
    let converted_at: Option<String> = row.get("converted_at")?;
    let submitted_at: Option<String> = row.get("submitted_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(QcRecord {
        id: row.get("id")?,
        source_path: PathBuf::from(row.get::<_, String>("source_path")?),
        original_name: row.get("original_name")?,
        file_signature: row.get("file_signature")?,
        status,
        rendition_path: row.get::<_, Option<String>>("rendition_path")?.map(PathBuf::from),
        retry_count: row.get("retry_count")?,
        error_message: row.get("error_message")?,
        processed_by: row.get("processed_by")?,
        watch_root: row.get::<_, Option<String>>("watch_root")?.map(PathBuf::from),
        folder_context: row.get("folder_context")?,
        role,
        batch_id: row.get("batch_id")?,
        original_batch_id: row.get("original_batch_id")?,
        issues: IssueCounts {
            critical: row.get("issues_critical")?,
            major: row.get("issues_major")?,
            minor: row.get("issues_minor")?,
        },
        report_path: row.get::<_, Option<String>>("report_path")?.map(PathBuf::from),
        external_id: row.get("external_id")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        conversion_started_at: parse_timestamp_opt(conversion_started_at.as_deref()),
        converted_at: parse_timestamp_opt(converted_at.as_deref()),
        submitted_at: parse_timestamp_opt(submitted_at.as_deref()),
        completed_at: parse_timestamp_opt(completed_at.as_deref()),
    })
}

fn path_str(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().to_string())
}

/// Query filter parameters for record listing.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilter {
    pub status: Option<QcStatus>,
    pub batch_id: Option<String>,
    pub role: Option<DocumentRole>,
    pub folder_context: Option<String>,
    /// Case-insensitive substring of the original file name.
    pub search: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
}

/// Inserts a record unless one with the same source path and signature exists.
///
/// Returns `true` if a row was inserted.
pub fn insert_if_absent(conn: &Connection, record: &QcRecord) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO qc_records (id, source_path, original_name, file_signature, status,
         rendition_path, retry_count, error_message, processed_by, watch_root, folder_context, role,
         batch_id, original_batch_id, issues_critical, issues_major, issues_minor, report_path,
         external_id, created_at, updated_at, conversion_started_at, converted_at, submitted_at,
         completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
         ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        params![
            record.id,
            record.source_path.to_string_lossy(),
            record.original_name,
            record.file_signature,
            record.status.as_str(),
            path_str(&record.rendition_path),
            record.retry_count,
            record.error_message,
            record.processed_by,
            path_str(&record.watch_root),
            record.folder_context,
            record.role.as_str(),
            record.batch_id,
            record.original_batch_id,
            record.issues.critical,
            record.issues.major,
            record.issues.minor,
            path_str(&record.report_path),
            record.external_id,
            format_timestamp(record.created_at),
            format_timestamp(record.updated_at),
            record.conversion_started_at.map(format_timestamp),
            record.converted_at.map(format_timestamp),
            record.submitted_at.map(format_timestamp),
            record.completed_at.map(format_timestamp),
        ],
    )?;
    Ok(changed > 0)
}

/// Overwrites every mutable column of an existing record.
pub fn update(conn: &Connection, record: &QcRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE qc_records SET status=?2, rendition_path=?3, retry_count=?4, error_message=?5,
         processed_by=?6, folder_context=?7, role=?8, batch_id=?9, original_batch_id=?10,
         issues_critical=?11, issues_major=?12, issues_minor=?13, report_path=?14, external_id=?15,
         updated_at=?16, conversion_started_at=?17, converted_at=?18, submitted_at=?19,
         completed_at=?20
         WHERE id=?1",
        params![
            record.id,
            record.status.as_str(),
            path_str(&record.rendition_path),
            record.retry_count,
            record.error_message,
            record.processed_by,
            record.folder_context,
            record.role.as_str(),
            record.batch_id,
            record.original_batch_id,
            record.issues.critical,
            record.issues.major,
            record.issues.minor,
            path_str(&record.report_path),
            record.external_id,
            format_timestamp(record.updated_at),
            record.conversion_started_at.map(format_timestamp),
            record.converted_at.map(format_timestamp),
            record.submitted_at.map(format_timestamp),
            record.completed_at.map(format_timestamp),
        ],
    )?;
    Ok(())
}

/// Finds a record by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<QcRecord>, DatabaseError> {
    let record = conn
        .query_row(
            "SELECT * FROM qc_records WHERE id = ?1",
            params![id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Newest record for a source path, whatever its signature.
pub fn latest_by_source_path(
    conn: &Connection,
    source_path: &Path,
) -> Result<Option<QcRecord>, DatabaseError> {
    let record = conn
        .query_row(
            "SELECT * FROM qc_records WHERE source_path = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![source_path.to_string_lossy()],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Queries records with filters, returning (rows, total_count).
pub fn query(
    conn: &Connection,
    filter: &RecordFilter,
    limit: u64,
    offset: u64,
) -> Result<(Vec<QcRecord>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.as_str()));
    }
    if let Some(ref batch_id) = filter.batch_id {
        conditions.push(format!("batch_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(batch_id.clone()));
    }
    if let Some(role) = filter.role {
        conditions.push(format!("role = ?{}", param_values.len() + 1));
        param_values.push(Box::new(role.as_str()));
    }
    if let Some(ref folder) = filter.folder_context {
        conditions.push(format!("folder_context = ?{}", param_values.len() + 1));
        param_values.push(Box::new(folder.clone()));
    }
    if let Some(ref search) = filter.search {
        conditions.push(format!(
            "LOWER(original_name) LIKE ?{}",
            param_values.len() + 1
        ));
        param_values.push(Box::new(format!("%{}%", search.to_lowercase())));
    }
    if let Some(ref from_date) = filter.from_date {
        conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
        param_values.push(Box::new(from_date.clone()));
    }
    if let Some(ref to_date) = filter.to_date {
        conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
        param_values.push(Box::new(to_date.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM qc_records {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    param_values.push(Box::new(limit as i64));
    param_values.push(Box::new(offset as i64));
    let query_sql = format!(
        "SELECT * FROM qc_records {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<QcRecord> = stmt
        .query_map(params_ref.as_slice(), record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok((rows, total))
}

/// Lists the current members of a batch in manifest order.
pub fn list_by_batch(conn: &Connection, batch_id: &str) -> Result<Vec<QcRecord>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM qc_records WHERE batch_id = ?1 ORDER BY created_at ASC")?;
    let rows = stmt
        .query_map(params![batch_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists records in the given status, oldest first.
pub fn list_by_status(conn: &Connection, status: QcStatus) -> Result<Vec<QcRecord>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM qc_records WHERE status = ?1 ORDER BY created_at ASC")?;
    let rows = stmt
        .query_map(params![status.as_str()], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// CONVERTED records without a batch, in the order they finished converting.
pub fn eligible_for_batching(conn: &Connection) -> Result<Vec<QcRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM qc_records WHERE status = 'converted' AND batch_id IS NULL
         ORDER BY COALESCE(converted_at, updated_at) ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts records per status.
pub fn count_by_status(conn: &Connection) -> Result<Vec<(QcStatus, u64)>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM qc_records GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = Vec::with_capacity(rows.len());
    for (status, count) in rows {
        match status.parse::<QcStatus>() {
            Ok(status) => counts.push((status, count)),
            Err(e) => log::warn!("count_by_status: {}", e),
        }
    }
    Ok(counts)
}

/// Per-status member counts of a batch: (completed, failed, processing).
pub fn batch_member_counts(
    conn: &Connection,
    batch_id: &str,
) -> Result<(u32, u32, u32), DatabaseError> {
    let counts = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status IN ('failed', 'numbering_failed', 'conversion_failed') THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN status IN ('submitting', 'processing', 'downloading') THEN 1 ELSE 0 END), 0)
         FROM qc_records WHERE batch_id = ?1",
        params![batch_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    Ok(counts)
}

/// Deletes a record. Returns `true` if it existed.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM qc_records WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

/// Deletes every record. Returns the number of deleted rows.
pub fn delete_all(conn: &Connection) -> Result<u64, DatabaseError> {
    let changed = conn.execute("DELETE FROM qc_records", [])?;
    Ok(changed as u64)
}
