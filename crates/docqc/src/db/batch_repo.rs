//! Batch repository: CRUD operations for the `qc_batches` table.

use std::path::PathBuf;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, parse_timestamp_opt, DatabaseError};
use crate::model::{BatchManifest, BatchStatus, QcBatch};

fn batch_from_row(row: &Row<'_>) -> Result<QcBatch, rusqlite::Error> {
    let status: String = row.get("status")?;
    let status = status.parse::<BatchStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
    })?;
    let manifest: String = row.get("manifest")?;
    let manifest: BatchManifest = serde_json::from_str(&manifest)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    let created_at: String = row.get("created_at")?;
    let submitted_at: Option<String> = row.get("submitted_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let last_polled_at: Option<String> = row.get("last_polled_at")?;

    Ok(QcBatch {
        id: row.get("id")?,
        remote_batch_id: row.get("remote_batch_id")?,
        status,
        archive_path: PathBuf::from(row.get::<_, String>("archive_path")?),
        archive_size: row.get("archive_size")?,
        file_count: row.get("file_count")?,
        completed_count: row.get("completed_count")?,
        failed_count: row.get("failed_count")?,
        processing_count: row.get("processing_count")?,
        manifest,
        created_at: parse_timestamp(&created_at),
        submitted_at: parse_timestamp_opt(submitted_at.as_deref()),
        completed_at: parse_timestamp_opt(completed_at.as_deref()),
        last_polled_at: parse_timestamp_opt(last_polled_at.as_deref()),
        last_error: row.get("last_error")?,
    })
}

fn manifest_json(batch: &QcBatch) -> Result<String, DatabaseError> {
    serde_json::to_string(&batch.manifest).map_err(|e| DatabaseError::CorruptRow {
        table: "qc_batches",
        id: batch.id.clone(),
        reason: e.to_string(),
    })
}

/// Inserts a new batch row.
pub fn insert(conn: &Connection, batch: &QcBatch) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO qc_batches (id, remote_batch_id, status, archive_path, archive_size,
         file_count, completed_count, failed_count, processing_count, manifest, created_at,
         submitted_at, completed_at, last_polled_at, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            batch.id,
            batch.remote_batch_id,
            batch.status.as_str(),
            batch.archive_path.to_string_lossy(),
            batch.archive_size,
            batch.file_count,
            batch.completed_count,
            batch.failed_count,
            batch.processing_count,
            manifest_json(batch)?,
            format_timestamp(batch.created_at),
            batch.submitted_at.map(format_timestamp),
            batch.completed_at.map(format_timestamp),
            batch.last_polled_at.map(format_timestamp),
            batch.last_error,
        ],
    )?;
    Ok(())
}

/// Overwrites the mutable columns of a batch. The manifest is never rewritten.
pub fn update(conn: &Connection, batch: &QcBatch) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE qc_batches SET remote_batch_id=?2, status=?3, archive_size=?4, file_count=?5,
         completed_count=?6, failed_count=?7, processing_count=?8, submitted_at=?9,
         completed_at=?10, last_polled_at=?11, last_error=?12
         WHERE id=?1",
        params![
            batch.id,
            batch.remote_batch_id,
            batch.status.as_str(),
            batch.archive_size,
            batch.file_count,
            batch.completed_count,
            batch.failed_count,
            batch.processing_count,
            batch.submitted_at.map(format_timestamp),
            batch.completed_at.map(format_timestamp),
            batch.last_polled_at.map(format_timestamp),
            batch.last_error,
        ],
    )?;
    Ok(())
}

/// Finds a batch by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<QcBatch>, DatabaseError> {
    let batch = conn
        .query_row(
            "SELECT * FROM qc_batches WHERE id = ?1",
            params![id],
            batch_from_row,
        )
        .optional()?;
    Ok(batch)
}

/// Lists batches, newest first, optionally restricted to one status.
pub fn list(conn: &Connection, status: Option<BatchStatus>) -> Result<Vec<QcBatch>, DatabaseError> {
    let rows = match status {
        Some(status) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM qc_batches WHERE status = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map(params![status.as_str()], batch_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare("SELECT * FROM qc_batches ORDER BY created_at DESC")?;
            let rows = stmt
                .query_map([], batch_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Batches the poller still has to follow, oldest first.
pub fn list_pollable(conn: &Connection) -> Result<Vec<QcBatch>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM qc_batches WHERE status IN ('submitted', 'processing')
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([], batch_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Deletes a batch that was never accepted by the remote service.
pub fn delete_pending(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM qc_batches WHERE id = ?1 AND status = 'pending'",
        params![id],
    )?;
    Ok(changed > 0)
}
