use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::BatchError;
use crate::model::{BatchManifest, QcRecord};

pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Path of the archive for `batch_id` under the archives directory.
pub fn archive_path(archives_dir: &Path, batch_id: &str) -> PathBuf {
    archives_dir.join(format!("{}.zip", batch_id))
}

/// Writes the renditions of `records` plus `manifest.json` into a ZIP at
/// `dest`. Returns the archive size in bytes.
///
/// Every record must have an entry in `manifest`; entries are written under
/// their manifest names.
pub fn build_archive(
    dest: &Path,
    manifest: &BatchManifest,
    records: &[QcRecord],
) -> Result<u64, BatchError> {
    let archive_err = |reason: String| BatchError::Archive {
        path: dest.to_path_buf(),
        reason,
    };

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BatchError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let partial = dest.with_extension("zip.partial");
    let file = File::create(&partial).map_err(|e| BatchError::Io {
        path: partial.clone(),
        source: e,
    })?;

    let result = write_entries(BufWriter::new(file), manifest, records, &archive_err);
    if let Err(e) = result {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }

    std::fs::rename(&partial, dest).map_err(|e| BatchError::Io {
        path: dest.to_path_buf(),
        source: e,
    })?;
    let size = std::fs::metadata(dest)
        .map_err(|e| BatchError::Io {
            path: dest.to_path_buf(),
            source: e,
        })?
        .len();
    Ok(size)
}

fn write_entries<W, E>(
    writer: W,
    manifest: &BatchManifest,
    records: &[QcRecord],
    archive_err: &E,
) -> Result<(), BatchError>
where
    W: Write + std::io::Seek,
    E: Fn(String) -> BatchError,
{
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(writer);

    for record in records {
        let entry = manifest
            .entry_for_record(&record.id)
            .ok_or_else(|| archive_err(format!("record {} is not in the manifest", record.id)))?;
        let rendition = record
            .rendition_path
            .as_deref()
            .filter(|p| p.exists())
            .ok_or_else(|| BatchError::RenditionMissing {
                qc_id: record.id.clone(),
                path: record.rendition_path.clone().unwrap_or_default(),
            })?;

        let mut source = File::open(rendition).map_err(|e| BatchError::Io {
            path: rendition.to_path_buf(),
            source: e,
        })?;
        zip.start_file(entry.entry_name.as_str(), options)
            .map_err(|e| archive_err(e.to_string()))?;
        std::io::copy(&mut source, &mut zip).map_err(|e| BatchError::Io {
            path: rendition.to_path_buf(),
            source: e,
        })?;
    }

    let manifest_json =
        serde_json::to_vec_pretty(manifest).map_err(|e| archive_err(e.to_string()))?;
    zip.start_file(MANIFEST_ENTRY, options)
        .map_err(|e| archive_err(e.to_string()))?;
    zip.write_all(&manifest_json)
        .map_err(|e| archive_err(e.to_string()))?;

    let mut inner = zip.finish().map_err(|e| archive_err(e.to_string()))?;
    inner.flush().map_err(|e| archive_err(e.to_string()))?;
    Ok(())
}
