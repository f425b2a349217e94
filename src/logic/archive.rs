use flate2::read::GzDecoder;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::Read;

use crate::error::{PipelineError, PipelineResult};
use crate::model::MAX_MANIFEST_ENTRIES;
use crate::storage::paths::normalize_relative_path;

/// One regular file taken out of an uploaded bundle
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMember {
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// gzip magic bytes (1f 8b)
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

pub fn guess_content_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Unpack a tar or tar.gz bundle off the async runtime.
pub async fn read_archive(data: Vec<u8>, max_bytes: u64) -> PipelineResult<Vec<ArchiveMember>> {
    tokio::task::spawn_blocking(move || read_archive_blocking(&data, max_bytes))
        .await
        .map_err(|e| PipelineError::Internal(anyhow::anyhow!("archive task failed: {}", e)))?
}

fn bad_archive(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::validation(format!("unreadable archive: {}", err))
}

fn too_large(max_bytes: u64) -> PipelineError {
    PipelineError::validation(format!("archive unpacks to more than {} bytes", max_bytes))
}

/// Regular files only, sorted by path. Directories, links and members with
/// unsafe paths are skipped; a later member with the same path wins.
///
/// Member sizes in tar headers are not trusted: reads are bounded by what is
/// left of `max_bytes`, counted across all members after decompression.
pub fn read_archive_blocking(data: &[u8], max_bytes: u64) -> PipelineResult<Vec<ArchiveMember>> {
    let reader: Box<dyn Read + '_> = if is_gzip(data) {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    };
    let mut archive = tar::Archive::new(reader);

    let mut members = BTreeMap::new();
    let mut total: u64 = 0;
    for entry in archive.entries().map_err(bad_archive)? {
        let mut entry = entry.map_err(bad_archive)?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw_path = entry.path().map_err(bad_archive)?.to_string_lossy().into_owned();
        let path = match normalize_relative_path(&raw_path) {
            Ok(path) => path,
            Err(reason) => {
                warn!("Skipping archive member '{}': {}", raw_path, reason);
                continue;
            }
        };

        let remaining = max_bytes - total;
        if entry.size() > remaining {
            return Err(too_large(max_bytes));
        }
        let mut bytes = Vec::new();
        (&mut entry)
            .take(remaining + 1)
            .read_to_end(&mut bytes)
            .map_err(bad_archive)?;
        total += bytes.len() as u64;
        if total > max_bytes {
            return Err(too_large(max_bytes));
        }

        let content_type = guess_content_type(&path);
        members.insert(
            path.clone(),
            ArchiveMember {
                path,
                bytes,
                content_type,
            },
        );

        if members.len() > MAX_MANIFEST_ENTRIES {
            return Err(PipelineError::validation(format!(
                "archive has more than {} files",
                MAX_MANIFEST_ENTRIES
            )));
        }
    }

    if members.is_empty() {
        return Err(PipelineError::validation("archive contains no files"));
    }

    debug!("Read {} files from archive", members.len());
    Ok(members.into_values().collect())
}
