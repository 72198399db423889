//! Citation set file I/O
//!
//! The citation file is a JSON object mapping entry names to records. A save
//! keeps the previous file as `<path>.backup` and replaces the file
//! atomically (temp file + rename).

use crate::models::CitationSet;
use cite_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Read a citation set from `path`
pub async fn load_citation_set(path: &Path) -> Result<CitationSet> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("Citation file {}", path.display())))
        }
        Err(e) => return Err(Error::Io(e)),
    };

    let set: CitationSet = serde_json::from_str(&content)?;
    info!(
        path = %path.display(),
        entries = set.len(),
        references = set.reference_count(),
        "Citation set loaded"
    );
    Ok(set)
}

/// Path of the copy kept by [`save_citation_set`]
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".backup");
    PathBuf::from(name)
}

/// Write a citation set to `path`, keeping the previous file as a backup
pub async fn save_citation_set(path: &Path, set: &CitationSet) -> Result<()> {
    let content = serde_json::to_vec_pretty(set)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    if tokio::fs::try_exists(path).await? {
        let backup = backup_path(path);
        tokio::fs::copy(path, &backup).await?;
        debug!(backup = %backup.display(), "Previous citation file backed up");
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, content).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    info!(path = %path.display(), entries = set.len(), "Citation set saved");
    Ok(())
}
