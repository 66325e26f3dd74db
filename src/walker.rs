use crate::error::AppError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Sends every file under `root` with an allowed extension down `paths_tx`.
pub fn start_walking(
    root: &Path,
    recursive: bool,
    allowed_extensions: &HashSet<String>,
    paths_tx: crossbeam_channel::Sender<PathBuf>,
) -> Result<(), AppError> {
    log::info!("Starting file discovery in {:?} (recursive: {})", root, recursive);
    log::debug!("Configured allowed extensions: {:?}", allowed_extensions);

    if !root.is_dir() {
        return Err(AppError::InvalidRequest(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut sent = 0usize;

    for entry in WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                log::warn!("Skipping unreadable entry: {}", err);
                None
            }
        })
    {
        if !entry.file_type().is_file() {
            log::trace!("Skipping non-file entry: {:?}", entry.path());
            continue;
        }
        let path = entry.path();
        match path.extension().and_then(|s| s.to_str()) {
            Some(ext) if allowed_extensions.contains(&ext.to_lowercase()) => {
                log::debug!("Sending image file to processor: {:?}", path);
                paths_tx.send(path.to_path_buf())?;
                sent += 1;
            }
            Some(_) => log::trace!("Skipping file due to unsupported extension: {:?}", path),
            None => log::trace!("Skipping file with no extension: {:?}", path),
        }
    }

    log::info!("File discovery complete: {} candidate files.", sent);
    Ok(())
}
