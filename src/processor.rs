use crate::error::AppError;
use crate::metadata::PhotoMetadata;
use chrono::{DateTime, Utc};
use exif::{Exif, In, Reader, Tag, Value};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub scanned: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Extracts metadata for every received path in parallel.
///
/// A file that is not a decodable image counts as skipped; any other failure
/// counts as an error. Neither stops the run.
pub fn start_processing(
    paths_rx: crossbeam_channel::Receiver<PathBuf>,
    metadata_tx: crossbeam_channel::Sender<PhotoMetadata>,
) -> Result<ScanStats, AppError> {
    let paths: Vec<PathBuf> = paths_rx.iter().collect();
    log::info!("Received {} paths for processing.", paths.len());

    let scanned = AtomicUsize::new(0);
    let skipped = AtomicUsize::new(0);
    let errors = AtomicUsize::new(0);

    paths.into_par_iter().try_for_each(|path| {
        match extract(&path) {
            Ok(Some(metadata)) => {
                log::trace!("Extracted metadata for {:?}: {:?}", path, metadata);
                scanned.fetch_add(1, Ordering::Relaxed);
                metadata_tx.send(metadata)?;
            }
            Ok(None) => {
                log::debug!("Not a valid image file: {:?}", path);
                skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("Failed to process image {:?}: {}", path, e);
                errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok::<(), AppError>(())
    })?;

    let stats = ScanStats {
        scanned: scanned.into_inner(),
        skipped: skipped.into_inner(),
        errors: errors.into_inner(),
    };
    log::info!(
        "Scan completed: {} scanned, {} skipped, {} errors",
        stats.scanned, stats.skipped, stats.errors
    );
    Ok(stats)
}

/// Walks `root` and extracts metadata for every photo found.
///
/// Blocking; callers on the async runtime should use `spawn_blocking`.
pub fn scan_photos(
    root: &Path,
    recursive: bool,
    allowed_extensions: &HashSet<String>,
) -> Result<(Vec<PhotoMetadata>, ScanStats), AppError> {
    let (paths_tx, paths_rx) = crossbeam_channel::unbounded();
    let (metadata_tx, metadata_rx) = crossbeam_channel::unbounded();

    let stats = std::thread::scope(|scope| {
        let walker = scope.spawn(move || {
            crate::walker::start_walking(root, recursive, allowed_extensions, paths_tx)
        });
        let processor = scope.spawn(move || start_processing(paths_rx, metadata_tx));

        let walked = walker
            .join()
            .map_err(|_| AppError::Generic("walker thread panicked".into()))?;
        let processed = processor
            .join()
            .map_err(|_| AppError::Generic("processor thread panicked".into()))?;
        walked?;
        processed
    })?;

    let mut photos: Vec<PhotoMetadata> = metadata_rx.iter().collect();
    photos.sort_by(|a, b| a.path.cmp(&b.path));
    Ok((photos, stats))
}

/// Content fingerprint: SHA-256 of the file bytes.
pub fn fingerprint(path: &Path) -> Result<String, AppError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Returns `Ok(None)` when `path` is not a decodable image.
pub fn extract(path: &Path) -> Result<Option<PhotoMetadata>, AppError> {
    let stat = std::fs::metadata(path)?;

    log::trace!("Probing image format for: {:?}", path);
    let reader = image::io::Reader::open(path)?.with_guessed_format()?;
    let format = reader.format();
    let (width, height) = match reader.into_dimensions() {
        Ok(dims) => dims,
        Err(e) => {
            log::debug!("Could not decode {:?}: {}", path, e);
            return Ok(None);
        }
    };
    log::debug!("Dimensions for {:?}: {}x{}", path, width, height);

    let file_hash = fingerprint(path)?;
    log::debug!("Calculated hash for {:?}: {}", path, file_hash);

    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut metadata = PhotoMetadata {
        path: canonical.to_string_lossy().to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        size: stat.len(),
        created_time: stat.created().ok().map(DateTime::<Utc>::from),
        modified_time: stat.modified().ok().map(DateTime::<Utc>::from),
        width: Some(width),
        height: Some(height),
        format: format.map(|f| format!("{:?}", f).to_uppercase()),
        camera_make: None,
        camera_model: None,
        date_taken: None,
        gps_latitude: None,
        gps_longitude: None,
        file_hash,
    };

    log::trace!("Extracting EXIF data for image: {:?}", path);
    let mut buf_reader = BufReader::new(File::open(path)?);
    match Reader::new().read_from_container(&mut buf_reader) {
        Ok(exif) => apply_exif(&mut metadata, &exif),
        Err(e) => log::debug!("No EXIF data found for {:?}: {}", path, e),
    }

    Ok(Some(metadata))
}

fn apply_exif(metadata: &mut PhotoMetadata, exif: &Exif) {
    let text = |tag: Tag| {
        exif.get_field(tag, In::PRIMARY)
            .map(|f| f.display_value().to_string().trim_matches('"').to_string())
    };
    metadata.camera_make = text(Tag::Make);
    metadata.camera_model = text(Tag::Model);
    metadata.date_taken = text(Tag::DateTimeOriginal);
    metadata.gps_latitude = gps_coordinate(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
    metadata.gps_longitude = gps_coordinate(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");
}

fn gps_coordinate(exif: &Exif, tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    let degrees = match &field.value {
        Value::Rational(parts) if !parts.is_empty() => dms_to_degrees(
            &parts.iter().map(|v| v.to_f64()).collect::<Vec<_>>(),
        ),
        _ => return None,
    };
    let negative = exif
        .get_field(ref_tag, In::PRIMARY)
        .map(|f| f.display_value().to_string().contains(negative_ref))
        .unwrap_or(false);
    Some(if negative { -degrees } else { degrees })
}

fn dms_to_degrees(parts: &[f64]) -> f64 {
    parts
        .iter()
        .zip([1.0, 60.0, 3600.0])
        .map(|(value, divisor)| value / divisor)
        .sum()
}
