//! Client-side snapshot builder.
//!
//! Walks a local directory tree and produces the [`Record`]s a client would
//! send to the collector, then writes them in either snapshot shape.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::codec::{self, SnapshotFormat};
use crate::models::Record;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub machine: String,
    pub ip: String,
    /// Marks every record as living on the named external device.
    pub external: Option<String>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
    /// Compute a SHA-256 of every regular file.
    pub hash: bool,
}

pub fn scan_directory(options: &ScanOptions) -> Result<Vec<Record>> {
    let root = &options.root;
    if !root.exists() {
        bail!("Scan root does not exist: {}", root.display());
    }
    if options.machine.is_empty() || options.ip.is_empty() {
        bail!("machine and ip must not be empty");
    }

    let mut default_excludes = vec!["**/.git/**".to_string()];
    default_excludes.extend(options.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut records = Vec::new();

    let walker = WalkDir::new(root).follow_links(options.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if !rel_str.is_empty() && exclude_set.is_match(&rel_str) {
            continue;
        }

        match entry_to_record(path, entry.file_type().is_dir(), options) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping entry"),
        }
    }

    // Sort for deterministic ordering
    records.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(records)
}

fn entry_to_record(path: &Path, is_dir: bool, options: &ScanOptions) -> Result<Record> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);

    let mut record = Record::new(
        path.to_string_lossy().to_string(),
        metadata.len() as i64,
        options.machine.clone(),
        options.ip.clone(),
    );
    record.is_dir = is_dir;
    record.modified_at = modified;

    if let Some(device) = &options.external {
        record.on_external_source = true;
        record.external_name = device.clone();
    }

    if !is_dir {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        record.file_mime = detect_mime(&extension).to_string();
        record.file_type = extension;
        if options.hash {
            record.content_hash = hash_file(path)?;
        }
    }

    Ok(record)
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Detect a MIME type from a lowercase file extension.
fn detect_mime(extension: &str) -> &'static str {
    match extension {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "text/yaml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "" => "",
        _ => "application/octet-stream",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// CLI entry point: scan `options.root` and write the snapshot to `out`.
pub async fn run_scan(options: &ScanOptions, out: &Path, format: SnapshotFormat) -> Result<()> {
    let records = scan_directory(options)?;

    if out.exists() {
        bail!("Refusing to overwrite existing file: {}", out.display());
    }

    match format {
        SnapshotFormat::Relational => codec::write_relational(out, &records).await?,
        SnapshotFormat::FlatList => std::fs::write(out, codec::encode_flat(&records)?)?,
    }

    println!("scan {}", options.root.display());
    println!("  records: {}", records.len());
    println!(
        "  directories: {}",
        records.iter().filter(|r| r.is_dir).count()
    );
    println!("  format: {}", format.as_str());
    println!("  written: {}", out.display());
    println!("ok");

    Ok(())
}
