//! Project container packaging.
//!
//! A project file is a zip container with the document at
//! `project.json` and every stored asset under `assets/`.  Anything
//! that does not open as such a container is treated as a bare legacy
//! JSON document and run through [`crate::migrate`].

use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::assets::AssetStore;
use crate::error::{ArchiveError, IoContext, Result};
use crate::migrate;
use crate::Document;

/// Manifest entry at the container root.
pub const MANIFEST_NAME: &str = "project.json";
/// Directory entry holding the assets.
pub const ASSETS_DIR: &str = "assets";

const ZIP_MAGIC: &[u8; 2] = b"PK";

/// Loose container sniff: only the two-byte zip magic is checked.
pub fn looks_like_container(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ArchiveError::io(what, std::io::Error::other(e)))?
}

/// Extract every entry of the container in `bytes` into `dest`.
pub async fn unpack(bytes: Vec<u8>, dest: &Path) -> Result<()> {
    let dest = dest.to_path_buf();
    blocking("unpack container", move || {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        // Entry names are sanitised by `extract`; nothing lands outside `dest`.
        archive.extract(&dest)?;
        debug!(entries = archive.len(), dest = %dest.display(), "container unpacked");
        Ok(())
    })
    .await
}

/// Read and parse the manifest from an unpacked session root.
pub async fn read_manifest(session_root: &Path) -> Result<Document> {
    let path = session_root.join(MANIFEST_NAME);
    let raw = match fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArchiveError::InvalidProject(format!(
                "container has no {MANIFEST_NAME}"
            )))
        }
        Err(e) => return Err(e).at("read manifest", &path),
    };
    Ok(serde_json::from_slice(&raw)?)
}

/// Decode a project file's bytes into a document, populating
/// `session_root` (container) or `store` (legacy migration).
pub async fn open_bytes(
    bytes: Vec<u8>,
    session_root: &Path,
    store: &AssetStore,
) -> Result<Document> {
    if looks_like_container(&bytes) {
        let attempt = match unpack(bytes.clone(), session_root).await {
            Ok(()) => read_manifest(session_root).await,
            Err(e) => Err(e),
        };
        match attempt {
            Ok(doc) => {
                store.reindex().await?;
                return Ok(doc);
            }
            Err(e) => {
                warn!(error = %e, "container open failed, retrying as legacy JSON");
            }
        }
    }
    migrate::migrate(&bytes, store).await
}

/// Populate a fresh session from a project file without keeping the
/// decoded document.  Used when the document itself came from cache.
pub async fn restore_assets(
    bytes: Vec<u8>,
    session_root: &Path,
    store: &AssetStore,
) -> Result<()> {
    if looks_like_container(&bytes) && unpack(bytes.clone(), session_root).await.is_ok() {
        store.reindex().await?;
        return Ok(());
    }
    migrate::migrate(&bytes, store).await.map(|_| ())
}

/// Write `document` as the session manifest and package it together
/// with `assets_dir` into a container at `path`.
///
/// The container is assembled in a sibling temp file and renamed over
/// `path` once complete.
pub async fn save(
    path: &Path,
    document: &Document,
    session_root: &Path,
    assets_dir: &Path,
) -> Result<()> {
    let manifest = serde_json::to_vec_pretty(document)?;
    fs::create_dir_all(session_root)
        .await
        .at("create session dir", session_root)?;
    let manifest_path = session_root.join(MANIFEST_NAME);
    fs::write(&manifest_path, &manifest)
        .await
        .at("write manifest", &manifest_path)?;

    let target = path.to_path_buf();
    let assets = assets_dir.to_path_buf();
    let assets_written = blocking("write container", move || {
        write_container(&target, &manifest, &assets)
    })
    .await?;

    info!(path = %path.display(), assets = assets_written, "project saved");
    Ok(())
}

fn write_container(target: &Path, manifest: &[u8], assets_dir: &Path) -> Result<usize> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let tmp = target.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

    match build_container(&tmp, manifest, assets_dir) {
        Ok(count) => {
            if let Err(e) = std::fs::rename(&tmp, target) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e).at("replace", target);
            }
            Ok(count)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn build_container(tmp: &Path, manifest: &[u8], assets_dir: &Path) -> Result<usize> {
    let file = File::create(tmp).at("create container", tmp)?;
    let mut zip = ZipWriter::new(file);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    // Image payloads are already compressed.
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file(MANIFEST_NAME, deflated)?;
    zip.write_all(manifest).at("write container", tmp)?;

    zip.add_directory(format!("{ASSETS_DIR}/"), stored)?;
    let mut count = 0usize;
    for (rel, abs) in collect_files(assets_dir)? {
        let bytes = std::fs::read(&abs).at("read asset", &abs)?;
        zip.start_file(format!("{ASSETS_DIR}/{rel}"), stored)?;
        zip.write_all(&bytes).at("write container", tmp)?;
        count += 1;
    }

    let file = zip.finish()?;
    file.sync_all().at("sync container", tmp)?;
    Ok(count)
}

/// Every regular file below `root` as (`/`-joined relative name, path),
/// sorted, skipping hidden temp files.  A missing root yields nothing.
fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut stack = vec![(String::new(), root.to_path_buf())];
    while let Some((prefix, dir)) = stack.pop() {
        let rd = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).at("read assets dir", &dir),
        };
        for entry in rd {
            let entry = entry.at("read assets dir", &dir)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let kind = entry.file_type().at("stat", &entry.path())?;
            if kind.is_dir() {
                stack.push((rel, entry.path()));
            } else if kind.is_file() {
                out.push((rel, entry.path()));
            }
        }
    }
    out.sort();
    Ok(out)
}
