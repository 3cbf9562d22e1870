//! Content-addressed asset storage for one session.
//!
//! Every payload is identified by its [`content_hash`].  Within a store
//! the hash → filename index guarantees a payload is written at most
//! once; existing files are never overwritten.  Documents refer to
//! stored files through [`AssetRef`] strings of the form
//! `asset://<filename>`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use base64::Engine as _;
use percent_encoding::percent_decode_str;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{ArchiveError, IoContext, Result};
use crate::hash::content_hash;
use crate::transcode::{looks_like_image, FormatTag, Transcoded, Transcoder};

/// URI scheme used for asset references inside documents.
pub const ASSET_SCHEME: &str = "asset://";

// ── AssetRef ─────────────────────────────────────────────────

/// A logical reference to a stored asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetRef {
    filename: String,
}

impl AssetRef {
    /// Build a reference from a plain filename (no decoding applied).
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// Parse `asset://<name>[?query][/]` into a reference.
    ///
    /// The scheme is optional, the query string and a single trailing
    /// slash are dropped and the remainder is percent-decoded.
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw.strip_prefix(ASSET_SCHEME).unwrap_or(raw);
        let rest = match rest.find('?') {
            Some(i) => &rest[..i],
            None => rest,
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);
        let decoded = percent_decode_str(rest)
            .decode_utf8()
            .map_err(|_| ArchiveError::NotFound(raw.to_string()))?;
        if decoded.is_empty() {
            return Err(ArchiveError::NotFound(raw.to_string()));
        }
        Ok(Self::new(decoded.into_owned()))
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ASSET_SCHEME}{}", self.filename)
    }
}

/// Join `filename` under `root`, refusing anything that could escape it.
pub fn contained_path(root: &Path, filename: &str) -> Result<PathBuf> {
    let rel = Path::new(filename);
    let mut saw_normal = false;
    for component in rel.components() {
        match component {
            Component::Normal(_) => saw_normal = true,
            _ => return Err(ArchiveError::PathEscape(filename.to_string())),
        }
    }
    if !saw_normal || filename.contains('\\') {
        return Err(ArchiveError::PathEscape(filename.to_string()));
    }
    Ok(root.join(rel))
}

// ── Upload decoding ──────────────────────────────────────────

/// Decode an upload payload: optional `data:<mime>;base64,` prefix
/// followed by base64 text.
pub fn decode_upload(payload: &str) -> Result<Vec<u8>> {
    let body = payload.trim();
    let body = if body.starts_with("data:") {
        match body.find(";base64,") {
            Some(i) => &body[i + ";base64,".len()..],
            None => {
                return Err(ArchiveError::Upload(
                    "data URI is not base64-encoded".to_string(),
                ))
            }
        }
    } else {
        body
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ArchiveError::Upload(e.to_string()))
}

// ── AssetStore ───────────────────────────────────────────────

/// Asset directory of a single session plus its dedup index.
#[derive(Debug)]
pub struct AssetStore {
    root: PathBuf,
    transcoder: Transcoder,
    /// content hash → stored filename
    index: Mutex<HashMap<String, String>>,
    closed: AtomicBool,
}

impl AssetStore {
    /// Create a store rooted at `root` (the directory is not created).
    pub fn new(root: impl Into<PathBuf>, transcoder: Transcoder) -> Self {
        Self {
            root: root.into(),
            transcoder,
            index: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse further writes.  Called when the owning session is torn
    /// down so late writers cannot resurrect its directory.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.index.lock().expect("asset index poisoned").clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The assets directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of hashes currently recorded in the dedup index.
    pub fn indexed(&self) -> usize {
        self.index.lock().expect("asset index poisoned").len()
    }

    /// Dedup lookup.  Entries whose file has vanished are dropped so the
    /// payload gets written again.
    async fn lookup(&self, hash: &str) -> Option<AssetRef> {
        let filename = self
            .index
            .lock()
            .expect("asset index poisoned")
            .get(hash)
            .cloned()?;
        if fs::try_exists(self.root.join(&filename)).await.unwrap_or(false) {
            debug!(%hash, %filename, "asset dedup hit");
            return Some(AssetRef::new(filename));
        }
        self.index.lock().expect("asset index poisoned").remove(hash);
        None
    }

    fn record(&self, hash: String, filename: &str) {
        self.index
            .lock()
            .expect("asset index poisoned")
            .insert(hash, filename.to_string());
    }

    /// Store `bytes` as `img_<hash>.<ext>` and return its reference.
    pub async fn put(&self, bytes: &[u8]) -> Result<AssetRef> {
        let hash = content_hash(bytes);
        if let Some(existing) = self.lookup(&hash).await {
            return Ok(existing);
        }

        let stem = format!("img_{hash}");
        if let Some(existing) = self.find_by_stem(&stem).await {
            self.record(hash, &existing);
            return Ok(AssetRef::new(existing));
        }

        let transcoded = self.maybe_transcode(bytes).await;
        let filename = format!("{stem}.{}", transcoded.format.extension());
        self.write_once(&filename, &transcoded.bytes).await?;
        self.record(hash, &filename);
        Ok(AssetRef::new(filename))
    }

    /// Store `bytes` under a caller-chosen filename.
    ///
    /// The base name is kept; the extension is only replaced when the
    /// transcoder re-encoded the payload into a different format.  An
    /// existing file is never overwritten: when the name is taken by
    /// different content a hash suffix is appended to the stem.
    pub async fn put_named(&self, filename: &str, bytes: &[u8]) -> Result<AssetRef> {
        let hash = content_hash(bytes);
        if let Some(existing) = self.lookup(&hash).await {
            return Ok(existing);
        }

        let requested = base_name(filename)?;
        let requested_path = contained_path(&self.root, &requested)?;
        if stored_hash(&requested_path).await.as_deref() == Some(hash.as_str()) {
            self.record(hash, &requested);
            return Ok(AssetRef::new(requested));
        }

        let (stem, ext) = split_extension(&requested);
        let transcoded = self.maybe_transcode(bytes).await;
        let ext = match ext {
            Some(ext) if !transcoded.reencoded || same_format(ext, transcoded.format) => ext,
            _ => transcoded.format.extension(),
        };

        let final_name = self.claim_name(stem, ext, &hash, &transcoded.bytes).await?;
        self.write_once(&final_name, &transcoded.bytes).await?;
        self.record(hash, &final_name);
        Ok(AssetRef::new(final_name))
    }

    /// First of `<stem>.<ext>`, `<stem>_<hash8>.<ext>`, `<stem>_<hash>.<ext>`
    /// that is either free or already holds exactly `payload`.
    async fn claim_name(
        &self,
        stem: &str,
        ext: &str,
        hash: &str,
        payload: &[u8],
    ) -> Result<String> {
        let payload_hash = content_hash(payload);
        let candidates = [
            format!("{stem}.{ext}"),
            format!("{stem}_{}.{ext}", &hash[..8]),
            format!("{stem}_{hash}.{ext}"),
        ];
        for name in candidates {
            let path = contained_path(&self.root, &name)?;
            match stored_hash(&path).await {
                None => return Ok(name),
                Some(existing) if existing == payload_hash => return Ok(name),
                Some(_) => debug!(%name, "asset name taken by different content"),
            }
        }
        Err(ArchiveError::io(
            format!("no free asset name for {stem}.{ext}"),
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        ))
    }

    /// Rebuild the dedup index from the files on disk.  Used after a
    /// container has been unpacked into the assets directory.
    pub async fn reindex(&self) -> Result<usize> {
        let root = self.root.clone();
        let hashed = tokio::task::spawn_blocking(move || hash_dir(&root))
            .await
            .map_err(|e| ArchiveError::io("index assets", std::io::Error::other(e)))??;

        let mut index = self.index.lock().expect("asset index poisoned");
        let mut added = 0usize;
        for (hash, filename) in hashed {
            if let std::collections::hash_map::Entry::Vacant(slot) = index.entry(hash) {
                slot.insert(filename);
                added += 1;
            }
        }
        debug!(root = %self.root.display(), added, "asset index rebuilt");
        Ok(added)
    }

    /// Read the bytes behind `reference`.
    ///
    /// Missing files and references that would escape the assets
    /// directory are reported as [`ArchiveError::NotFound`] /
    /// [`ArchiveError::PathEscape`]; callers render a placeholder.
    pub async fn resolve(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.resolve_path(reference)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "asset unresolved");
                Err(ArchiveError::NotFound(reference.to_string()))
            }
        }
    }

    /// On-disk location of `reference` (the file may not exist).
    pub fn resolve_path(&self, reference: &str) -> Result<PathBuf> {
        let parsed = AssetRef::parse(reference)?;
        contained_path(&self.root, parsed.filename())
    }

    /// Sorted filenames of every stored asset.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).at("read assets dir", &self.root),
        };
        let mut names = Vec::new();
        while let Some(entry) = rd.next_entry().await.at("read assets dir", &self.root)? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn find_by_stem(&self, stem: &str) -> Option<String> {
        let mut rd = fs::read_dir(&self.root).await.ok()?;
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if split_extension(&name).0 == stem {
                return Some(name);
            }
        }
        None
    }

    async fn maybe_transcode(&self, bytes: &[u8]) -> Transcoded {
        if !looks_like_image(bytes) {
            return Transcoded {
                bytes: bytes.to_vec(),
                format: FormatTag::Bin,
                reencoded: false,
            };
        }
        let transcoder = self.transcoder.clone();
        let owned = bytes.to_vec();
        match tokio::task::spawn_blocking(move || transcoder.transcode(&owned)).await {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "transcode task failed, storing original");
                Transcoded {
                    bytes: bytes.to_vec(),
                    format: FormatTag::sniff(bytes),
                    reencoded: false,
                }
            }
        }
    }

    /// Write `bytes` as `filename` unless it already exists.  The data
    /// goes to a hidden temp file first and is renamed into place.
    async fn write_once(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(ArchiveError::SessionClosed(self.root.display().to_string()));
        }
        let path = contained_path(&self.root, filename)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "asset already on disk");
            return Ok(());
        }
        fs::create_dir_all(&self.root)
            .await
            .at("create assets dir", &self.root)?;
        let tmp = self
            .root
            .join(format!(".{filename}.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, bytes).await.at("write asset", &tmp)?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e).at("commit asset", &path);
        }
        debug!(path = %path.display(), bytes = bytes.len(), "asset written");
        Ok(())
    }
}

/// Content hash of the file at `path`, or `None` if it cannot be read.
async fn stored_hash(path: &Path) -> Option<String> {
    fs::read(path).await.ok().map(|bytes| content_hash(&bytes))
}

/// (hash, filename) for every visible regular file directly under `root`,
/// sorted by filename.  A missing root yields nothing.
fn hash_dir(root: &Path) -> Result<Vec<(String, String)>> {
    let rd = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).at("read assets dir", root),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.at("read assets dir", root)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let bytes = std::fs::read(entry.path()).at("read asset", &entry.path())?;
        out.push((content_hash(&bytes), name));
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

/// Validate a caller-supplied filename and reduce it to a bare name.
fn base_name(filename: &str) -> Result<String> {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.starts_with('.'))
        .ok_or_else(|| ArchiveError::PathEscape(filename.to_string()))?;
    Ok(name.to_string())
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

fn same_format(ext: &str, format: FormatTag) -> bool {
    let ext = ext.to_ascii_lowercase();
    let ext = if ext == "jpeg" { "jpg" } else { ext.as_str() };
    ext == format.extension()
}

// ── Tests ────────────────────────────────────────────────────
