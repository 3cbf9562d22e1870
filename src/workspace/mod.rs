//! Session-scoped workspace: the public face of the archive manager.
//!
//! A [`Workspace`] owns at most one live [`Session`], a working
//! directory `session-<uuid>/` under the configured root holding the
//! unpacked manifest and an `assets/` directory.  Opening a project
//! always starts a fresh session; the previous one is closed and its
//! directory removed before the new identity is minted.  All public
//! operations are serialised through one async mutex.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{self, ASSETS_DIR};
use crate::assets::{decode_upload, AssetRef, AssetStore};
use crate::cache::{spawn_sweeper, CacheStats, Clock, DocumentCache, SystemClock};
use crate::config::{CacheConfig, Config};
use crate::error::{ArchiveError, IoContext, Result};
use crate::protocol::{self, AssetResponse};
use crate::transcode::Transcoder;
use crate::Document;

const SESSION_PREFIX: &str = "session-";

// ── Session ──────────────────────────────────────────────────

/// One on-disk working directory.
#[derive(Debug)]
pub struct Session {
    id: String,
    root: PathBuf,
    assets: AssetStore,
}

/// Shared handle to the current session.
pub type SessionHandle = Arc<Session>;

impl Session {
    fn new(parent: &Path, transcoder: Transcoder) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let root = parent.join(format!("{SESSION_PREFIX}{id}"));
        let assets = AssetStore::new(root.join(ASSETS_DIR), transcoder);
        Self { id, root, assets }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Session working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    /// Best-effort creation of the session directories.
    async fn prepare(&self) {
        if let Err(e) = fs::create_dir_all(self.assets.root()).await {
            warn!(session_id = %self.id, error = %e, "could not create session dirs");
        }
    }

    /// Close the asset store and remove the directory tree.
    async fn teardown(&self) {
        self.assets.close();
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(session_id = %self.id, "session dir removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id = %self.id, error = %e, "session teardown failed"),
        }
    }
}

// ── Workspace ────────────────────────────────────────────────

/// Owner of the current session, the document cache and the sweeper.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    transcoder: Transcoder,
    cache_config: CacheConfig,
    current: AsyncMutex<Option<SessionHandle>>,
    cache: Arc<DocumentCache>,
    parses: AtomicU64,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Workspace {
    /// Build a workspace from configuration, sweeping stale sessions
    /// left under the workspace root by a previous run.
    pub fn new(config: &Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let root = config.workspace_root();
        let removed = sweep_stale_sessions(&root);
        if removed > 0 {
            info!(root = %root.display(), removed, "stale sessions removed");
        }
        Self {
            root,
            transcoder: Transcoder::new(config.transcode.clone()),
            cache_config: config.cache.clone(),
            current: AsyncMutex::new(None),
            cache: Arc::new(DocumentCache::from_config(&config.cache, clock)),
            parses: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Start the periodic cache sweep.  Must be called inside a tokio
    /// runtime; calling it twice is a no-op.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().expect("sweeper slot poisoned");
        if slot.is_some() {
            return;
        }
        *slot = Some(spawn_sweeper(
            self.cache.clone(),
            self.cache_config.sweep_interval(),
            self.cancel.child_token(),
        ));
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().expect("sweeper slot poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "cache sweeper join failed");
            }
        }
    }

    /// Parent directory of every session.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of documents decoded from disk (cache hits excluded).
    pub fn documents_parsed(&self) -> u64 {
        self.parses.load(Ordering::Relaxed)
    }

    /// Identity of the live session, if any.
    pub async fn current_session_id(&self) -> Option<String> {
        self.current.lock().await.as_ref().map(|s| s.id.clone())
    }

    /// Return the live session, creating one if none exists.  Missing
    /// directories of an existing session are re-created.
    pub async fn ensure_session(&self) -> SessionHandle {
        let mut current = self.current.lock().await;
        self.ensure_locked(&mut current).await
    }

    async fn ensure_locked(&self, current: &mut Option<SessionHandle>) -> SessionHandle {
        if let Some(session) = current.clone() {
            if !fs::try_exists(session.assets.root()).await.unwrap_or(false) {
                debug!(session_id = %session.id, "session dirs missing, re-creating");
                session.prepare().await;
            }
            return session;
        }
        self.replace_locked(current).await
    }

    /// Drop the current session (if any) and mint a new one.
    async fn replace_locked(&self, current: &mut Option<SessionHandle>) -> SessionHandle {
        if let Some(old) = current.take() {
            old.teardown().await;
        }
        let session = Arc::new(Session::new(&self.root, self.transcoder.clone()));
        session.prepare().await;
        info!(session_id = %session.id, root = %session.root.display(), "session started");
        *current = Some(session.clone());
        session
    }

    /// Assets directory of the live session, for direct file serving.
    pub async fn asset_root(&self) -> PathBuf {
        self.ensure_session().await.assets.root().to_path_buf()
    }

    /// Open a project file into a brand-new session.
    ///
    /// A cached document is returned when the file's modification time
    /// is unchanged; the session is still repopulated from the file so
    /// its references resolve.
    pub async fn open_project(&self, path: &Path) -> Result<Arc<Document>> {
        let mut current = self.current.lock().await;

        let key = fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        let meta = fs::metadata(&key).await.at("stat project", &key)?;
        let mtime = meta.modified().at("read mtime of", &key)?;
        let bytes = fs::read(&key).await.at("read project", &key)?;

        let session = self.replace_locked(&mut current).await;

        if let Some(doc) = self.cache.get_if_current(&key, mtime) {
            archive::restore_assets(bytes, &session.root, &session.assets).await?;
            debug!(path = %key.display(), session_id = %session.id, "project served from cache");
            return Ok(doc);
        }

        let doc = Arc::new(archive::open_bytes(bytes, &session.root, &session.assets).await?);
        self.parses.fetch_add(1, Ordering::Relaxed);
        self.cache.put(&key, mtime, doc.clone());
        info!(path = %key.display(), session_id = %session.id, "project opened");
        Ok(doc)
    }

    /// Package `document` and the live session's assets into `path`.
    pub async fn save_project(&self, path: &Path, document: &Document) -> Result<()> {
        let mut current = self.current.lock().await;
        let session = self.ensure_locked(&mut current).await;
        archive::save(path, document, &session.root, session.assets.root()).await?;
        let key = fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        self.cache.remove(&key);
        Ok(())
    }

    /// Store uploaded bytes under a suggested filename.
    pub async fn save_asset(&self, filename: &str, bytes: &[u8]) -> Result<AssetRef> {
        let mut current = self.current.lock().await;
        let session = self.ensure_locked(&mut current).await;
        let reference = session.assets.put_named(filename, bytes).await?;
        debug!(session_id = %session.id, reference = %reference, "asset saved");
        Ok(reference)
    }

    /// Store an upload given as base64 text, with or without a
    /// `data:<mime>;base64,` prefix.
    pub async fn save_asset_base64(&self, filename: &str, payload: &str) -> Result<AssetRef> {
        let bytes = decode_upload(payload)?;
        self.save_asset(filename, &bytes).await
    }

    /// Read the bytes behind a reference in the live session.
    pub async fn resolve_asset(&self, reference: &str) -> Result<Vec<u8>> {
        let session = self.current.lock().await.clone();
        match session {
            Some(session) => session.assets.resolve(reference).await,
            None => Err(ArchiveError::NotFound(reference.to_string())),
        }
    }

    /// Scheme-handler view of [`resolve_asset`](Self::resolve_asset):
    /// never fails, missing assets become a 404 response.
    pub async fn serve_asset(&self, reference: &str) -> AssetResponse {
        let session = self.current.lock().await.clone();
        match session {
            Some(session) => protocol::serve_asset(&session.assets, reference).await,
            None => AssetResponse::not_found(),
        }
    }

    /// Sorted filenames in the live session's assets directory.
    pub async fn list_assets(&self) -> Result<Vec<String>> {
        let session = self.current.lock().await.clone();
        match session {
            Some(session) => session.assets.list().await,
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Remove every `session-*` directory under `root`.  Errors are logged
/// and otherwise ignored.
fn sweep_stale_sessions(root: &Path) -> usize {
    let rd = match std::fs::read_dir(root) {
        Ok(rd) => rd,
        Err(_) => return 0,
    };
    let mut removed = 0usize;
    for entry in rd.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(SESSION_PREFIX) {
            continue;
        }
        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "stale session not removed")
            }
        }
    }
    removed
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn workspace(dir: &TempDir) -> Workspace {
        let config = Config {
            workspace_root: Some(dir.path().join("ws")),
            ..Config::default()
        };
        Workspace::new(&config)
    }

    #[tokio::test]
    async fn ensure_session_is_lazy_and_stable() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        assert!(ws.current_session_id().await.is_none());

        let a = ws.ensure_session().await;
        let b = ws.ensure_session().await;
        assert_eq!(a.id(), b.id());
        assert!(a.assets().root().is_dir());
    }

    #[tokio::test]
    async fn ensure_session_recreates_removed_dirs() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let s = ws.ensure_session().await;
        ws.save_asset("a.bin", b"aa").await.unwrap();
        std::fs::remove_dir_all(s.root()).unwrap();

        let again = ws.ensure_session().await;
        assert_eq!(again.id(), s.id());
        assert!(again.assets().root().is_dir());

        // The stale index entry is rewritten rather than trusted.
        let r = ws.save_asset("a.bin", b"aa").await.unwrap();
        assert_eq!(ws.resolve_asset(&r.to_string()).await.unwrap(), b"aa");
    }

    #[tokio::test]
    async fn open_replaces_session_and_removes_old_dir() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let first = ws.ensure_session().await;
        ws.save_asset("x.bin", b"x").await.unwrap();

        let path = dir.path().join("doc.json");
        std::fs::write(&path, br#"{"a":1}"#).unwrap();
        ws.open_project(&path).await.unwrap();

        let second = ws.current_session_id().await.unwrap();
        assert_ne!(second, first.id());
        assert!(!first.root().exists());
        assert!(first.assets().is_closed());
        assert!(ws.list_assets().await.unwrap().is_empty());
    }

    #[test]
    fn construction_sweeps_stale_sessions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir_all(root.join("session-old/assets")).unwrap();
        std::fs::create_dir_all(root.join("keep-me")).unwrap();
        let _ws = workspace(&dir);
        assert!(!root.join("session-old").exists());
        assert!(root.join("keep-me").exists());
    }

    #[tokio::test]
    async fn resolve_without_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let err = ws.resolve_asset("asset://a.png").await.unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn serve_without_session_is_404_and_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        assert_eq!(ws.serve_asset("asset://a.png").await.status, 404);
        assert!(ws.current_session_id().await.is_none());
        let sessions = std::fs::read_dir(ws.root())
            .map(|rd| rd.flatten().count())
            .unwrap_or(0);
        assert_eq!(sessions, 0);
    }

    #[tokio::test]
    async fn base64_upload_strips_prefix() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let r = ws
            .save_asset_base64("note.txt", "data:text/plain;base64,aGk=")
            .await
            .unwrap();
        assert_eq!(r.filename(), "note.txt");
        assert_eq!(ws.resolve_asset(&r.to_string()).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn save_without_session_creates_one() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let path = dir.path().join("p.pkg");
        ws.save_project(&path, &json!({"t": 1})).await.unwrap();
        assert!(path.is_file());
        assert!(ws.current_session_id().await.is_some());
    }

    #[tokio::test]
    async fn sweeper_start_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        ws.start_sweeper();
        ws.start_sweeper();
        ws.shutdown().await;
    }
}
