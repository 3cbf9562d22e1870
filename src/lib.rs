//! deckpack: project workspace and asset archive manager for a slide
//! editor.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod archive;
pub mod assets;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod migrate;
pub mod protocol;
pub mod transcode;
pub mod workspace;

pub use assets::{AssetRef, AssetStore};
pub use error::{ArchiveError, Result};
pub use workspace::Workspace;

/// A slide document: an arbitrary JSON tree owned by the editor.
pub type Document = serde_json::Value;

/// Return the deckpack home directory.
///
/// Resolution order:
/// 1. `DECKPACK_HOME` environment variable
/// 2. `$HOME/.deckpack`
pub fn deckpack_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("DECKPACK_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".deckpack")
    }
}
