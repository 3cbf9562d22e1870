//! `asset://` scheme handler support for a host UI shell.

use crate::assets::AssetStore;

/// A response for one `asset://` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl AssetResponse {
    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain; charset=utf-8",
            body: b"asset not found".to_vec(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// MIME type for a stored asset, by extension.  Unknown extensions are
/// served as PNG.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "svg" => "image/svg+xml",
        "gif" => "image/gif",
        _ => "image/png",
    }
}

/// Resolve `reference` against `store`.  Missing or rejected references
/// yield a 404 response.
pub async fn serve_asset(store: &AssetStore, reference: &str) -> AssetResponse {
    let path = match store.resolve_path(reference) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(reference, error = %e, "asset request rejected");
            return AssetResponse::not_found();
        }
    };
    match tokio::fs::read(&path).await {
        Ok(body) => AssetResponse {
            status: 200,
            content_type: content_type_for(&path.to_string_lossy()),
            body,
        },
        Err(_) => AssetResponse::not_found(),
    }
}
