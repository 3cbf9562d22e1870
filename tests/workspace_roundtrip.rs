//! Integration tests: save a session into a container and reopen it.

use std::io::Cursor;

use deckpack::config::Config;
use deckpack::{ArchiveError, Workspace};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba};
use serde_json::json;
use tempfile::TempDir;

fn workspace(dir: &TempDir) -> Workspace {
    let config = Config {
        workspace_root: Some(dir.path().join("ws")),
        ..Config::default()
    };
    Workspace::new(&config)
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x * 5 % 256) as u8, (y * 3 % 256) as u8, 128, 255])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

// ── Round trip ───────────────────────────────────────────────

#[tokio::test]
async fn saved_project_reopens_with_same_document_and_assets() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);

    let small = png(50, 50);
    let logo = ws.save_asset("logo.png", &small).await.unwrap();
    let note = ws.save_asset("notes.bin", b"speaker notes").await.unwrap();
    let doc = json!({
        "title": "Quarterly",
        "slides": [
            { "background": logo.to_string() },
            { "attachments": [note.to_string()] }
        ]
    });

    let path = dir.path().join("deck.pkg");
    ws.save_project(&path, &doc).await.unwrap();
    let before = ws.list_assets().await.unwrap();

    let reopened = workspace(&dir);
    let loaded = reopened.open_project(&path).await.unwrap();
    assert_eq!(*loaded, doc);
    assert_eq!(reopened.list_assets().await.unwrap(), before);
    assert_eq!(reopened.resolve_asset(&logo.to_string()).await.unwrap(), small);
    assert_eq!(
        reopened.resolve_asset(&note.to_string()).await.unwrap(),
        b"speaker notes"
    );
}

#[tokio::test]
async fn small_png_is_stored_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let bytes = png(50, 50);
    let r = ws.save_asset("thumb.png", &bytes).await.unwrap();
    assert_eq!(r.filename(), "thumb.png");
    assert_eq!(ws.resolve_asset(&r.to_string()).await.unwrap(), bytes);
}

#[tokio::test]
async fn saving_twice_replaces_container() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let path = dir.path().join("deck.pkg");

    ws.save_project(&path, &json!({ "v": 1 })).await.unwrap();
    ws.save_project(&path, &json!({ "v": 2 })).await.unwrap();

    let reader = workspace(&dir);
    assert_eq!(*reader.open_project(&path).await.unwrap(), json!({ "v": 2 }));
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn upload_after_reopen_dedups_against_unpacked_assets() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let a = ws.save_asset("a.bin", b"shared bytes").await.unwrap();
    let path = dir.path().join("deck.pkg");
    ws.save_project(&path, &json!({ "asset": a.to_string() }))
        .await
        .unwrap();

    let reopened = workspace(&dir);
    reopened.open_project(&path).await.unwrap();
    let b = reopened.save_asset("b.bin", b"shared bytes").await.unwrap();
    assert_eq!(b, a);
    assert_eq!(reopened.list_assets().await.unwrap(), vec!["a.bin".to_string()]);
}

#[tokio::test]
async fn upload_after_cached_reopen_dedups_too() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let a = ws.save_asset("a.bin", b"shared bytes").await.unwrap();
    let path = dir.path().join("deck.pkg");
    ws.save_project(&path, &json!({})).await.unwrap();

    let reader = workspace(&dir);
    reader.open_project(&path).await.unwrap();
    reader.open_project(&path).await.unwrap();
    assert_eq!(reader.documents_parsed(), 1);
    assert_eq!(reader.save_asset("c.bin", b"shared bytes").await.unwrap(), a);
}

#[tokio::test]
async fn second_upload_under_same_name_keeps_both_payloads() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let a = ws.save_asset("logo.bin", b"first logo").await.unwrap();
    let b = ws.save_asset("logo.bin", b"second logo").await.unwrap();
    assert_ne!(a, b);
    assert_eq!(ws.resolve_asset(&a.to_string()).await.unwrap(), b"first logo");
    assert_eq!(ws.resolve_asset(&b.to_string()).await.unwrap(), b"second logo");
}

#[tokio::test]
async fn upload_colliding_with_unpacked_name_gets_fresh_name() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    ws.save_asset("logo.bin", b"archived logo").await.unwrap();
    let path = dir.path().join("deck.pkg");
    ws.save_project(&path, &json!({})).await.unwrap();

    let reopened = workspace(&dir);
    reopened.open_project(&path).await.unwrap();
    let fresh = reopened.save_asset("logo.bin", b"new logo").await.unwrap();
    assert_ne!(fresh.filename(), "logo.bin");
    assert_eq!(reopened.resolve_asset(&fresh.to_string()).await.unwrap(), b"new logo");
    assert_eq!(
        reopened.resolve_asset("asset://logo.bin").await.unwrap(),
        b"archived logo"
    );
}

// ── Failure modes ────────────────────────────────────────────

#[tokio::test]
async fn corrupted_container_is_invalid_format() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.pkg");
    let mut bytes = b"PK\x03\x04".to_vec();
    bytes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x11]);
    std::fs::write(&path, bytes).unwrap();

    let ws = workspace(&dir);
    let err = ws.open_project(&path).await.unwrap_err();
    assert!(matches!(err, ArchiveError::InvalidFormat(_)), "got {err:?}");
}

#[tokio::test]
async fn missing_project_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let err = ws.open_project(&dir.path().join("nope.pkg")).await.unwrap_err();
    assert!(matches!(err, ArchiveError::Io { .. }), "got {err:?}");
}

#[tokio::test]
async fn unresolvable_references_report_not_found() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    ws.ensure_session().await;

    for reference in ["asset://missing.png", "asset://..%2F..%2Fetc%2Fpasswd"] {
        let err = ws.resolve_asset(reference).await.unwrap_err();
        assert!(err.is_not_found(), "{reference}: {err:?}");
        assert_eq!(ws.serve_asset(reference).await.status, 404);
    }
}

#[tokio::test]
async fn serve_asset_sets_content_type() {
    let dir = TempDir::new().unwrap();
    let ws = workspace(&dir);
    let r = ws.save_asset("pic.png", &png(10, 10)).await.unwrap();
    let response = ws.serve_asset(&format!("{r}?v=2")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.content_type, "image/png");
}
