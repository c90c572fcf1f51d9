//! Saving and restoring per-room scroll positions across sessions.
//!
//! Positions are kept as a single JSON document mapping room IDs to their
//! saved [`ScrollState`]. Rooms that were at the live tail never appear in
//! the map; reopening them just starts at the bottom.

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::event::RoomId;
use crate::room_view::ScrollState;

/// Loads saved scroll positions from `path`.
///
/// A missing file is not an error: it simply means no positions have been
/// saved yet. A corrupt file is logged and treated the same way, since stale
/// scroll positions are never worth failing startup over.
pub async fn load_scroll_positions(path: &Path) -> anyhow::Result<BTreeMap<RoomId, ScrollState>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BTreeMap::new());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("reading scroll positions from {}", path.display()));
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(positions) => Ok(positions),
        Err(e) => {
            warn!("discarding unreadable scroll position file {}: {e}", path.display());
            Ok(BTreeMap::new())
        }
    }
}

/// Saves scroll positions to `path`, creating parent directories as needed.
pub async fn save_scroll_positions(
    path: &Path,
    positions: &BTreeMap<RoomId, ScrollState>,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(positions).context("serializing scroll positions")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing scroll positions to {}", path.display()))?;
    debug!(rooms = positions.len(), "saved scroll positions");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;
    use std::path::PathBuf;

    fn scratch_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("roomline-test-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn test_round_trip() {
        let path = scratch_file("round-trip.json");
        let mut positions = BTreeMap::new();
        positions.insert(
            RoomId::from("!a:example.org"),
            ScrollState { focused_event_id: EventId::from("$1"), pixel_offset: 120.5 },
        );
        positions.insert(
            RoomId::from("!b:example.org"),
            ScrollState { focused_event_id: EventId::from("$9"), pixel_offset: 0.0 },
        );

        save_scroll_positions(&path, &positions).await.unwrap();
        let loaded = load_scroll_positions(&path).await.unwrap();
        assert_eq!(loaded, positions);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let path = scratch_file("does-not-exist.json");
        let loaded = load_scroll_positions(&path).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_discarded() {
        let path = scratch_file("corrupt.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        let loaded = load_scroll_positions(&path).await.unwrap();
        assert!(loaded.is_empty());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
