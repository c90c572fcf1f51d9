//! The seam between the timeline engine and the underlying chat client.
//!
//! [`EventStreamSource`] abstracts the per-room ordered event log: history
//! fetches in either direction, live push notifications, read receipts, and
//! full-text search. Network concerns (retry, backoff, timeouts) belong to
//! the implementation behind this trait, not to the engine.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::event::{Event, EventId, PaginationDirection, RoomId};

/// Basic info about a room, as returned by a successful peek.
#[derive(Clone, Debug)]
pub struct RoomMeta {
    pub room_id: RoomId,
    pub name: Option<String>,
}

/// A batch of events returned by a history fetch.
#[derive(Clone, Debug, Default)]
pub struct EventBatch {
    /// Events in server order (oldest first), regardless of fetch direction.
    pub events: Vec<Event>,
    /// Whether the source has more events beyond this batch in the fetched
    /// direction.
    pub more: bool,
}

/// The filter applied to a search request.
#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    /// Restrict the search to these rooms. `None` searches everywhere.
    pub rooms: Option<Vec<RoomId>>,
}

/// One matching event from a search response.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub event: Event,
    /// Display name of the room the event belongs to, if the server knows it.
    pub room_name: Option<String>,
}

/// A (possibly partial) search response.
#[derive(Clone, Debug, Default)]
pub struct SearchResponse {
    /// Matching events in the order the server ranked them
    /// (reverse-chronological within a room).
    pub results: Vec<SearchHit>,
    /// Substrings the server actually matched, for highlighting.
    pub highlights: Vec<String>,
    /// Continuation cursor for fetching the next batch, if any.
    pub next_batch: Option<String>,
    /// Total number of matches the server reported.
    pub count: u32,
}

/// Why a peek into a room failed.
#[derive(Debug, thiserror::Error)]
pub enum PeekError {
    /// The room does not permit previewing by non-members.
    #[error("peeking into this room is forbidden")]
    AccessForbidden,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The sending half of a room's live-event subscription, held by the
/// [`EventStreamSource`] implementation.
#[derive(Clone, Debug)]
pub struct LiveEventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl LiveEventSender {
    /// Pushes a live event to the subscriber. Returns `false` if the
    /// subscription has been torn down.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// A per-room live-event subscription.
///
/// Dropping this (or the owning view calling its teardown path) ends the
/// subscription deterministically; there is no global listener registry to
/// leak handlers into.
#[derive(Debug)]
pub struct RoomSubscription {
    room_id: RoomId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl RoomSubscription {
    /// Creates a connected sender/subscription pair for the given room.
    /// Intended for use by `EventStreamSource` implementations.
    pub fn channel(room_id: RoomId) -> (LiveEventSender, RoomSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LiveEventSender { tx }, RoomSubscription { room_id, rx })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Receives the next live event, or `None` once the source has dropped
    /// its sending half.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// An ordered per-room event log that can be queried for more history and
/// that pushes live events.
#[async_trait]
pub trait EventStreamSource: Send + Sync {
    /// Looks up a room without joining it. Fails with
    /// [`PeekError::AccessForbidden`] if the room is not previewable.
    async fn peek(&self, room_id: &RoomId) -> Result<RoomMeta, PeekError>;

    /// Fetches up to `count` events from the room's history.
    ///
    /// With `direction == Backwards`, returns the `count` events at or before
    /// `anchor` (the newest events in the room when `anchor` is `None`).
    /// With `direction == Forwards`, returns the `count` events strictly
    /// after `anchor` (the oldest events when `anchor` is `None`).
    /// Returned events are always in server order, oldest first.
    async fn events_in_range(
        &self,
        room_id: &RoomId,
        anchor: Option<&EventId>,
        count: usize,
        direction: PaginationDirection,
    ) -> anyhow::Result<EventBatch>;

    /// Subscribes to live events for the given room.
    async fn subscribe_live(&self, room_id: &RoomId) -> anyhow::Result<RoomSubscription>;

    /// Sends a read receipt for the given event.
    async fn send_receipt(&self, room_id: &RoomId, event_id: &EventId) -> anyhow::Result<()>;

    /// Runs a full-text search over the source's event history.
    async fn search_events(
        &self,
        filter: &SearchFilter,
        term: &str,
    ) -> anyhow::Result<SearchResponse>;

    /// Fetches the next batch of an earlier search, using the continuation
    /// cursor from its response.
    async fn search_more(&self, next_batch: &str) -> anyhow::Result<SearchResponse>;
}
