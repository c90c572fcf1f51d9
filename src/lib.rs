//! Roomline is a headless room-timeline engine for federated chat clients.
//!
//! It owns the non-rendering half of a room view: a bounded window over the
//! room's event history, demand-driven pagination in both directions, local
//! echo reconciliation, read receipts with a decaying "ghost" marker, an
//! in-room search overlay, and per-room scroll position persistence.
//!
//! The engine talks to the underlying chat stack through one seam, the
//! [`EventStreamSource`] trait, and talks to the rendering layer through
//! snapshots plus a stream of [`TimelineUpdate`]s. It never blocks on the
//! renderer and the renderer never blocks on it.
//!
//! The usual entry point is [`RoomView::open`].
//!
//! [`EventStreamSource`]: source::EventStreamSource
//! [`TimelineUpdate`]: room_view::TimelineUpdate
//! [`RoomView::open`]: room_view::RoomView::open

pub mod error;
pub mod event;
/// Display classification: sender grouping and date separators.
pub mod event_group;
pub mod fill;
pub mod persistent_state;
pub mod read_state;
pub mod room_view;
pub mod search;
pub mod source;
pub mod timeline_window;

pub use error::{Result, TimelineError};
pub use event::{Event, EventId, PaginationDirection, RoomId, SendStatus, UserId};
pub use event_group::{Classification, classify, is_scroll_anchor};
pub use fill::JumpToLiveOutcome;
pub use read_state::{GHOST_DECAY, ReadMarker};
pub use room_view::{RoomView, ScrollState, TimelineUpdate};
pub use search::{ResultGroup, SearchScope, SearchSession};
pub use source::{
    EventBatch, EventStreamSource, LiveEventSender, PeekError, RoomMeta, RoomSubscription,
    SearchFilter, SearchHit, SearchResponse,
};
pub use timeline_window::{
    INITIAL_SIZE, LiveEventOutcome, PAGINATE_SIZE, TimelineWindow, WINDOW_CAP,
};
