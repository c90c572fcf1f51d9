//! The error taxonomy for timeline operations.
//!
//! Nothing here is fatal: every failure degrades to "keep showing what we
//! have", plus an optional inline retry affordance owned by the rendering
//! layer.

use crate::event::RoomId;

/// Errors produced by timeline, fill, read-receipt, and search operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TimelineError {
    /// The room cannot be peeked and we are not joined to it.
    ///
    /// Recoverable: the caller should fall back to a join/preview UI.
    #[error("no read access to room {0}")]
    NoAccess(RoomId),

    /// Another load or pagination is already in flight for this window.
    ///
    /// The caller retries after the outstanding operation completes; this is
    /// never surfaced to the user.
    #[error("another load or pagination is already in flight")]
    Busy,

    /// A generic transport/server failure from the event source.
    ///
    /// The window keeps whatever it already had.
    #[error("event source error: {0}")]
    Source(String),

    /// A read-receipt send failed. Fully silent: the only effect is that the
    /// local dedup state is cleared so the send is retried on the next
    /// qualifying activity signal.
    #[error("failed to send read receipt: {0}")]
    SendFailed(String),

    /// A response arrived after its session was superseded (a newer search
    /// started, the room changed, or the view was unmounted). Silently
    /// dropped; reported only so callers can observe it in logs.
    #[error("response arrived for a superseded session")]
    Stale,
}

impl TimelineError {
    /// Wraps a transport error from an [`EventStreamSource`] implementation.
    ///
    /// [`EventStreamSource`]: crate::source::EventStreamSource
    pub(crate) fn source(err: anyhow::Error) -> Self {
        Self::Source(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, TimelineError>;
