//! Demand-driven fill requests on top of [`TimelineWindow`].
//!
//! Scroll-position heuristics live in the rendering layer; it simply calls
//! [`FillCoordinator::request_fill`] whenever the viewport nears an edge of
//! the loaded window. The coordinator collapses the resulting burst of
//! requests into at most one in-flight pagination per direction.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

use crate::error::Result;
use crate::event::PaginationDirection;
use crate::timeline_window::{PAGINATE_SIZE, TimelineWindow};

type FillResult = Result<bool>;
type FillSlot = Option<watch::Receiver<Option<FillResult>>>;

/// What a fill request found when it looked at its direction's slot.
enum FillAttempt {
    /// Another fill owns the slot; await its broadcast result.
    InFlight(watch::Receiver<Option<FillResult>>),
    /// The window is exhausted in this direction.
    Exhausted,
    /// This request owns the slot and runs the pagination.
    Start(watch::Sender<Option<FillResult>>),
}

/// Frees a fill slot on drop, so a cancelled fill never leaves the slot
/// occupied with nothing in flight.
struct ClearSlot<'a> {
    slot: &'a Mutex<FillSlot>,
}

impl Drop for ClearSlot<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap() = None;
    }
}

/// The outcome of [`FillCoordinator::jump_to_live`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpToLiveOutcome {
    /// The window did not cover the live tail and has been reloaded around
    /// it. Saved scroll positions are now meaningless.
    Reloaded,
    /// The window already covers the live tail; the caller just scrolls.
    AlreadyAtTail,
}

/// Serializes fill requests per direction over one [`TimelineWindow`].
///
/// While a fill is in flight, further requests in the same direction await
/// the same completion instead of issuing their own fetch.
pub struct FillCoordinator {
    window: Arc<TimelineWindow>,
    backwards: Mutex<FillSlot>,
    forwards: Mutex<FillSlot>,
}

impl FillCoordinator {
    pub fn new(window: Arc<TimelineWindow>) -> Self {
        Self {
            window,
            backwards: Mutex::new(None),
            forwards: Mutex::new(None),
        }
    }

    fn slot(&self, direction: PaginationDirection) -> &Mutex<FillSlot> {
        match direction {
            PaginationDirection::Backwards => &self.backwards,
            PaginationDirection::Forwards => &self.forwards,
        }
    }

    /// Requests one page of history in `direction`.
    ///
    /// Returns `Ok(true)` if events were added to the window. When the window
    /// is already exhausted in that direction, returns `Ok(false)` without
    /// touching the source. When a fill in the same direction is already in
    /// flight, awaits and returns that fill's outcome instead of starting a
    /// second one.
    pub async fn request_fill(&self, direction: PaginationDirection) -> Result<bool> {
        // Decide under the lock, await after it is released.
        let attempt = {
            let mut slot = self.slot(direction).lock().unwrap();
            match slot.as_ref() {
                Some(rx) => FillAttempt::InFlight(rx.clone()),
                None if !self.window.can_paginate(direction) => FillAttempt::Exhausted,
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    FillAttempt::Start(tx)
                }
            }
        };

        match attempt {
            FillAttempt::InFlight(rx) => Self::await_inflight(rx).await,
            FillAttempt::Exhausted => Ok(false),
            FillAttempt::Start(tx) => {
                // The guard frees the slot even if this future is dropped
                // mid-pagination; dropping `tx` then wakes the waiters.
                let _slot_guard = ClearSlot { slot: self.slot(direction) };
                let result = self.window.paginate(direction, PAGINATE_SIZE).await;
                // Waiters may have all gone away; that's fine.
                let _ = tx.send(Some(result.clone()));
                debug!(%direction, outcome = ?result, "fill request completed");
                result
            }
        }
    }

    async fn await_inflight(mut rx: watch::Receiver<Option<FillResult>>) -> Result<bool> {
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Ok(false)),
            // The filling task was dropped before completing; report "nothing
            // added" and let the caller re-request if it still cares.
            Err(_) => Ok(false),
        }
    }

    /// Brings the window back to the live tail.
    ///
    /// If the window is detached from the tail (forward pagination is still
    /// possible), it is reloaded around the newest events rather than paged
    /// forward an unbounded number of times.
    pub async fn jump_to_live(&self) -> Result<JumpToLiveOutcome> {
        if !self.window.can_paginate(PaginationDirection::Forwards) {
            return Ok(JumpToLiveOutcome::AlreadyAtTail);
        }
        self.window.load(None).await?;
        Ok(JumpToLiveOutcome::Reloaded)
    }
}
