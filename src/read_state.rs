//! Read-receipt sending and read-marker bookkeeping for one room.
//!
//! The tracker decides when viewing activity becomes a receipt on the wire,
//! keeps the visible read marker in sync with the server's view, and runs the
//! short-lived "ghost" marker shown at the previous position after the marker
//! jumps forward.

use imbl::Vector;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TimelineError};
use crate::event::{Event, EventId, RoomId, UserId};
use crate::room_view::TimelineUpdate;
use crate::source::EventStreamSource;
use crate::timeline_window::index_of;

/// How long a ghost read marker lingers before it fades out.
pub const GHOST_DECAY: Duration = Duration::from_millis(1400);

/// The read marker(s) to render for a room.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadMarker {
    /// The event the marker currently sits after, if it is in the window.
    pub current: Option<EventId>,
    /// The marker's previous position, still rendered (fading) after a jump.
    /// At most one ghost exists at a time.
    pub ghost: Option<EventId>,
}

#[derive(Default)]
struct ReadState {
    marker: ReadMarker,
    /// The event the server last acknowledged a receipt up to, from the
    /// receipt stream. `None` until the first server receipt arrives.
    server_read_up_to: Option<EventId>,
    /// The last receipt we sent, kept to avoid re-sending for the same
    /// event. Cleared when a send fails so the next activity retries it.
    last_receipt_sent: Option<EventId>,
    receipt_in_flight: bool,
    ghost_timer: Option<JoinHandle<()>>,
}

/// Re-arms the tracker when a receipt-send future is dropped mid-flight:
/// whether the receipt reached the wire is unknown, so both the in-flight
/// flag and the dedup id are cleared and the next settle retries.
struct ReceiptGuard<'a> {
    state: &'a Mutex<ReadState>,
    armed: bool,
}

impl Drop for ReceiptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap();
            state.receipt_in_flight = false;
            state.last_receipt_sent = None;
        }
    }
}

/// Tracks read state for one room and one (own) user.
pub struct ReadStateTracker {
    source: Arc<dyn EventStreamSource>,
    room_id: RoomId,
    own_user_id: UserId,
    update_tx: crossbeam_channel::Sender<TimelineUpdate>,
    state: Mutex<ReadState>,
}

impl ReadStateTracker {
    pub fn new(
        source: Arc<dyn EventStreamSource>,
        room_id: RoomId,
        own_user_id: UserId,
        update_tx: crossbeam_channel::Sender<TimelineUpdate>,
    ) -> Self {
        Self {
            source,
            room_id,
            own_user_id,
            update_tx,
            state: Mutex::new(ReadState::default()),
        }
    }

    /// The marker positions to render right now.
    pub fn marker(&self) -> ReadMarker {
        self.state.lock().unwrap().marker.clone()
    }

    /// Called when the viewport has settled on a stable scroll position.
    ///
    /// `last_fully_visible` is the window index of the last event fully
    /// inside the viewport. Sends a receipt for the newest visible event not
    /// authored by us, subject to the gating rules below, and returns the
    /// event receipted (or `None` if nothing was sent). Send failures are
    /// swallowed after clearing the dedup state, so the receipt is retried on
    /// the next settle.
    pub async fn on_viewport_settle(
        &self,
        events: &Vector<Event>,
        at_live_tail: bool,
        can_paginate_forward: bool,
        last_fully_visible: Option<usize>,
    ) -> Result<Option<EventId>> {
        // Receipts only advance while the user is reading at the live tail;
        // scrolled-back reading never moves other people's read indicators.
        if !at_live_tail {
            return Ok(None);
        }
        let Some(start) = last_fully_visible else {
            return Ok(None);
        };
        let Some(candidate) = newest_other_authored(events, start, &self.own_user_id) else {
            return Ok(None);
        };
        let candidate_idx = index_of(events, &candidate).unwrap_or(0);

        {
            let mut state = self.state.lock().unwrap();
            match state.server_read_up_to.as_ref() {
                Some(server_id) => match index_of(events, server_id) {
                    Some(server_idx) if candidate_idx <= server_idx => {
                        // The server already knows we read this far.
                        return Ok(None);
                    }
                    Some(_) => {}
                    None => {
                        // The server's read-up-to event is not in the window.
                        // If newer history exists we may be behind it, so
                        // stay quiet; if the tail is fully loaded it was
                        // evicted from the past and we are ahead of it.
                        if can_paginate_forward {
                            return Ok(None);
                        }
                    }
                },
                None => {}
            }
            if state.last_receipt_sent.as_ref() == Some(&candidate) {
                return Ok(None);
            }
            if state.receipt_in_flight {
                return Ok(None);
            }
            state.receipt_in_flight = true;
            state.last_receipt_sent = Some(candidate.clone());
        }

        let mut guard = ReceiptGuard { state: &self.state, armed: true };
        let sent = self.source.send_receipt(&self.room_id, &candidate).await;
        guard.armed = false;
        let mut state = self.state.lock().unwrap();
        state.receipt_in_flight = false;
        match sent {
            Ok(()) => {
                debug!(room = %self.room_id, event = %candidate, "read receipt sent");
                Ok(Some(candidate))
            }
            Err(e) => {
                // Silent failure; clearing the dedup state re-arms the send.
                state.last_receipt_sent = None;
                let err = TimelineError::SendFailed(format!("{e:#}"));
                warn!(room = %self.room_id, event = %candidate, "{err}");
                Ok(None)
            }
        }
    }

    /// Applies a server-side receipt for our own user, moving the read
    /// marker and possibly leaving a decaying ghost at its old position.
    pub fn on_server_receipt(&self, read_up_to: EventId, events: &Vector<Event>) {
        let mut state = self.state.lock().unwrap();
        if state.marker.current.as_ref() == Some(&read_up_to) {
            state.server_read_up_to = Some(read_up_to);
            return;
        }

        match ghost_candidate(
            state.marker.current.as_ref(),
            &read_up_to,
            events,
            &self.own_user_id,
        ) {
            Some(ghost) => {
                state.marker.ghost = Some(ghost.clone());
                if let Some(timer) = state.ghost_timer.take() {
                    timer.abort();
                }
                let update_tx = self.update_tx.clone();
                state.ghost_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(GHOST_DECAY).await;
                    let _ = update_tx
                        .send(TimelineUpdate::ReadMarkerGhostExpired { event_id: ghost });
                }));
            }
            // A marker move that leaves no new ghost may still invalidate an
            // existing one: if the marker regressed to (or behind) the ghost,
            // the ghost would render after the live marker, so drop it now.
            None => drop_ghost_behind(&mut state, &read_up_to, events),
        }

        state.marker.current = Some(read_up_to.clone());
        state.server_read_up_to = Some(read_up_to);
    }

    /// Removes the ghost marker named by an expiry notification. A stale
    /// notification (the ghost has since been replaced) is ignored.
    pub fn clear_ghost(&self, event_id: &EventId) {
        let mut state = self.state.lock().unwrap();
        if state.marker.ghost.as_ref() == Some(event_id) {
            state.marker.ghost = None;
        }
    }

    /// Drops the ghost early if its event has been evicted from the window.
    pub fn prune_ghost(&self, events: &Vector<Event>) {
        let mut state = self.state.lock().unwrap();
        if let Some(ghost) = state.marker.ghost.as_ref() {
            if index_of(events, ghost).is_none() {
                state.marker.ghost = None;
                if let Some(timer) = state.ghost_timer.take() {
                    timer.abort();
                }
            }
        }
    }

    /// Tears the tracker down, cancelling any pending ghost decay.
    pub fn shutdown(&self) {
        if let Some(timer) = self.state.lock().unwrap().ghost_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ReadStateTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The newest event at or below `start` that someone else authored.
///
/// Our own messages never need a receipt; the receipt goes to the newest
/// *foreign* event the viewport has covered.
fn newest_other_authored(
    events: &Vector<Event>,
    start: usize,
    own_user_id: &UserId,
) -> Option<EventId> {
    let start = start.min(events.len().checked_sub(1)?);
    (0..=start)
        .rev()
        .map(|idx| &events[idx])
        .find(|ev| !ev.is_sent_by(own_user_id) && !ev.is_local_echo())
        .map(|ev| ev.id.clone())
}

/// Drops the ghost (and its decay timer) if the marker's new position sits
/// at or before it in the window.
fn drop_ghost_behind(state: &mut ReadState, new: &EventId, events: &Vector<Event>) {
    let Some(ghost) = state.marker.ghost.as_ref() else {
        return;
    };
    let Some(new_idx) = index_of(events, new) else {
        return;
    };
    if index_of(events, ghost).map_or(true, |ghost_idx| ghost_idx >= new_idx) {
        state.marker.ghost = None;
        if let Some(timer) = state.ghost_timer.take() {
            timer.abort();
        }
    }
}

/// Decides whether the outgoing marker position should linger as a ghost.
///
/// It should only when the user would actually see it fade: the old position
/// is still in the window, the marker moved forward past it, and the event
/// right after it is not one of our own sends (our own message "consuming"
/// the marker is not worth animating).
fn ghost_candidate(
    old: Option<&EventId>,
    new: &EventId,
    events: &Vector<Event>,
    own_user_id: &UserId,
) -> Option<EventId> {
    let old = old?;
    let old_idx = index_of(events, old)?;
    let new_idx = index_of(events, new)?;
    if old_idx >= new_idx {
        return None;
    }
    if let Some(next) = events.get(old_idx + 1) {
        if next.is_sent_by(own_user_id) {
            return None;
        }
    }
    Some(old.clone())
}
