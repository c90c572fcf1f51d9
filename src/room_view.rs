//! The per-room façade owned by a rendering layer.
//!
//! A [`RoomView`] wires one room's window, fill coordinator, read-state
//! tracker, and search overlay together, pumps the room's live-event
//! subscription in a background task, and streams [`TimelineUpdate`]s to the
//! renderer over a channel it drains on its own schedule.

use imbl::Vector;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Result, TimelineError};
use crate::event::{Event, EventId, PaginationDirection, RoomId, UserId};
use crate::fill::{FillCoordinator, JumpToLiveOutcome};
use crate::read_state::{ReadMarker, ReadStateTracker};
use crate::search::{SearchOverlay, SearchScope, SearchSession};
use crate::source::EventStreamSource;
use crate::timeline_window::{LiveEventOutcome, TimelineWindow};

/// Updates streamed from the engine to the rendering layer.
///
/// The renderer drains these via [`RoomView::process_updates`] whenever it is
/// about to draw; none of them require an immediate response.
#[derive(Clone, Debug)]
pub enum TimelineUpdate {
    /// The window was (re)loaded from scratch; any saved scroll position or
    /// cached layout is invalid.
    Loaded,
    /// Events were added to the window.
    NewItems {
        /// `true` if they were appended at the newest end (the renderer may
        /// keep its scroll pinned to the bottom), `false` if they landed
        /// elsewhere (the renderer must re-anchor).
        is_append: bool,
    },
    /// A fill request finished, successfully or not.
    PaginationIdle {
        direction: PaginationDirection,
        /// `true` when the window is exhausted in that direction.
        fully_paginated: bool,
    },
    /// The unread-message count changed.
    NewUnreadMessagesCount(usize),
    /// A ghost read marker finished its decay and should no longer render.
    ReadMarkerGhostExpired { event_id: EventId },
    /// The user's own message was appended; scroll to the bottom.
    ScrollToBottom,
}

/// A saved scroll position, anchored to a confirmed event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrollState {
    pub focused_event_id: EventId,
    /// Pixel offset of the anchor event from the top of the viewport.
    pub pixel_offset: f64,
}

struct ViewState {
    /// Whether the viewport is at the bottom of a fully-forward-loaded
    /// window. Gates receipt sending and unread counting.
    at_live_tail: bool,
    num_unread: usize,
    saved_scroll: Option<ScrollState>,
}

/// One open room timeline.
pub struct RoomView {
    room_id: RoomId,
    window: Arc<TimelineWindow>,
    fill: FillCoordinator,
    read_state: ReadStateTracker,
    search: SearchOverlay,
    update_tx: crossbeam_channel::Sender<TimelineUpdate>,
    update_rx: crossbeam_channel::Receiver<TimelineUpdate>,
    view_state: Arc<Mutex<ViewState>>,
    live_pump: Mutex<Option<JoinHandle<()>>>,
}

impl RoomView {
    /// Opens a room: loads the window (around `anchor`, or at the live tail),
    /// subscribes to its live events, and starts the pump task.
    pub async fn open(
        source: Arc<dyn EventStreamSource>,
        room_id: RoomId,
        own_user_id: UserId,
        anchor: Option<&EventId>,
    ) -> Result<Self> {
        let window = Arc::new(TimelineWindow::new(Arc::clone(&source), room_id.clone()));
        window.load(anchor).await?;

        let (update_tx, update_rx) = crossbeam_channel::unbounded();
        let read_state = ReadStateTracker::new(
            Arc::clone(&source),
            room_id.clone(),
            own_user_id.clone(),
            update_tx.clone(),
        );
        let search = SearchOverlay::new(Arc::clone(&source), room_id.clone());
        let view_state = Arc::new(Mutex::new(ViewState {
            at_live_tail: anchor.is_none(),
            num_unread: 0,
            saved_scroll: None,
        }));

        let subscription = source
            .subscribe_live(&room_id)
            .await
            .map_err(TimelineError::source)?;
        let live_pump = tokio::spawn(live_pump(
            subscription,
            Arc::clone(&window),
            Arc::clone(&view_state),
            update_tx.clone(),
            own_user_id,
        ));

        let _ = update_tx.send(TimelineUpdate::Loaded);
        debug!(room = %room_id, "room view opened");
        let fill = FillCoordinator::new(Arc::clone(&window));
        Ok(Self {
            room_id,
            window,
            fill,
            read_state,
            search,
            update_tx,
            update_rx,
            view_state,
            live_pump: Mutex::new(Some(live_pump)),
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// A snapshot of the events to render, oldest first.
    pub fn visible_events(&self) -> Vector<Event> {
        self.window.events()
    }

    pub fn can_paginate(&self, direction: PaginationDirection) -> bool {
        self.window.can_paginate(direction)
    }

    pub fn read_marker(&self) -> ReadMarker {
        self.read_state.marker()
    }

    pub fn unread_count(&self) -> usize {
        self.view_state.lock().unwrap().num_unread
    }

    pub fn at_live_tail(&self) -> bool {
        self.view_state.lock().unwrap().at_live_tail
    }

    /// Locally-sent events whose send failed, for a resend affordance.
    pub fn unsent_events(&self) -> Vec<Event> {
        self.window.unsent_events()
    }

    /// Drains all pending engine updates, applying their side effects (ghost
    /// expiry, ghost pruning) before handing them to the renderer.
    pub fn process_updates(&self) -> Vec<TimelineUpdate> {
        let updates: Vec<TimelineUpdate> = self.update_rx.try_iter().collect();
        for update in &updates {
            if let TimelineUpdate::ReadMarkerGhostExpired { event_id } = update {
                self.read_state.clear_ghost(event_id);
            }
        }
        self.read_state.prune_ghost(&self.window.events());
        updates
    }

    /// Reports the viewport's scroll edge state. Must be called whenever the
    /// renderer's notion of "at the bottom" changes.
    pub fn on_scroll(&self, at_bottom: bool) {
        let at_live_tail =
            at_bottom && !self.window.can_paginate(PaginationDirection::Forwards);
        let mut state = self.view_state.lock().unwrap();
        state.at_live_tail = at_live_tail;
        if at_live_tail {
            state.saved_scroll = None;
            if state.num_unread > 0 {
                state.num_unread = 0;
                let _ = self.update_tx.send(TimelineUpdate::NewUnreadMessagesCount(0));
            }
        }
    }

    /// Reports that the viewport has settled; may send a read receipt.
    ///
    /// `last_fully_visible` is the window index of the last event fully
    /// inside the viewport.
    pub async fn on_viewport_settle(
        &self,
        last_fully_visible: Option<usize>,
    ) -> Result<Option<EventId>> {
        let events = self.window.events();
        let at_live_tail = self.at_live_tail();
        let can_forward = self.window.can_paginate(PaginationDirection::Forwards);
        self.read_state
            .on_viewport_settle(&events, at_live_tail, can_forward, last_fully_visible)
            .await
    }

    /// Requests one more page of history in `direction`.
    pub async fn request_fill(&self, direction: PaginationDirection) -> Result<bool> {
        let result = self.fill.request_fill(direction).await;
        if matches!(result, Ok(true)) {
            let _ = self.update_tx.send(TimelineUpdate::NewItems {
                is_append: direction == PaginationDirection::Forwards,
            });
        }
        let _ = self.update_tx.send(TimelineUpdate::PaginationIdle {
            direction,
            fully_paginated: !self.window.can_paginate(direction),
        });
        result
    }

    /// Returns the view to the live tail, reloading the window if it had
    /// drifted too far back to page forward sensibly.
    pub async fn jump_to_live(&self) -> Result<JumpToLiveOutcome> {
        let outcome = self.fill.jump_to_live().await?;
        {
            let mut state = self.view_state.lock().unwrap();
            state.at_live_tail = true;
            state.saved_scroll = None;
            if state.num_unread > 0 {
                state.num_unread = 0;
                let _ = self.update_tx.send(TimelineUpdate::NewUnreadMessagesCount(0));
            }
        }
        if outcome == JumpToLiveOutcome::Reloaded {
            let _ = self.update_tx.send(TimelineUpdate::Loaded);
        }
        let _ = self.update_tx.send(TimelineUpdate::ScrollToBottom);
        Ok(outcome)
    }

    /// Applies a server-side receipt for our own user.
    pub fn on_server_receipt(&self, read_up_to: EventId) {
        self.read_state
            .on_server_receipt(read_up_to, &self.window.events());
    }

    /// Swaps a local echo for its resolved form (confirmed or failed),
    /// in place. Returns `false` if the echo is no longer in the window.
    pub fn on_local_echo_resolved(&self, old_id: &EventId, resolved: Event) -> bool {
        let replaced = self.window.replace_local_echo(old_id, resolved);
        if replaced {
            let _ = self.update_tx.send(TimelineUpdate::NewItems { is_append: false });
        }
        replaced
    }

    /// Starts a search in this room's overlay. Returns the session token, or
    /// `None` if the search was superseded before it completed.
    pub async fn search(&self, term: &str, scope: SearchScope) -> Result<Option<u64>> {
        match self.search.search(term, scope).await {
            Ok(token) => Ok(Some(token)),
            Err(TimelineError::Stale) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetches the next batch of the open search, if any.
    pub async fn search_fetch_more(&self) -> Result<bool> {
        match self.search.fetch_more().await {
            Err(TimelineError::Stale) => Ok(false),
            other => other,
        }
    }

    pub fn current_search_session(&self) -> Option<SearchSession> {
        self.search.current_session()
    }

    /// Closes the search overlay, restoring the plain timeline.
    pub fn close_search(&self) {
        self.search.invalidate();
    }

    /// The scroll position to persist for this room, or `None` when the view
    /// is at the live tail (reopening then just starts at the bottom).
    pub fn scroll_state(&self) -> Option<ScrollState> {
        let state = self.view_state.lock().unwrap();
        if state.at_live_tail {
            None
        } else {
            state.saved_scroll.clone()
        }
    }

    /// Records the renderer's current scroll anchor for later restoration.
    pub fn set_scroll_state(&self, scroll: ScrollState) {
        self.view_state.lock().unwrap().saved_scroll = Some(scroll);
    }

    /// Tears the view down: stops the live pump, kills the window, cancels
    /// ghost timers, and discards any open search. Idempotent.
    pub fn close(&self) {
        if let Some(pump) = self.live_pump.lock().unwrap().take() {
            pump.abort();
        }
        self.window.mark_dead();
        self.read_state.shutdown();
        self.search.invalidate();
        debug!(room = %self.room_id, "room view closed");
    }
}

impl Drop for RoomView {
    fn drop(&mut self) {
        self.close();
    }
}

/// Forwards the room's live events into the window and maintains the
/// unread count. Runs until the subscription ends or the view is closed.
async fn live_pump(
    mut subscription: crate::source::RoomSubscription,
    window: Arc<TimelineWindow>,
    view_state: Arc<Mutex<ViewState>>,
    update_tx: crossbeam_channel::Sender<TimelineUpdate>,
    own_user_id: UserId,
) {
    while let Some(event) = subscription.recv().await {
        let own = event.is_sent_by(&own_user_id);
        let outcome = window.on_live_event(event);
        match outcome {
            LiveEventOutcome::Applied => {
                let _ = update_tx.send(TimelineUpdate::NewItems { is_append: true });
                if own {
                    // Sending a message always snaps the view back down.
                    let _ = update_tx.send(TimelineUpdate::ScrollToBottom);
                }
            }
            LiveEventOutcome::Deferred => {}
            LiveEventOutcome::Discarded => {
                if window.is_dead() {
                    return;
                }
            }
        }
        // Deferred and discarded events are still new messages; only the
        // sender's own never count as unread.
        if !own {
            let mut state = view_state.lock().unwrap();
            if !state.at_live_tail {
                state.num_unread += 1;
                let count = state.num_unread;
                drop(state);
                let _ = update_tx.send(TimelineUpdate::NewUnreadMessagesCount(count));
            }
        }
    }
    error!(room = %subscription.room_id(), "live event subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SendStatus;
    use crate::source::mock::{MockSource, test_event};
    use crate::timeline_window::INITIAL_SIZE;
    use std::time::Duration;

    const ME: &str = "@me:example.org";

    async fn open_view(source: &Arc<MockSource>, anchor: Option<&EventId>) -> RoomView {
        RoomView::open(
            Arc::clone(source) as Arc<dyn EventStreamSource>,
            source.room_id.clone(),
            UserId::from(ME),
            anchor,
        )
        .await
        .unwrap()
    }

    /// Lets the live pump task drain everything pushed so far.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_open_loads_window_and_emits_loaded() {
        crate::source::mock::init_test_tracing();
        let source = Arc::new(MockSource::with_history("!r:example.org", 50));
        let view = open_view(&source, None).await;

        assert_eq!(view.visible_events().len(), INITIAL_SIZE);
        assert!(view.at_live_tail());
        let updates = view.process_updates();
        assert!(matches!(updates.as_slice(), [TimelineUpdate::Loaded]));
    }

    #[tokio::test]
    async fn test_live_event_appends_and_notifies() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 30));
        let view = open_view(&source, None).await;
        view.process_updates();

        source.push_live(test_event("!r:example.org", 30));
        settle().await;

        assert_eq!(view.visible_events().len(), INITIAL_SIZE + 1);
        let updates = view.process_updates();
        assert!(updates
            .iter()
            .any(|u| matches!(u, TimelineUpdate::NewItems { is_append: true })));
        // Read at the tail: nothing is unread.
        assert_eq!(view.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_unread_counted_while_scrolled_back() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 30));
        let view = open_view(&source, None).await;
        view.on_scroll(false);

        source.push_live(test_event("!r:example.org", 30));
        source.push_live(test_event("!r:example.org", 31));
        settle().await;

        assert_eq!(view.unread_count(), 2);
        let counts: Vec<usize> = view
            .process_updates()
            .into_iter()
            .filter_map(|u| match u {
                TimelineUpdate::NewUnreadMessagesCount(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);

        // Scrolling back down clears the count.
        view.on_scroll(true);
        assert_eq!(view.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_own_live_event_scrolls_to_bottom() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 10));
        let view = open_view(&source, None).await;
        view.process_updates();

        let mut own = test_event("!r:example.org", 10);
        own.sender = Some(UserId::from(ME));
        source.push_live(own);
        settle().await;

        let updates = view.process_updates();
        assert!(updates
            .iter()
            .any(|u| matches!(u, TimelineUpdate::ScrollToBottom)));
        assert_eq!(view.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_request_fill_emits_new_items_and_idle() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 25));
        let view = open_view(&source, None).await;
        view.process_updates();

        assert!(view.request_fill(PaginationDirection::Backwards).await.unwrap());
        let updates = view.process_updates();
        assert!(updates
            .iter()
            .any(|u| matches!(u, TimelineUpdate::NewItems { is_append: false })));
        assert!(updates.iter().any(|u| matches!(
            u,
            TimelineUpdate::PaginationIdle {
                direction: PaginationDirection::Backwards,
                fully_paginated: true,
            }
        )));
    }

    #[tokio::test]
    async fn test_jump_to_live_from_anchored_view() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 100));
        let view = open_view(&source, Some(&EventId::from("$20"))).await;
        assert!(!view.at_live_tail());

        let outcome = view.jump_to_live().await.unwrap();
        assert_eq!(outcome, JumpToLiveOutcome::Reloaded);
        assert!(view.at_live_tail());
        assert_eq!(view.visible_events().back().unwrap().id, EventId::from("$99"));

        let updates = view.process_updates();
        assert!(updates.iter().any(|u| matches!(u, TimelineUpdate::Loaded)));
        assert!(updates
            .iter()
            .any(|u| matches!(u, TimelineUpdate::ScrollToBottom)));
    }

    #[tokio::test]
    async fn test_jump_to_live_at_tail_does_not_reload() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 30));
        let view = open_view(&source, None).await;

        let outcome = view.jump_to_live().await.unwrap();
        assert_eq!(outcome, JumpToLiveOutcome::AlreadyAtTail);
    }

    #[tokio::test]
    async fn test_scroll_state_is_none_at_live_tail() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 30));
        let view = open_view(&source, None).await;

        view.set_scroll_state(ScrollState {
            focused_event_id: EventId::from("$15"),
            pixel_offset: 42.0,
        });
        // At the tail, the saved position is irrelevant.
        assert_eq!(view.scroll_state(), None);

        view.on_scroll(false);
        view.set_scroll_state(ScrollState {
            focused_event_id: EventId::from("$15"),
            pixel_offset: 42.0,
        });
        let saved = view.scroll_state().unwrap();
        assert_eq!(saved.focused_event_id, EventId::from("$15"));
    }

    #[tokio::test]
    async fn test_local_echo_lifecycle() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 10));
        let view = open_view(&source, None).await;

        let mut echo = test_event("!r:example.org", 10);
        echo.id = EventId::from("tmp-0");
        echo.sender = Some(UserId::from(ME));
        echo.send_status = SendStatus::Sending;
        source.push_live(echo.clone());
        settle().await;
        assert_eq!(view.visible_events().back().unwrap().id, EventId::from("tmp-0"));

        let mut failed = echo.clone();
        failed.send_status = SendStatus::NotSent;
        assert!(view.on_local_echo_resolved(&EventId::from("tmp-0"), failed));
        assert_eq!(view.unsent_events().len(), 1);

        let mut confirmed = echo;
        confirmed.id = EventId::from("$confirmed");
        confirmed.send_status = SendStatus::Sent;
        assert!(view.on_local_echo_resolved(&EventId::from("tmp-0"), confirmed));
        assert!(view.unsent_events().is_empty());
        assert_eq!(
            view.visible_events().back().unwrap().id,
            EventId::from("$confirmed")
        );
    }

    #[tokio::test]
    async fn test_receipt_round_trip_moves_marker() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 20));
        let view = open_view(&source, None).await;

        let sent = view.on_viewport_settle(Some(19)).await.unwrap();
        let receipted = sent.expect("receipt should have been sent");
        view.on_server_receipt(receipted.clone());
        assert_eq!(view.read_marker().current, Some(receipted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ghost_expiry_cleared_via_process_updates() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 20));
        let view = open_view(&source, None).await;

        view.on_server_receipt(EventId::from("$5"));
        view.on_server_receipt(EventId::from("$10"));
        assert_eq!(view.read_marker().ghost, Some(EventId::from("$5")));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;

        let updates = view.process_updates();
        assert!(updates
            .iter()
            .any(|u| matches!(u, TimelineUpdate::ReadMarkerGhostExpired { .. })));
        assert_eq!(view.read_marker().ghost, None);
    }

    #[tokio::test]
    async fn test_close_makes_view_inert() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 20));
        let view = open_view(&source, None).await;
        view.close();

        let count = view.visible_events().len();
        source.push_live(test_event("!r:example.org", 20));
        settle().await;
        assert_eq!(view.visible_events().len(), count);
    }
}
