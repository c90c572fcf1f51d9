//! A bounded, double-ended window over a room's event history.
//!
//! The window owns the pagination cursors and the `can_paginate_*` flags,
//! enforces [`WINDOW_CAP`], and is the only place events are inserted or
//! replaced. Everything else in the engine reads snapshots of it.

use imbl::Vector;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, TimelineError};
use crate::event::{Event, EventId, PaginationDirection, RoomId};
use crate::source::{EventStreamSource, PeekError};

/// Number of events fetched by the initial load.
pub const INITIAL_SIZE: usize = 20;
/// Default number of events fetched per fill request.
pub const PAGINATE_SIZE: usize = 20;
/// The most events retained in a window at once.
pub const WINDOW_CAP: usize = 1000;

/// What happened to a live event handed to [`TimelineWindow::on_live_event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiveEventOutcome {
    /// The event was appended (or updated in place) in the window.
    Applied,
    /// A load/paginate is in flight; the event was queued and will be applied
    /// in receipt order once the operation completes.
    Deferred,
    /// The window does not cover the live tail (or is dead); the event was
    /// dropped and will be picked up on the next reload. The caller must
    /// still reflect it in its unread-count bookkeeping.
    Discarded,
}

#[derive(Default)]
struct WindowState {
    events: Vector<Event>,
    can_paginate_backwards: bool,
    can_paginate_forwards: bool,
    /// Whether a `load` or `paginate` is currently in flight.
    loading: bool,
    /// Live events received while `loading`; drained once it completes.
    pending_live: Vec<Event>,
    /// Set when the owning view is torn down. Any in-flight completion
    /// checks this before mutating and becomes a no-op.
    dead: bool,
}

/// Clears the `loading` flag on drop, so a `load`/`paginate` future that is
/// dropped mid-fetch (timeout, task abort) cannot wedge the window into
/// returning `Busy` forever.
struct ClearLoading<'a> {
    state: &'a Mutex<WindowState>,
}

impl Drop for ClearLoading<'_> {
    fn drop(&mut self) {
        self.state.lock().unwrap().loading = false;
    }
}

/// A bounded window over one room's server-ordered event stream.
///
/// Invariant: `events` is exactly the server-linear order for the covered
/// range, with unique IDs, and never exceeds [`WINDOW_CAP`] entries. Once
/// `can_paginate(Backwards)` is `false`, the first event in the window is the
/// first event of the room.
pub struct TimelineWindow {
    source: Arc<dyn EventStreamSource>,
    room_id: RoomId,
    state: Mutex<WindowState>,
}

impl TimelineWindow {
    pub fn new(source: Arc<dyn EventStreamSource>, room_id: RoomId) -> Self {
        Self {
            source,
            room_id,
            state: Mutex::new(WindowState {
                can_paginate_backwards: true,
                can_paginate_forwards: true,
                ..WindowState::default()
            }),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// A snapshot of the window's events, oldest first.
    pub fn events(&self) -> Vector<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn can_paginate(&self, direction: PaginationDirection) -> bool {
        let state = self.state.lock().unwrap();
        match direction {
            PaginationDirection::Backwards => state.can_paginate_backwards,
            PaginationDirection::Forwards => state.can_paginate_forwards,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().unwrap().loading
    }

    pub fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead
    }

    /// The locally-originated events in the window whose send failed,
    /// oldest first. Used for the "resend all" affordance.
    pub fn unsent_events(&self) -> Vec<Event> {
        let state = self.state.lock().unwrap();
        state
            .events
            .iter()
            .filter(|ev| ev.send_status == crate::event::SendStatus::NotSent)
            .cloned()
            .collect()
    }

    /// Marks this window dead: every subsequent call and every in-flight
    /// completion becomes a no-op.
    pub fn mark_dead(&self) {
        self.state.lock().unwrap().dead = true;
    }

    /// (Re-)loads the window around `anchor`, or around the live tail if
    /// `anchor` is `None`. Resets all window state first.
    ///
    /// Fails with [`TimelineError::NoAccess`] if the source reports the room
    /// is not readable, and with [`TimelineError::Busy`] if another operation
    /// is in flight.
    pub async fn load(&self, anchor: Option<&EventId>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.dead {
                return Ok(());
            }
            if state.loading {
                return Err(TimelineError::Busy);
            }
            state.loading = true;
            state.events.clear();
            state.pending_live.clear();
            state.can_paginate_backwards = true;
            state.can_paginate_forwards = true;
        }

        let _loading = ClearLoading { state: &self.state };
        let result = self.load_inner(anchor).await;
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Ok(());
        }
        match result {
            Ok((events, can_back, can_fwd)) => {
                state.events = events;
                state.can_paginate_backwards = can_back;
                state.can_paginate_forwards = can_fwd;
                Self::drain_pending_live(&mut state);
                debug!(
                    room = %self.room_id,
                    count = state.events.len(),
                    "timeline window loaded"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn load_inner(
        &self,
        anchor: Option<&EventId>,
    ) -> Result<(Vector<Event>, bool, bool)> {
        match self.source.peek(&self.room_id).await {
            Ok(_) => {}
            Err(PeekError::AccessForbidden) => {
                return Err(TimelineError::NoAccess(self.room_id.clone()));
            }
            Err(PeekError::Other(e)) => return Err(TimelineError::source(e)),
        }

        match anchor {
            // No anchor: load the live tail. Forward pagination is
            // impossible by construction.
            None => {
                let batch = self
                    .source
                    .events_in_range(
                        &self.room_id,
                        None,
                        INITIAL_SIZE,
                        PaginationDirection::Backwards,
                    )
                    .await
                    .map_err(TimelineError::source)?;
                Ok((dedup_in_order(batch.events), batch.more, false))
            }
            // Anchored: fetch half the initial window on each side so the
            // anchor lands mid-viewport.
            Some(anchor) => {
                let back = self
                    .source
                    .events_in_range(
                        &self.room_id,
                        Some(anchor),
                        INITIAL_SIZE / 2,
                        PaginationDirection::Backwards,
                    )
                    .await
                    .map_err(TimelineError::source)?;
                let fwd = self
                    .source
                    .events_in_range(
                        &self.room_id,
                        Some(anchor),
                        INITIAL_SIZE / 2,
                        PaginationDirection::Forwards,
                    )
                    .await
                    .map_err(TimelineError::source)?;
                let mut events = back.events;
                events.extend(fwd.events);
                Ok((dedup_in_order(events), back.more, fwd.more))
            }
        }
    }

    /// Requests up to `count` more events in `direction` and integrates them,
    /// preserving server order and dropping from the opposite end if the
    /// window would exceed [`WINDOW_CAP`].
    ///
    /// Returns `Ok(true)` if any events were added. Returns `Ok(false)`
    /// immediately, without issuing a request, when the relevant
    /// `can_paginate` flag is already `false`.
    pub async fn paginate(&self, direction: PaginationDirection, count: usize) -> Result<bool> {
        let anchor = {
            let mut state = self.state.lock().unwrap();
            if state.dead {
                return Ok(false);
            }
            let can = match direction {
                PaginationDirection::Backwards => state.can_paginate_backwards,
                PaginationDirection::Forwards => state.can_paginate_forwards,
            };
            if !can {
                return Ok(false);
            }
            if state.loading {
                return Err(TimelineError::Busy);
            }
            state.loading = true;
            match direction {
                PaginationDirection::Backwards => {
                    state.events.front().map(|ev| ev.id.clone())
                }
                PaginationDirection::Forwards => state.events.back().map(|ev| ev.id.clone()),
            }
        };

        let _loading = ClearLoading { state: &self.state };
        // A backwards fetch includes its anchor, which we already hold, so
        // ask for one extra to net `count` new events.
        let fetch_count = match (direction, &anchor) {
            (PaginationDirection::Backwards, Some(_)) => count + 1,
            _ => count,
        };
        let fetched = self
            .source
            .events_in_range(&self.room_id, anchor.as_ref(), fetch_count, direction)
            .await;

        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Ok(false);
        }
        let batch = match fetched {
            Ok(batch) => batch,
            Err(e) => {
                // Keep whatever we already had; live events queued during the
                // failed request are still applied.
                Self::drain_pending_live(&mut state);
                warn!(room = %self.room_id, %direction, "pagination failed: {e:#}");
                return Err(TimelineError::source(e));
            }
        };

        let added = Self::integrate_batch(&mut state, direction, batch.events);
        match direction {
            PaginationDirection::Backwards => state.can_paginate_backwards = batch.more,
            PaginationDirection::Forwards => state.can_paginate_forwards = batch.more,
        }
        Self::enforce_cap(&mut state, direction);
        Self::drain_pending_live(&mut state);
        debug!(
            room = %self.room_id,
            %direction,
            added,
            total = state.events.len(),
            "pagination complete"
        );
        Ok(added > 0)
    }

    /// Applies a live event pushed by the source.
    ///
    /// The event is appended only if the window currently represents the live
    /// tail; queued if an operation is in flight; dropped otherwise.
    pub fn on_live_event(&self, event: Event) -> LiveEventOutcome {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return LiveEventOutcome::Discarded;
        }
        if state.loading {
            state.pending_live.push(event);
            return LiveEventOutcome::Deferred;
        }
        Self::apply_live(&mut state, event)
    }

    /// Replaces a locally-echoed event in place (same position, new content),
    /// used when a send is confirmed or fails. Returns `false` if `old_id`
    /// is not in the window.
    pub fn replace_local_echo(&self, old_id: &EventId, new_event: Event) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return false;
        }
        if let Some(idx) = index_of(&state.events, old_id) {
            state.events.set(idx, new_event);
            return true;
        }
        // The echo may still be parked in the pending-live queue.
        if let Some(pending) = state.pending_live.iter_mut().find(|ev| &ev.id == old_id) {
            *pending = new_event;
            return true;
        }
        false
    }

    fn apply_live(state: &mut WindowState, event: Event) -> LiveEventOutcome {
        if state.can_paginate_forwards {
            // Not at the live tail: the event will be covered by a future
            // forward pagination or reload instead.
            return LiveEventOutcome::Discarded;
        }
        if let Some(idx) = index_of(&state.events, &event.id) {
            // Same event re-delivered (e.g. a server echo): update in place.
            state.events.set(idx, event);
            return LiveEventOutcome::Applied;
        }
        state.events.push_back(event);
        if state.events.len() > WINDOW_CAP {
            let overflow = state.events.len() - WINDOW_CAP;
            state.events = state.events.split_off(overflow);
            state.can_paginate_backwards = true;
        }
        LiveEventOutcome::Applied
    }

    fn drain_pending_live(state: &mut WindowState) {
        // Applied in receipt order, never interleaved with a fetch.
        for event in std::mem::take(&mut state.pending_live) {
            Self::apply_live(state, event);
        }
    }

    /// Splices a fetched batch into the window, skipping events already
    /// present. A backwards fetch includes its anchor, so overlap with the
    /// window's edge is expected rather than exceptional.
    fn integrate_batch(
        state: &mut WindowState,
        direction: PaginationDirection,
        events: Vec<Event>,
    ) -> usize {
        let fresh: Vec<Event> = events
            .into_iter()
            .filter(|ev| index_of(&state.events, &ev.id).is_none())
            .collect();
        let added = fresh.len();
        match direction {
            PaginationDirection::Backwards => {
                let mut combined: Vector<Event> = fresh.into_iter().collect();
                combined.append(std::mem::take(&mut state.events));
                state.events = combined;
            }
            PaginationDirection::Forwards => {
                state.events.extend(fresh);
            }
        }
        added
    }

    /// Drops events from the end opposite the fetch direction once the cap
    /// is exceeded. Evicted history is still on the server, so the matching
    /// `can_paginate` flag comes back on.
    fn enforce_cap(state: &mut WindowState, direction: PaginationDirection) {
        if state.events.len() <= WINDOW_CAP {
            return;
        }
        let overflow = state.events.len() - WINDOW_CAP;
        match direction {
            PaginationDirection::Backwards => {
                state.events.truncate(WINDOW_CAP);
                state.can_paginate_forwards = true;
            }
            PaginationDirection::Forwards => {
                state.events = state.events.split_off(overflow);
                state.can_paginate_backwards = true;
            }
        }
    }
}

/// Index of the event with the given ID in a window snapshot, if present.
pub(crate) fn index_of(events: &Vector<Event>, id: &EventId) -> Option<usize> {
    events.iter().position(|ev| &ev.id == id)
}

/// Drops duplicate IDs from a server-ordered batch, keeping first occurrences.
fn dedup_in_order(events: Vec<Event>) -> Vector<Event> {
    let mut out: Vector<Event> = Vector::new();
    for event in events {
        if index_of(&out, &event.id).is_none() {
            out.push_back(event);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SendStatus;
    use crate::source::mock::{MockSource, test_event};
    use std::sync::atomic::Ordering;

    fn window_over(source: &Arc<MockSource>) -> TimelineWindow {
        TimelineWindow::new(
            Arc::clone(source) as Arc<dyn EventStreamSource>,
            source.room_id.clone(),
        )
    }

    fn local_echo(room_id: &str, id: &str) -> Event {
        Event {
            id: EventId::from(id),
            room_id: RoomId::from(room_id),
            sender: Some(crate::event::UserId::from("@me:example.org")),
            event_type: "m.room.message".to_owned(),
            timestamp_ms: 1_699_999_999_000,
            state_key: None,
            send_status: SendStatus::Sending,
        }
    }

    #[tokio::test]
    async fn test_load_live_tail() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 50));
        let window = window_over(&source);
        window.load(None).await.unwrap();

        let events = window.events();
        assert_eq!(events.len(), INITIAL_SIZE);
        assert_eq!(events.back().unwrap().id, EventId::from("$49"));
        assert!(window.can_paginate(PaginationDirection::Backwards));
        assert!(!window.can_paginate(PaginationDirection::Forwards));
    }

    #[tokio::test]
    async fn test_load_around_anchor() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 100));
        let window = window_over(&source);
        window.load(Some(&EventId::from("$50"))).await.unwrap();

        let events = window.events();
        assert_eq!(events.len(), INITIAL_SIZE);
        assert!(index_of(&events, &EventId::from("$50")).is_some());
        assert!(window.can_paginate(PaginationDirection::Backwards));
        assert!(window.can_paginate(PaginationDirection::Forwards));
    }

    #[tokio::test]
    async fn test_load_no_access() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 10));
        source.forbid_peek.store(true, Ordering::SeqCst);
        let window = window_over(&source);
        match window.load(None).await {
            Err(TimelineError::NoAccess(room)) => {
                assert_eq!(room, RoomId::from("!r:example.org"));
            }
            other => panic!("expected NoAccess, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paginate_backwards_extends_window() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 60));
        let window = window_over(&source);
        window.load(None).await.unwrap();
        assert_eq!(window.events().len(), 20);

        let added = window
            .paginate(PaginationDirection::Backwards, 20)
            .await
            .unwrap();
        assert!(added);

        let events = window.events();
        assert_eq!(events.len(), 40);
        // Still sorted in server order with unique ids.
        let ids: Vec<&str> = events.iter().map(|ev| ev.id.as_str()).collect();
        let expected: Vec<String> = (20..60).map(|i| format!("${i}")).collect();
        assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert!(window.can_paginate(PaginationDirection::Backwards));
    }

    #[tokio::test]
    async fn test_paginate_reports_end_of_history() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 25));
        let window = window_over(&source);
        window.load(None).await.unwrap();

        let added = window
            .paginate(PaginationDirection::Backwards, 20)
            .await
            .unwrap();
        assert!(added);
        assert_eq!(window.events().len(), 25);
        assert!(!window.can_paginate(PaginationDirection::Backwards));

        // Exhausted direction: no-op and, crucially, no further fetch.
        let before = source.fetch_calls.load(Ordering::SeqCst);
        let added = window
            .paginate(PaginationDirection::Backwards, 20)
            .await
            .unwrap();
        assert!(!added);
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_overlapping_paginate_rejected_busy() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 60));
        let window = Arc::new(window_over(&source));
        window.load(None).await.unwrap();

        let gate = source.gate_fetches();
        let first = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.paginate(PaginationDirection::Backwards, 20).await })
        };
        // Let the first paginate reach the gated fetch.
        tokio::task::yield_now().await;

        match window.paginate(PaginationDirection::Backwards, 20).await {
            Err(TimelineError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }

        gate.add_permits(1);
        assert!(first.await.unwrap().unwrap());
        assert_eq!(window.events().len(), 40);
    }

    #[tokio::test]
    async fn test_cancelled_paginate_does_not_wedge_window() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 60));
        let window = Arc::new(window_over(&source));
        window.load(None).await.unwrap();

        let gate = source.gate_fetches();
        let doomed = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.paginate(PaginationDirection::Backwards, 20).await })
        };
        tokio::task::yield_now().await;
        assert!(window.is_loading());

        doomed.abort();
        assert!(doomed.await.unwrap_err().is_cancelled());

        // Dropping the in-flight future released the loading flag, so the
        // window is not stuck answering Busy with nothing in flight.
        assert!(!window.is_loading());
        gate.add_permits(1);
        assert!(window
            .paginate(PaginationDirection::Backwards, 20)
            .await
            .unwrap());
        assert_eq!(window.events().len(), 40);
    }

    #[tokio::test]
    async fn test_live_event_applied_at_tail() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 30));
        let window = window_over(&source);
        window.load(None).await.unwrap();

        let event = test_event("!r:example.org", 30);
        assert_eq!(window.on_live_event(event.clone()), LiveEventOutcome::Applied);
        assert_eq!(window.events().back().unwrap().id, event.id);
    }

    #[tokio::test]
    async fn test_live_event_discarded_when_not_at_tail() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 100));
        let window = window_over(&source);
        // Anchored load in the middle: forward pagination is still possible.
        window.load(Some(&EventId::from("$50"))).await.unwrap();
        assert!(window.can_paginate(PaginationDirection::Forwards));

        let event = test_event("!r:example.org", 100);
        assert_eq!(window.on_live_event(event), LiveEventOutcome::Discarded);
    }

    #[tokio::test]
    async fn test_live_event_deferred_while_paginating() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 60));
        let window = Arc::new(window_over(&source));
        window.load(None).await.unwrap();

        let gate = source.gate_fetches();
        let paginating = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { window.paginate(PaginationDirection::Backwards, 20).await })
        };
        tokio::task::yield_now().await;

        let live = test_event("!r:example.org", 60);
        assert_eq!(window.on_live_event(live.clone()), LiveEventOutcome::Deferred);
        // Not yet visible: the pagination is still in flight.
        assert!(index_of(&window.events(), &live.id).is_none());

        gate.add_permits(1);
        paginating.await.unwrap().unwrap();

        let events = window.events();
        assert_eq!(events.back().unwrap().id, live.id);
        assert_eq!(events.len(), 41);
    }

    #[tokio::test]
    async fn test_replace_local_echo_in_place() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 20));
        let window = window_over(&source);
        window.load(None).await.unwrap();

        let echo = local_echo("!r:example.org", "tmp-1");
        window.on_live_event(echo.clone());
        let count_before = window.events().len();
        let position = index_of(&window.events(), &echo.id).unwrap();

        let mut confirmed = echo.clone();
        confirmed.id = EventId::from("$real:1");
        confirmed.send_status = SendStatus::Sent;
        assert!(window.replace_local_echo(&EventId::from("tmp-1"), confirmed));

        let events = window.events();
        assert_eq!(events.len(), count_before);
        assert_eq!(events.get(position).unwrap().id, EventId::from("$real:1"));
        assert_eq!(events.get(position).unwrap().send_status, SendStatus::Sent);
        assert!(!window.replace_local_echo(&EventId::from("tmp-1"), echo));
    }

    #[tokio::test]
    async fn test_unsent_events_reported() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 10));
        let window = window_over(&source);
        window.load(None).await.unwrap();

        let mut failed = local_echo("!r:example.org", "tmp-9");
        failed.send_status = SendStatus::NotSent;
        window.on_live_event(failed.clone());

        let unsent = window.unsent_events();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].id, failed.id);
    }

    #[tokio::test]
    async fn test_dead_window_is_inert() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 30));
        let window = window_over(&source);
        window.load(None).await.unwrap();
        window.mark_dead();

        let before = source.fetch_calls.load(Ordering::SeqCst);
        assert!(!window.paginate(PaginationDirection::Backwards, 20).await.unwrap());
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), before);
        assert_eq!(
            window.on_live_event(test_event("!r:example.org", 30)),
            LiveEventOutcome::Discarded
        );
    }

    #[tokio::test]
    async fn test_window_cap_evicts_opposite_end() {
        let source = Arc::new(MockSource::with_history("!r:example.org", 1200));
        let window = window_over(&source);
        window.load(None).await.unwrap();

        // Pull in far more history than the cap allows.
        loop {
            let added = window
                .paginate(PaginationDirection::Backwards, 400)
                .await
                .unwrap();
            if !added || !window.can_paginate(PaginationDirection::Backwards) {
                break;
            }
            assert!(window.events().len() <= WINDOW_CAP);
        }

        let events = window.events();
        assert!(events.len() <= WINDOW_CAP);
        // The newest end was evicted, so forward pagination is possible again.
        assert!(window.can_paginate(PaginationDirection::Forwards));
        // Order and uniqueness still hold.
        let mut seen = std::collections::HashSet::new();
        let mut last_ts = i64::MIN;
        for ev in events.iter() {
            assert!(seen.insert(ev.id.clone()), "duplicate id {}", ev.id);
            assert!(ev.timestamp_ms >= last_ts);
            last_ts = ev.timestamp_ms;
        }
    }
}
