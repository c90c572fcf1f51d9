//! The in-room search overlay.
//!
//! A search session replaces the timeline's event list without disturbing the
//! live window underneath; closing the overlay restores the window untouched.
//! Sessions are token-guarded so responses from a superseded search can never
//! leak into the current one.

use indexmap::IndexSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Result, TimelineError};
use crate::event::{Event, RoomId};
use crate::source::{EventStreamSource, SearchFilter, SearchHit};

/// Where a search looks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the room this overlay belongs to.
    Room,
    /// Every room the source can see.
    All,
}

/// A run of consecutive results from the same room, rendered under one
/// room header.
#[derive(Clone, Debug)]
pub struct ResultGroup {
    pub room_id: RoomId,
    pub room_name: Option<String>,
    /// Matching events, in the order the server ranked them.
    pub results: Vec<Event>,
}

/// The state of one search, as rendered by the overlay.
#[derive(Clone, Debug)]
pub struct SearchSession {
    /// Identifies this session; responses carrying an older token are stale.
    pub token: u64,
    pub term: String,
    pub scope: SearchScope,
    pub groups: Vec<ResultGroup>,
    /// Matched substrings, longest first, for highlighting. Always includes
    /// the literal search term.
    pub highlights: Vec<String>,
    /// Continuation cursor for older results, if the server has more.
    pub next_batch: Option<String>,
    /// Whether a request for this session is currently in flight.
    pub in_progress: bool,
    /// Total match count reported by the server.
    pub count: u32,
}

/// Runs searches for one room's overlay. At most one session exists at a
/// time; starting a new search supersedes the old session entirely.
pub struct SearchOverlay {
    source: Arc<dyn EventStreamSource>,
    room_id: RoomId,
    session: Mutex<Option<SearchSession>>,
    next_token: AtomicU64,
}

impl SearchOverlay {
    pub fn new(source: Arc<dyn EventStreamSource>, room_id: RoomId) -> Self {
        Self {
            source,
            room_id,
            session: Mutex::new(None),
            next_token: AtomicU64::new(0),
        }
    }

    /// A snapshot of the current session, if a search is open.
    pub fn current_session(&self) -> Option<SearchSession> {
        self.session.lock().unwrap().clone()
    }

    /// Starts a new search, superseding any session in progress.
    ///
    /// Returns the new session's token. Fails with [`TimelineError::Stale`]
    /// if yet another search (or an [`invalidate`]) superseded this one
    /// before its response arrived; stale results are discarded, never shown.
    ///
    /// [`invalidate`]: Self::invalidate
    pub async fn search(&self, term: &str, scope: SearchScope) -> Result<u64> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut session = self.session.lock().unwrap();
            *session = Some(SearchSession {
                token,
                term: term.to_owned(),
                scope,
                groups: Vec::new(),
                highlights: Vec::new(),
                next_batch: None,
                in_progress: true,
                count: 0,
            });
        }

        let filter = match scope {
            SearchScope::Room => SearchFilter { rooms: Some(vec![self.room_id.clone()]) },
            SearchScope::All => SearchFilter::default(),
        };
        let response = self.source.search_events(&filter, term).await;

        let mut guard = self.session.lock().unwrap();
        let session = match guard.as_mut() {
            Some(session) if session.token == token => session,
            _ => return Err(TimelineError::Stale),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                session.in_progress = false;
                return Err(TimelineError::source(e));
            }
        };
        append_hits(&mut session.groups, response.results);
        merge_highlights(&mut session.highlights, &response.highlights, term);
        session.next_batch = response.next_batch;
        session.count = response.count;
        session.in_progress = false;
        debug!(
            room = %self.room_id,
            token,
            count = session.count,
            "search completed"
        );
        Ok(token)
    }

    /// Fetches the next batch of the current session's results.
    ///
    /// Returns `Ok(false)` without a request when there is no open session
    /// or no continuation cursor.
    pub async fn fetch_more(&self) -> Result<bool> {
        let (token, term, cursor) = {
            let mut guard = self.session.lock().unwrap();
            let Some(session) = guard.as_mut() else {
                return Ok(false);
            };
            let Some(cursor) = session.next_batch.clone() else {
                return Ok(false);
            };
            if session.in_progress {
                return Err(TimelineError::Busy);
            }
            session.in_progress = true;
            (session.token, session.term.clone(), cursor)
        };

        let response = self.source.search_more(&cursor).await;

        let mut guard = self.session.lock().unwrap();
        let session = match guard.as_mut() {
            Some(session) if session.token == token => session,
            _ => return Err(TimelineError::Stale),
        };
        session.in_progress = false;
        let response = match response {
            Ok(response) => response,
            Err(e) => return Err(TimelineError::source(e)),
        };
        append_hits(&mut session.groups, response.results);
        merge_highlights(&mut session.highlights, &response.highlights, &term);
        session.next_batch = response.next_batch;
        session.count = response.count;
        Ok(true)
    }

    /// Closes the overlay. Any in-flight response for the closed session is
    /// discarded as stale.
    pub fn invalidate(&self) {
        *self.session.lock().unwrap() = None;
    }
}

/// Appends hits to the group list, extending the trailing group while the
/// room stays the same.
fn append_hits(groups: &mut Vec<ResultGroup>, hits: Vec<SearchHit>) {
    for hit in hits {
        match groups.last_mut() {
            Some(group) if group.room_id == hit.event.room_id => {
                group.results.push(hit.event);
            }
            _ => groups.push(ResultGroup {
                room_id: hit.event.room_id.clone(),
                room_name: hit.room_name,
                results: vec![hit.event],
            }),
        }
    }
}

/// Folds a response's highlight list into the session's.
///
/// The literal term is kept in the list even if the server never echoes it
/// back, and the result is sorted longest first so that overlapping
/// highlights prefer the longer match. Duplicates keep first-arrival order.
fn merge_highlights(existing: &mut Vec<String>, incoming: &[String], term: &str) {
    let mut merged: IndexSet<String> = existing.drain(..).collect();
    for highlight in incoming {
        merged.insert(highlight.clone());
    }
    if !merged.contains(term) {
        merged.insert(term.to_owned());
    }
    let mut merged: Vec<String> = merged.into_iter().collect();
    merged.sort_by(|a, b| b.len().cmp(&a.len()));
    *existing = merged;
}
