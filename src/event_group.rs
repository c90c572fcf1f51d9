//! Per-event display classification: sender grouping, date separators, and
//! scroll-anchor eligibility.
//!
//! These are pure functions over window snapshots; the rendering layer calls
//! them while laying items out and keeps no state of its own.

use crate::event::Event;

/// How one event should be presented relative to its predecessor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    /// Render without the sender header, as a continuation of the previous
    /// event's group.
    pub continuation: bool,
    /// Render a date separator above this event.
    pub needs_date_separator: bool,
}

/// Classifies `event` against the event rendered directly above it.
///
/// `prev` is `None` for the first event in the window; in that case a date
/// separator appears only when the window actually starts at the beginning
/// of the room's history (`can_paginate_backward == false`), since otherwise
/// the date of the not-yet-loaded events above is unknown.
pub fn classify(
    prev: Option<&Event>,
    event: &Event,
    can_paginate_backward: bool,
) -> Classification {
    let needs_date_separator = match prev {
        None => !can_paginate_backward,
        Some(prev) => !same_local_day(prev, event),
    };
    if needs_date_separator {
        // A separator always breaks the sender group.
        return Classification { continuation: false, needs_date_separator };
    }
    let continuation = match prev {
        None => false,
        Some(prev) => {
            prev.sender.is_some()
                && prev.sender == event.sender
                && prev.event_type == event.event_type
        }
    };
    Classification { continuation, needs_date_separator }
}

/// Whether an event is stable enough to anchor a saved scroll position.
///
/// Unconfirmed events are excluded: their IDs change when the server echo
/// arrives, which would orphan the anchor.
pub fn is_scroll_anchor(event: &Event) -> bool {
    !event.is_local_echo()
}

/// Whether two events fall on the same calendar day in the local timezone.
fn same_local_day(a: &Event, b: &Event) -> bool {
    match (a.timestamp_local(), b.timestamp_local()) {
        (Some(a), Some(b)) => a.date_naive() == b.date_naive(),
        // An unrepresentable timestamp never splits the day.
        _ => true,
    }
}
