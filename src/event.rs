//! The event data model shared by every component of the timeline engine.

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The unique ID of a room, as assigned by the homeserver.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// The unique ID of an event.
///
/// Note that an event's ID is only stable once the event has been confirmed
/// by the server; locally-echoed events carry a temporary ID that is swapped
/// out in place when the server echo arrives.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// The unique ID of a user.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

macro_rules! impl_id_newtype {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}
impl_id_newtype!(RoomId);
impl_id_newtype!(EventId);
impl_id_newtype!(UserId);

/// The local send status of an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    /// The event has been confirmed by the server and its ID is stable.
    #[default]
    Sent,
    /// A locally-originated event whose send request is still in flight.
    Sending,
    /// A locally-originated event whose send request failed.
    NotSent,
}

/// A single immutable event in a room's timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub room_id: RoomId,
    /// The user who sent this event, if known. State events synthesized by
    /// the server may not carry a sender.
    pub sender: Option<UserId>,
    /// The event's type string, e.g. `"m.room.message"`.
    pub event_type: String,
    /// Origin server timestamp, in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// The state key, for state events only.
    pub state_key: Option<String>,
    pub send_status: SendStatus,
}

impl Event {
    /// Returns `true` if this event is a local echo, i.e. it has not yet been
    /// confirmed by the server and its ID is not stable.
    pub fn is_local_echo(&self) -> bool {
        self.send_status != SendStatus::Sent
    }

    /// Returns `true` if this event was sent by the given user.
    pub fn is_sent_by(&self, user_id: &UserId) -> bool {
        self.sender.as_ref() == Some(user_id)
    }

    /// Returns this event's timestamp as a local-timezone datetime.
    pub fn timestamp_local(&self) -> Option<DateTime<Local>> {
        Local.timestamp_millis_opt(self.timestamp_ms).single()
    }
}

/// The direction in which to paginate a room's timeline.
///
/// `Backwards` fetches older events; `Forwards` fetches newer ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaginationDirection {
    Backwards,
    Forwards,
}

impl fmt::Display for PaginationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backwards => f.write_str("backwards"),
            Self::Forwards => f.write_str("forwards"),
        }
    }
}
