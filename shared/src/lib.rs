//! Wire protocol shared by the DBSS, its tools and its tests.
//!
//! Everything on the router is a channel-addressed datagram. Objects are
//! addressed by their 32-bit id, location interest is addressed by a
//! channel packed from a `(parent, zone)` pair.

pub mod datagram;
pub mod dclass;
pub mod messages;
pub mod msgtypes;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use datagram::{Datagram, DatagramError, DatagramHeader, DatagramIterator};
pub use dclass::{ClassDef, ClassRegistry, FieldDef, FieldType, FieldValue, SchemaError};
pub use messages::{ObjectRequest, StoreRequest};

pub type Channel = u64;
pub type DoId = u32;
pub type ZoneId = u32;

/// Channel addressed by router control messages.
pub const CONTROL_CHANNEL: Channel = 1;

pub const INVALID_DO_ID: DoId = 0xFFFF_FFFF;
pub const INVALID_ZONE: ZoneId = 0xFFFF_FFFF;

/// Where an object currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub parent: DoId,
    pub zone: ZoneId,
}

impl Location {
    pub fn new(parent: DoId, zone: ZoneId) -> Self {
        Self { parent, zone }
    }

    /// The channel observers of this location subscribe to.
    pub fn channel(&self) -> Channel {
        location_channel(self.parent, self.zone)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.parent, self.zone)
    }
}

/// Packs a parent/zone pair into one channel, parent in the high half.
pub fn location_channel(parent: DoId, zone: ZoneId) -> Channel {
    (Channel::from(parent) << 32) | Channel::from(zone)
}

/// Inclusive range of object ids owned by one DBSS instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoIdRange {
    pub min: DoId,
    pub max: DoId,
}

impl DoIdRange {
    pub fn new(min: DoId, max: DoId) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, do_id: DoId) -> bool {
        self.min <= do_id && do_id <= self.max
    }

    /// Maps a delivered channel to an owned object id, if it is one.
    pub fn owned_channel(&self, channel: Channel) -> Option<DoId> {
        DoId::try_from(channel).ok().filter(|id| self.contains(*id))
    }
}

impl fmt::Display for DoIdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
