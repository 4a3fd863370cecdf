//! Datagram framing shared by every participant on the router.
//!
//! A datagram is a flat little-endian byte buffer. Server datagrams start
//! with a recipient list, the sender channel and a message type; control
//! datagrams are addressed to [`CONTROL_CHANNEL`] and carry no sender.
//! Fixed-width values go through bincode's legacy (fixint, little-endian)
//! encoding, so a `u32` always occupies exactly four bytes on the wire.

use bincode::{deserialize_from, serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::{Channel, Location, CONTROL_CHANNEL, INVALID_DO_ID, INVALID_ZONE};

/// Largest payload a single UDP packet can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("datagram would grow to {attempted} bytes, limit is {MAX_DATAGRAM_SIZE}")]
    Overflow { attempted: usize },

    #[error("datagram truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("datagram has no recipients")]
    NoRecipients,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// An outbound datagram under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    buf: Vec<u8>,
}

impl Datagram {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    /// Starts a server datagram addressed to every channel in `to`.
    pub fn server(to: &[Channel], from: Channel, msg_type: u16) -> Result<Self, DatagramError> {
        if to.is_empty() {
            return Err(DatagramError::NoRecipients);
        }
        let count = u8::try_from(to.len()).map_err(|_| DatagramError::Overflow {
            attempted: to.len() * 8,
        })?;

        let mut dg = Self::new();
        dg.add(&count)?;
        for channel in to {
            dg.add(channel)?;
        }
        dg.add(&from)?;
        dg.add(&msg_type)?;
        Ok(dg)
    }

    /// Starts a control datagram for the router itself.
    pub fn control(msg_type: u16) -> Result<Self, DatagramError> {
        let mut dg = Self::new();
        dg.add(&1u8)?;
        dg.add(&CONTROL_CHANNEL)?;
        dg.add(&msg_type)?;
        Ok(dg)
    }

    /// Appends any fixed-layout value.
    pub fn add<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self, DatagramError> {
        let bytes = serialize(value)?;
        self.add_raw(&bytes)
    }

    /// Appends bytes that are already wire-encoded.
    pub fn add_raw(&mut self, bytes: &[u8]) -> Result<&mut Self, DatagramError> {
        let attempted = self.buf.len() + bytes.len();
        if attempted > MAX_DATAGRAM_SIZE {
            return Err(DatagramError::Overflow { attempted });
        }
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    /// Appends a `u16` length prefix followed by the bytes.
    pub fn add_blob(&mut self, bytes: &[u8]) -> Result<&mut Self, DatagramError> {
        let len = u16::try_from(bytes.len()).map_err(|_| DatagramError::Overflow {
            attempted: self.buf.len() + bytes.len(),
        })?;
        self.add(&len)?;
        self.add_raw(bytes)
    }

    /// Appends a location, writing the invalid sentinels when absent.
    pub fn add_location(&mut self, location: Option<Location>) -> Result<&mut Self, DatagramError> {
        let (parent, zone) = match location {
            Some(loc) => (loc.parent, loc.zone),
            None => (INVALID_DO_ID, INVALID_ZONE),
        };
        self.add(&parent)?;
        self.add(&zone)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Routing header of a server datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramHeader {
    pub recipients: Vec<Channel>,
    pub sender: Channel,
    pub msg_type: u16,
}

/// Cursor over a received datagram.
pub struct DatagramIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DatagramIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Reads any fixed-layout value.
    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T, DatagramError> {
        let mut rest = &self.data[self.offset..];
        let before = rest.len();
        let value = deserialize_from(&mut rest).map_err(|e| {
            if matches!(*e, bincode::ErrorKind::Io(_)) {
                DatagramError::Truncated {
                    offset: self.offset,
                    needed: std::mem::size_of::<T>(),
                    available: before,
                }
            } else {
                DatagramError::Codec(e)
            }
        })?;
        self.offset += before - rest.len();
        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8, DatagramError> {
        self.read()
    }

    pub fn read_u16(&mut self) -> Result<u16, DatagramError> {
        self.read()
    }

    pub fn read_u32(&mut self) -> Result<u32, DatagramError> {
        self.read()
    }

    pub fn read_u64(&mut self) -> Result<u64, DatagramError> {
        self.read()
    }

    pub fn read_bool(&mut self) -> Result<bool, DatagramError> {
        Ok(self.read_u8()? != 0)
    }

    /// Takes exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DatagramError> {
        let available = self.remaining();
        if len > available {
            return Err(DatagramError::Truncated {
                offset: self.offset,
                needed: len,
                available,
            });
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Reads a `u16` length prefix and the bytes that follow it.
    pub fn read_blob(&mut self) -> Result<&'a [u8], DatagramError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Reads a location, mapping the invalid sentinels back to `None`.
    pub fn read_location(&mut self) -> Result<Option<Location>, DatagramError> {
        let parent = self.read_u32()?;
        let zone = self.read_u32()?;
        if parent == INVALID_DO_ID && zone == INVALID_ZONE {
            Ok(None)
        } else {
            Ok(Some(Location::new(parent, zone)))
        }
    }

    pub fn read_header(&mut self) -> Result<DatagramHeader, DatagramError> {
        let count = self.read_u8()?;
        if count == 0 {
            return Err(DatagramError::NoRecipients);
        }
        let mut recipients = Vec::with_capacity(count as usize);
        for _ in 0..count {
            recipients.push(self.read_u64()?);
        }
        let sender = self.read_u64()?;
        let msg_type = self.read_u16()?;
        Ok(DatagramHeader {
            recipients,
            sender,
            msg_type,
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}
