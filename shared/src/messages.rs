//! Typed views of the messages the DBSS exchanges.
//!
//! Inbound object requests are decoded into [`ObjectRequest`] before any
//! state is touched, so a malformed datagram never reaches the cache.

use crate::datagram::{Datagram, DatagramError, DatagramHeader, DatagramIterator};
use crate::dclass::FieldValue;
use crate::msgtypes::*;
use crate::{Channel, DoId, Location};

/// An operation addressed to a single object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectRequest {
    QueryAll {
        do_id: DoId,
        requester: Channel,
        token: u32,
    },
    SetZone {
        do_id: DoId,
        requester: Channel,
        location: Location,
    },
    DeleteRam {
        do_id: DoId,
        requester: Channel,
    },
    DeleteDisk {
        do_id: DoId,
        requester: Channel,
    },
    GetActivated {
        do_id: DoId,
        requester: Channel,
        token: u32,
    },
}

impl ObjectRequest {
    pub fn do_id(&self) -> DoId {
        match self {
            ObjectRequest::QueryAll { do_id, .. }
            | ObjectRequest::SetZone { do_id, .. }
            | ObjectRequest::DeleteRam { do_id, .. }
            | ObjectRequest::DeleteDisk { do_id, .. }
            | ObjectRequest::GetActivated { do_id, .. } => *do_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectRequest::QueryAll { .. } => "QueryAll",
            ObjectRequest::SetZone { .. } => "SetZone",
            ObjectRequest::DeleteRam { .. } => "DeleteRam",
            ObjectRequest::DeleteDisk { .. } => "DeleteDisk",
            ObjectRequest::GetActivated { .. } => "GetActivated",
        }
    }

    /// Decodes the payload of a datagram delivered to `target`.
    ///
    /// Returns `Ok(None)` when the message type is not an object request.
    /// Delete and activation queries name their object in the payload; the
    /// others act on the channel they were delivered to.
    pub fn decode(
        target: DoId,
        header: &DatagramHeader,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<Option<Self>, DatagramError> {
        let requester = header.sender;
        let request = match header.msg_type {
            STATESERVER_OBJECT_GET_ALL => ObjectRequest::QueryAll {
                do_id: target,
                requester,
                token: dgi.read_u32()?,
            },
            STATESERVER_OBJECT_SET_LOCATION => {
                let parent = dgi.read_u32()?;
                let zone = dgi.read_u32()?;
                ObjectRequest::SetZone {
                    do_id: target,
                    requester,
                    location: Location::new(parent, zone),
                }
            }
            STATESERVER_OBJECT_DELETE_RAM => ObjectRequest::DeleteRam {
                do_id: dgi.read_u32()?,
                requester,
            },
            DBSS_OBJECT_DELETE_DISK => ObjectRequest::DeleteDisk {
                do_id: dgi.read_u32()?,
                requester,
            },
            DBSS_OBJECT_GET_ACTIVATED => {
                let token = dgi.read_u32()?;
                ObjectRequest::GetActivated {
                    do_id: dgi.read_u32()?,
                    requester,
                    token,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    /// Builds the datagram a shard would send for this request.
    pub fn encode(&self) -> Result<Datagram, DatagramError> {
        let to = [Channel::from(self.do_id())];
        let dg = match self {
            ObjectRequest::QueryAll {
                requester, token, ..
            } => {
                let mut dg = Datagram::server(&to, *requester, STATESERVER_OBJECT_GET_ALL)?;
                dg.add(token)?;
                dg
            }
            ObjectRequest::SetZone {
                requester,
                location,
                ..
            } => {
                let mut dg = Datagram::server(&to, *requester, STATESERVER_OBJECT_SET_LOCATION)?;
                dg.add(&location.parent)?.add(&location.zone)?;
                dg
            }
            ObjectRequest::DeleteRam { do_id, requester } => {
                let mut dg = Datagram::server(&to, *requester, STATESERVER_OBJECT_DELETE_RAM)?;
                dg.add(do_id)?;
                dg
            }
            ObjectRequest::DeleteDisk { do_id, requester } => {
                let mut dg = Datagram::server(&to, *requester, DBSS_OBJECT_DELETE_DISK)?;
                dg.add(do_id)?;
                dg
            }
            ObjectRequest::GetActivated {
                do_id,
                requester,
                token,
            } => {
                let mut dg = Datagram::server(&to, *requester, DBSS_OBJECT_GET_ACTIVATED)?;
                dg.add(token)?.add(do_id)?;
                dg
            }
        };
        Ok(dg)
    }
}

/// Requests the DBSS sends to the database server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRequest {
    GetAll { context: u32, do_id: DoId },
    Delete { do_id: DoId },
}

impl StoreRequest {
    pub fn decode(
        header: &DatagramHeader,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<Option<Self>, DatagramError> {
        let request = match header.msg_type {
            DBSERVER_OBJECT_GET_ALL => StoreRequest::GetAll {
                context: dgi.read_u32()?,
                do_id: dgi.read_u32()?,
            },
            DBSERVER_OBJECT_DELETE => StoreRequest::Delete {
                do_id: dgi.read_u32()?,
            },
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    pub fn encode(&self, store: Channel) -> Result<Datagram, DatagramError> {
        match self {
            StoreRequest::GetAll { context, do_id } => {
                let mut dg = Datagram::server(&[store], Channel::from(*do_id), DBSERVER_OBJECT_GET_ALL)?;
                dg.add(context)?.add(do_id)?;
                Ok(dg)
            }
            StoreRequest::Delete { do_id } => {
                let mut dg = Datagram::server(&[store], Channel::from(*do_id), DBSERVER_OBJECT_DELETE)?;
                dg.add(do_id)?;
                Ok(dg)
            }
        }
    }
}

/// Builds a database reply to a fetch. `found` carries the class and the
/// stored fields; `None` produces a failure reply.
pub fn store_get_all_response(
    store: Channel,
    do_id: DoId,
    context: u32,
    found: Option<(u16, &[(u16, FieldValue)])>,
) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::server(&[Channel::from(do_id)], store, DBSERVER_OBJECT_GET_ALL_RESP)?;
    dg.add(&context)?;
    match found {
        Some((class_id, fields)) => {
            let count = u16::try_from(fields.len()).map_err(|_| DatagramError::Overflow {
                attempted: dg.len() + fields.len(),
            })?;
            dg.add(&SUCCESS)?.add(&class_id)?.add(&count)?;
            for (field_id, value) in fields {
                dg.add(field_id)?.add_raw(value.as_bytes())?;
            }
        }
        None => {
            dg.add(&FAILURE)?;
        }
    }
    Ok(dg)
}

/// Asks the router to deliver an inclusive channel range to this connection.
pub fn add_range(min: Channel, max: Channel) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::control(CONTROL_ADD_RANGE)?;
    dg.add(&min)?.add(&max)?;
    Ok(dg)
}

pub fn remove_range(min: Channel, max: Channel) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::control(CONTROL_REMOVE_RANGE)?;
    dg.add(&min)?.add(&max)?;
    Ok(dg)
}

pub fn add_channel(channel: Channel) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::control(CONTROL_ADD_CHANNEL)?;
    dg.add(&channel)?;
    Ok(dg)
}

pub fn remove_channel(channel: Channel) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::control(CONTROL_REMOVE_CHANNEL)?;
    dg.add(&channel)?;
    Ok(dg)
}

/// Fixed prefix of a QueryAll reply; required fields follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryAllReply {
    pub token: u32,
    pub class_id: u16,
    pub location: Option<Location>,
}

impl QueryAllReply {
    pub fn read(dgi: &mut DatagramIterator<'_>) -> Result<Self, DatagramError> {
        Ok(Self {
            token: dgi.read_u32()?,
            class_id: dgi.read_u16()?,
            location: dgi.read_location()?,
        })
    }
}

/// Fixed prefix of an Enter broadcast; required fields follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnterLocation {
    pub location: Location,
    pub class_id: u16,
    pub do_id: DoId,
}

impl EnterLocation {
    pub fn read(dgi: &mut DatagramIterator<'_>) -> Result<Self, DatagramError> {
        let parent = dgi.read_u32()?;
        let zone = dgi.read_u32()?;
        Ok(Self {
            location: Location::new(parent, zone),
            class_id: dgi.read_u16()?,
            do_id: dgi.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangingLocation {
    pub do_id: DoId,
    pub new_location: Location,
    pub old_location: Location,
}

impl ChangingLocation {
    pub fn read(dgi: &mut DatagramIterator<'_>) -> Result<Self, DatagramError> {
        let do_id = dgi.read_u32()?;
        let new_location = Location::new(dgi.read_u32()?, dgi.read_u32()?);
        let old_location = Location::new(dgi.read_u32()?, dgi.read_u32()?);
        Ok(Self {
            do_id,
            new_location,
            old_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(dg: &Datagram) -> Option<ObjectRequest> {
        let mut dgi = DatagramIterator::new(dg.as_bytes());
        let header = dgi.read_header().unwrap();
        let target = header.recipients[0] as DoId;
        ObjectRequest::decode(target, &header, &mut dgi).unwrap()
    }

    #[test]
    fn test_object_requests_survive_the_wire() {
        let requests = vec![
            ObjectRequest::QueryAll {
                do_id: 9000,
                requester: 5,
                token: 1,
            },
            ObjectRequest::SetZone {
                do_id: 9001,
                requester: 5,
                location: Location::new(80000, 100),
            },
            ObjectRequest::DeleteRam {
                do_id: 9001,
                requester: 5,
            },
            ObjectRequest::DeleteDisk {
                do_id: 9001,
                requester: 5,
            },
            ObjectRequest::GetActivated {
                do_id: 9002,
                requester: 6,
                token: 44,
            },
        ];

        for request in requests {
            let dg = request.encode().unwrap();
            assert_eq!(decode(&dg), Some(request));
        }
    }

    #[test]
    fn test_set_zone_payload_order() {
        let dg = ObjectRequest::SetZone {
            do_id: 9001,
            requester: 5,
            location: Location::new(80000, 100),
        }
        .encode()
        .unwrap();

        let mut dgi = DatagramIterator::new(dg.as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![9001]);
        assert_eq!(header.sender, 5);
        assert_eq!(header.msg_type, STATESERVER_OBJECT_SET_LOCATION);
        assert_eq!(dgi.read_u32().unwrap(), 80000);
        assert_eq!(dgi.read_u32().unwrap(), 100);
    }

    #[test]
    fn test_unknown_type_is_not_a_request() {
        let dg = Datagram::server(&[9000], 5, 2999).unwrap();
        assert_eq!(decode(&dg), None);
    }

    #[test]
    fn test_truncated_request_is_an_error() {
        let dg = Datagram::server(&[9000], 5, STATESERVER_OBJECT_SET_LOCATION).unwrap();
        let mut bytes = dg.into_bytes();
        bytes.extend_from_slice(&80000u32.to_le_bytes());

        let mut dgi = DatagramIterator::new(&bytes);
        let header = dgi.read_header().unwrap();
        assert!(ObjectRequest::decode(9000, &header, &mut dgi).is_err());
    }

    #[test]
    fn test_store_requests() {
        let get = StoreRequest::GetAll {
            context: 17,
            do_id: 9000,
        };
        let dg = get.encode(200).unwrap();
        let mut dgi = DatagramIterator::new(dg.as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![200]);
        assert_eq!(header.sender, 9000);
        assert_eq!(dgi.remaining(), 8);
        assert_eq!(StoreRequest::decode(&header, &mut dgi).unwrap(), Some(get));

        let delete = StoreRequest::Delete { do_id: 9000 };
        let dg = delete.encode(200).unwrap();
        let mut dgi = DatagramIterator::new(dg.as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(StoreRequest::decode(&header, &mut dgi).unwrap(), Some(delete));
    }

    #[test]
    fn test_store_response_layout() {
        let fields = [(2u16, FieldValue::encode(&3117u32).unwrap())];
        let dg = store_get_all_response(200, 9001, 12, Some((5, &fields[..]))).unwrap();

        let mut dgi = DatagramIterator::new(dg.as_bytes());
        let header = dgi.read_header().unwrap();
        assert_eq!(header.recipients, vec![9001]);
        assert_eq!(header.msg_type, DBSERVER_OBJECT_GET_ALL_RESP);
        assert_eq!(dgi.read_u32().unwrap(), 12);
        assert_eq!(dgi.read_u8().unwrap(), SUCCESS);
        assert_eq!(dgi.read_u16().unwrap(), 5);
        assert_eq!(dgi.read_u16().unwrap(), 1);
        assert_eq!(dgi.read_u16().unwrap(), 2);
        assert_eq!(dgi.read_u32().unwrap(), 3117);

        let failed = store_get_all_response(200, 9001, 13, None).unwrap();
        assert_eq!(failed.len(), 1 + 8 + 8 + 2 + 4 + 1);
    }

    #[test]
    fn test_control_range() {
        let dg = add_range(9000, 9999).unwrap();
        let mut dgi = DatagramIterator::new(dg.as_bytes());
        assert_eq!(dgi.read_u8().unwrap(), 1);
        assert_eq!(dgi.read_u64().unwrap(), crate::CONTROL_CHANNEL);
        assert_eq!(dgi.read_u16().unwrap(), CONTROL_ADD_RANGE);
        assert_eq!(dgi.read_u64().unwrap(), 9000);
        assert_eq!(dgi.read_u64().unwrap(), 9999);
    }
}
