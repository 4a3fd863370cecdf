//! Location/visibility broadcasts.
//!
//! Observers learn about objects by subscribing to location channels. An
//! object without a location has no observers, so callers never broadcast
//! for one; the builders here take the location explicitly.

use dbss_shared::msgtypes::{
    DBSS_OBJECT_DELETE_DISK, STATESERVER_OBJECT_CHANGING_LOCATION,
    STATESERVER_OBJECT_DELETE_RAM, STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED,
};
use dbss_shared::{Channel, Datagram, DatagramError, DoId, Location};
use log::debug;
use tokio::sync::mpsc;

use crate::error::{queue, DispatchError};
use crate::object::DistributedObject;

/// Which delete an observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    Ram,
    Disk,
}

impl DeleteKind {
    pub fn msg_type(self) -> u16 {
        match self {
            DeleteKind::Ram => STATESERVER_OBJECT_DELETE_RAM,
            DeleteKind::Disk => DBSS_OBJECT_DELETE_DISK,
        }
    }
}

/// Enter: full snapshot so a new observer needs no follow-up query.
pub fn enter_location(obj: &DistributedObject, location: Location) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::server(
        &[location.channel()],
        Channel::from(obj.id()),
        STATESERVER_OBJECT_ENTER_LOCATION_WITH_REQUIRED,
    )?;
    dg.add(&location.parent)?
        .add(&location.zone)?
        .add(&obj.class_id())?
        .add(&obj.id())?;
    obj.add_required_fields(&mut dg)?;
    Ok(dg)
}

/// Change: sent to the old location, sender is whoever moved the object.
pub fn changing_location(
    do_id: DoId,
    requester: Channel,
    new_location: Location,
    old_location: Location,
) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::server(
        &[old_location.channel()],
        requester,
        STATESERVER_OBJECT_CHANGING_LOCATION,
    )?;
    dg.add(&do_id)?
        .add(&new_location.parent)?
        .add(&new_location.zone)?
        .add(&old_location.parent)?
        .add(&old_location.zone)?;
    Ok(dg)
}

/// Delete: sent to the object's last location.
pub fn delete_object(do_id: DoId, location: Location, kind: DeleteKind) -> Result<Datagram, DatagramError> {
    let mut dg = Datagram::server(&[location.channel()], Channel::from(do_id), kind.msg_type())?;
    dg.add(&do_id)?;
    Ok(dg)
}

/// Publishes visibility events onto the outbound queue.
#[derive(Clone)]
pub struct Broadcaster {
    outbound: mpsc::UnboundedSender<Datagram>,
}

impl Broadcaster {
    /// Publishes onto `outbound`, the queue drained by the network sender.
    pub fn new(outbound: mpsc::UnboundedSender<Datagram>) -> Self {
        Self { outbound }
    }

    /// Announces `obj` at `location`. The object need not hold it yet.
    pub fn enter(&self, obj: &DistributedObject, location: Location) -> Result<(), DispatchError> {
        debug!("Object {} entering {}", obj.id(), location);
        queue(&self.outbound, enter_location(obj, location)?)
    }

    /// Announces a move: Change to the old location, then Enter to the new.
    /// Nothing is queued unless both datagrams build.
    pub fn moved(
        &self,
        obj: &DistributedObject,
        requester: Channel,
        old_location: Location,
        new_location: Location,
    ) -> Result<(), DispatchError> {
        let change = changing_location(obj.id(), requester, new_location, old_location)?;
        let enter = enter_location(obj, new_location)?;

        debug!("Object {} moving {} -> {}", obj.id(), old_location, new_location);
        queue(&self.outbound, change)?;
        queue(&self.outbound, enter)
    }

    /// Announces that `do_id` left memory (and, for `Disk`, the database).
    pub fn deleted(&self, do_id: DoId, location: Location, kind: DeleteKind) -> Result<(), DispatchError> {
        debug!("Object {} deleted ({:?}) from {}", do_id, kind, location);
        queue(&self.outbound, delete_object(do_id, location, kind)?)
    }
}
