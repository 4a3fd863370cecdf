//! Request routing for owned objects.
//!
//! The dispatcher is owned by the server's event loop, so every datagram is
//! handled to completion before the next one starts. That gives each object
//! a strict arrival order without any locking.

use dbss_shared::msgtypes::{
    DBSERVER_OBJECT_GET_ALL_RESP, DBSS_OBJECT_GET_ACTIVATED_RESP, STATESERVER_OBJECT_GET_ALL_RESP,
};
use dbss_shared::{
    Channel, ClassRegistry, Datagram, DatagramError, DatagramHeader, DatagramIterator, DoId,
    DoIdRange, Location, ObjectRequest,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broadcaster::{Broadcaster, DeleteKind};
use crate::cache::{ObjectCache, ObjectState};
use crate::error::{queue, DispatchError};
use crate::object::DistributedObject;
use crate::store::{Context, FetchOutcome, StoreClient};

/// Routes object requests and database replies for one owned id range.
///
/// All outbound traffic (replies, broadcasts, database requests) goes onto
/// the `outbound` queue, which the network layer drains onto the socket.
pub struct Dispatcher {
    range: DoIdRange,
    classes: Arc<ClassRegistry>,
    cache: ObjectCache,
    store: StoreClient,
    broadcaster: Broadcaster,
    outbound: mpsc::UnboundedSender<Datagram>,
    load_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with an empty cache. Loads that get no database
    /// reply within `load_timeout` fail on the next sweep.
    pub fn new(
        range: DoIdRange,
        classes: Arc<ClassRegistry>,
        store: StoreClient,
        load_timeout: Duration,
        outbound: mpsc::UnboundedSender<Datagram>,
    ) -> Self {
        Self {
            range,
            classes,
            cache: ObjectCache::new(),
            store,
            broadcaster: Broadcaster::new(outbound.clone()),
            outbound,
            load_timeout,
        }
    }

    /// Read-only view of the object cache.
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Handles one datagram delivered by the router.
    ///
    /// Malformed input is logged and dropped, as is any request whose reply
    /// or broadcast cannot be built. Only a closed outbound queue is
    /// returned as an error.
    pub fn handle_datagram(&mut self, data: &[u8]) -> Result<(), DispatchError> {
        let mut dgi = DatagramIterator::new(data);
        let header = match dgi.read_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping datagram with unreadable header: {}", e);
                return Ok(());
            }
        };

        if header.msg_type == DBSERVER_OBJECT_GET_ALL_RESP {
            return self.handle_store_response(&header, &mut dgi);
        }

        // decode everything before touching any object
        let requests = match self.decode_requests(data, &header, dgi.offset()) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(
                    "Dropping malformed message type {} from channel {}: {}",
                    header.msg_type, header.sender, e
                );
                return Ok(());
            }
        };

        for request in requests {
            self.process_logged(request, false)?;
        }
        Ok(())
    }

    /// Runs `process`. A reply or broadcast that fails to build is logged
    /// and skipped; only a closed outbound queue is passed up.
    fn process_logged(&mut self, request: ObjectRequest, replayed: bool) -> Result<(), DispatchError> {
        let name = request.name();
        let do_id = request.do_id();
        match self.process(request, replayed) {
            Err(DispatchError::Datagram(e)) => {
                warn!("Failed to handle {} for object {}: {}", name, do_id, e);
                Ok(())
            }
            other => other,
        }
    }

    fn decode_requests(
        &self,
        data: &[u8],
        header: &DatagramHeader,
        payload_offset: usize,
    ) -> Result<Vec<ObjectRequest>, DatagramError> {
        let mut requests: Vec<ObjectRequest> = Vec::new();

        for &channel in &header.recipients {
            let Some(target) = self.range.owned_channel(channel) else {
                debug!("Ignoring recipient channel {} outside {}", channel, self.range);
                continue;
            };

            let mut payload = DatagramIterator::new(&data[payload_offset..]);
            match ObjectRequest::decode(target, header, &mut payload)? {
                Some(request) => {
                    // deletes name their object in the payload, so several
                    // recipients can decode to the same request
                    if !requests.contains(&request) {
                        requests.push(request);
                    }
                }
                None => debug!(
                    "Ignoring unknown message type {} for object {}",
                    header.msg_type, target
                ),
            }
        }

        Ok(requests)
    }

    /// Applies one request with arrival semantics.
    pub fn handle_request(&mut self, request: ObjectRequest) -> Result<(), DispatchError> {
        self.process(request, false)
    }

    /// `replayed` marks requests coming out of a pending load's queue; their
    /// arrival-time side effects have already happened.
    fn process(&mut self, request: ObjectRequest, replayed: bool) -> Result<(), DispatchError> {
        let do_id = request.do_id();
        if !self.range.contains(do_id) {
            debug!(
                "Dropping {} for object {} outside {}",
                request.name(),
                do_id,
                self.range
            );
            return Ok(());
        }

        match &request {
            ObjectRequest::GetActivated {
                requester, token, ..
            } => return self.reply_activated(do_id, *requester, *token),
            ObjectRequest::DeleteDisk { .. } if !replayed => {
                // the database copy goes whatever the cache state
                queue(&self.outbound, self.store.delete(do_id)?)?;
            }
            _ => {}
        }

        match self.cache.state(do_id) {
            ObjectState::Active => self.apply(request),
            ObjectState::Loading => {
                debug!("Queueing {} behind load of object {}", request.name(), do_id);
                if let Err(request) = self.cache.enqueue(request) {
                    warn!("Could not queue {} for object {}", request.name(), do_id);
                }
                Ok(())
            }
            ObjectState::Unloaded => match request {
                ObjectRequest::QueryAll { .. } | ObjectRequest::SetZone { .. } => {
                    self.begin_load(request)
                }
                _ => {
                    debug!("{} on unloaded object {}, nothing to do", request.name(), do_id);
                    Ok(())
                }
            },
        }
    }

    fn begin_load(&mut self, request: ObjectRequest) -> Result<(), DispatchError> {
        let do_id = request.do_id();
        let context = self.next_free_context();
        let fetch = self.store.fetch_all(context, do_id)?;

        if let Err(request) = self.cache.begin_load(do_id, context, request) {
            warn!("Could not start loading object {} for {}", do_id, request.name());
            return Ok(());
        }

        debug!("Loading object {} with context {}", do_id, context);
        queue(&self.outbound, fetch)
    }

    fn next_free_context(&self) -> Context {
        loop {
            let context = self.store.allocate_context();
            if !self.cache.is_context_pending(context) {
                return context;
            }
        }
    }

    /// Applies a request to an Active object.
    fn apply(&mut self, request: ObjectRequest) -> Result<(), DispatchError> {
        match request {
            ObjectRequest::QueryAll {
                do_id,
                requester,
                token,
            } => self.reply_query_all(do_id, requester, token),
            ObjectRequest::SetZone {
                do_id,
                requester,
                location,
            } => self.set_location(do_id, requester, location),
            ObjectRequest::DeleteRam { do_id, .. } => self.remove_object(do_id, DeleteKind::Ram),
            ObjectRequest::DeleteDisk { do_id, .. } => self.remove_object(do_id, DeleteKind::Disk),
            ObjectRequest::GetActivated {
                do_id,
                requester,
                token,
            } => self.reply_activated(do_id, requester, token),
        }
    }

    fn reply_query_all(&self, do_id: DoId, requester: Channel, token: u32) -> Result<(), DispatchError> {
        let Some(obj) = self.cache.get(do_id) else {
            return Ok(());
        };

        let mut dg = Datagram::server(
            &[requester],
            Channel::from(do_id),
            STATESERVER_OBJECT_GET_ALL_RESP,
        )?;
        dg.add(&token)?
            .add(&obj.class_id())?
            .add_location(obj.location())?;
        obj.add_required_fields(&mut dg)?;
        queue(&self.outbound, dg)
    }

    fn set_location(
        &mut self,
        do_id: DoId,
        requester: Channel,
        location: Location,
    ) -> Result<(), DispatchError> {
        let Some(obj) = self.cache.get_mut(do_id) else {
            return Ok(());
        };

        // the location only changes once the move has been announced
        match obj.location() {
            Some(old) if old == location => {
                debug!("Object {} already at {}", do_id, location);
                return Ok(());
            }
            Some(old) => self.broadcaster.moved(obj, requester, old, location)?,
            None => self.broadcaster.enter(obj, location)?,
        }
        obj.set_location(location);
        Ok(())
    }

    fn remove_object(&mut self, do_id: DoId, kind: DeleteKind) -> Result<(), DispatchError> {
        let Some(obj) = self.cache.remove(do_id) else {
            return Ok(());
        };

        info!("Object {} removed from memory ({:?})", do_id, kind);
        match obj.location() {
            Some(location) => self.broadcaster.deleted(do_id, location, kind),
            None => Ok(()),
        }
    }

    fn reply_activated(&self, do_id: DoId, requester: Channel, token: u32) -> Result<(), DispatchError> {
        let activated = self.cache.state(do_id) == ObjectState::Active;
        let mut dg = Datagram::server(
            &[requester],
            Channel::from(do_id),
            DBSS_OBJECT_GET_ACTIVATED_RESP,
        )?;
        dg.add(&token)?.add(&do_id)?.add(&activated)?;
        queue(&self.outbound, dg)
    }

    fn handle_store_response(
        &mut self,
        header: &DatagramHeader,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<(), DispatchError> {
        let response = match self.store.decode_response(dgi, &self.classes) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping unreadable database reply: {}", e);
                return Ok(());
            }
        };

        let Some(do_id) = self.cache.pending_object(response.context) else {
            debug!("Ignoring database reply with stale context {}", response.context);
            return Ok(());
        };

        if header.sender != self.store.channel()
            || !header.recipients.contains(&Channel::from(do_id))
        {
            debug!(
                "Ignoring database reply for context {}: expected {} -> {}, got {} -> {:?}",
                response.context,
                self.store.channel(),
                do_id,
                header.sender,
                header.recipients
            );
            return Ok(());
        }

        let Some(pending) = self.cache.take_pending(response.context) else {
            return Ok(());
        };

        match response.outcome {
            FetchOutcome::Found { class, fields } => {
                let obj = DistributedObject::from_fetched(do_id, class, fields);
                info!("Object {} activated as {}", do_id, obj.class().name);
                self.cache.activate(obj);

                for request in pending.queue {
                    self.process_logged(request, true)?;
                }
                Ok(())
            }
            FetchOutcome::Failed { reason } => {
                warn!(
                    "Failed to load object {}: {}; dropping {} queued request(s)",
                    do_id,
                    reason,
                    pending.queue.len()
                );
                Ok(())
            }
        }
    }

    /// Fails every load that has waited longer than the load timeout.
    pub fn expire_pending_loads(&mut self) -> usize {
        let expired = self.cache.expire(self.load_timeout);
        for pending in &expired {
            warn!(
                "Load of object {} timed out (context {}); dropping {} queued request(s)",
                pending.do_id,
                pending.context,
                pending.queue.len()
            );
        }
        expired.len()
    }
}
