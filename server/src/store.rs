//! Client side of the database server contract.
//!
//! Fetches and deletes are fire-and-forget datagrams; a fetch is answered
//! later by a `DBSERVER_OBJECT_GET_ALL_RESP` carrying the context we chose.

use dbss_shared::msgtypes::SUCCESS;
use dbss_shared::{
    Channel, ClassDef, ClassRegistry, Datagram, DatagramError, DatagramIterator, DoId,
    FieldValue, StoreRequest,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Correlates a fetch with its reply.
pub type Context = u32;

/// Result of a fetch as reported by the database.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found {
        class: Arc<ClassDef>,
        fields: Vec<(u16, FieldValue)>,
    },
    Failed { reason: String },
}

/// A decoded fetch reply.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub context: Context,
    pub outcome: FetchOutcome,
}

/// Builds requests for the database server on `channel` and decodes its
/// replies. Contexts come from a wrapping counter.
pub struct StoreClient {
    channel: Channel,
    next_context: AtomicU32,
}

impl StoreClient {
    /// `first_context` is the first value handed out; later ones count up.
    pub fn new(channel: Channel, first_context: Context) -> Self {
        Self {
            channel,
            next_context: AtomicU32::new(first_context),
        }
    }

    /// Channel the database server listens on; replies come from it.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Hands out the next context. Wraps around after `u32::MAX`.
    pub fn allocate_context(&self) -> Context {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    /// Asks for every stored field of `do_id`.
    pub fn fetch_all(&self, context: Context, do_id: DoId) -> Result<Datagram, DatagramError> {
        StoreRequest::GetAll { context, do_id }.encode(self.channel)
    }

    /// Asks the database to drop `do_id`. No reply is expected.
    pub fn delete(&self, do_id: DoId) -> Result<Datagram, DatagramError> {
        StoreRequest::Delete { do_id }.encode(self.channel)
    }

    /// Decodes a fetch reply positioned just after the routing header.
    ///
    /// Only an unreadable context is an error. Anything wrong after the
    /// context (unknown class, unknown field, short value) is reported as a
    /// failed fetch so the pending load can be released.
    pub fn decode_response(
        &self,
        dgi: &mut DatagramIterator<'_>,
        classes: &ClassRegistry,
    ) -> Result<FetchResponse, DatagramError> {
        let context = dgi.read_u32()?;
        let outcome = match read_outcome(dgi, classes) {
            Ok(outcome) => outcome,
            Err(e) => FetchOutcome::Failed {
                reason: format!("malformed reply: {e}"),
            },
        };
        Ok(FetchResponse { context, outcome })
    }
}

fn read_outcome(
    dgi: &mut DatagramIterator<'_>,
    classes: &ClassRegistry,
) -> Result<FetchOutcome, DatagramError> {
    if dgi.read_u8()? != SUCCESS {
        return Ok(FetchOutcome::Failed {
            reason: "database reported failure".to_string(),
        });
    }

    let class_id = dgi.read_u16()?;
    let Some(class) = classes.get(class_id) else {
        return Ok(FetchOutcome::Failed {
            reason: format!("unknown class {class_id}"),
        });
    };

    let count = dgi.read_u16()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let field_id = dgi.read_u16()?;
        let Some(field) = class.field(field_id) else {
            return Ok(FetchOutcome::Failed {
                reason: format!("class {} has no field {field_id}", class.name),
            });
        };
        fields.push((field_id, field.kind.read_value(dgi)?));
    }

    Ok(FetchOutcome::Found { class, fields })
}
