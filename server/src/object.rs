//! In-memory state of an active distributed object.

use dbss_shared::{ClassDef, Datagram, DatagramError, DoId, FieldValue, Location};
use std::collections::HashMap;
use std::sync::Arc;

/// An object that has been loaded from the database and is live in RAM.
///
/// `location` is transient: it is never read from or written to the
/// database and starts out unset on every load.
#[derive(Debug, Clone)]
pub struct DistributedObject {
    id: DoId,
    class: Arc<ClassDef>,
    fields: HashMap<u16, FieldValue>,
    location: Option<Location>,
}

impl DistributedObject {
    /// Builds an object from fetched fields, filling any required field the
    /// database did not return with the class default.
    pub fn from_fetched(id: DoId, class: Arc<ClassDef>, fetched: Vec<(u16, FieldValue)>) -> Self {
        let mut fields: HashMap<u16, FieldValue> = fetched.into_iter().collect();
        for field in class.required_fields() {
            if !fields.contains_key(&field.id) {
                if let Some(default) = class.default_value(field.id) {
                    fields.insert(field.id, default.clone());
                }
            }
        }

        Self {
            id,
            class,
            fields,
            location: None,
        }
    }

    pub fn id(&self) -> DoId {
        self.id
    }

    pub fn class(&self) -> &ClassDef {
        &self.class
    }

    pub fn class_id(&self) -> u16 {
        self.class.id
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = Some(location);
    }

    pub fn field(&self, field_id: u16) -> Option<&FieldValue> {
        self.fields.get(&field_id)
    }

    /// Appends every required field, in declaration order.
    pub fn add_required_fields(&self, dg: &mut Datagram) -> Result<(), DatagramError> {
        for field in self.class.required_fields() {
            // from_fetched guarantees a value for every required field
            if let Some(value) = self.fields.get(&field.id) {
                dg.add_raw(value.as_bytes())?;
            }
        }
        Ok(())
    }
}
