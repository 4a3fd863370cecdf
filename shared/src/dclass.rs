//! Minimal class schema: enough to decode stored field values and to emit
//! every required field of an object in declaration order.

use bincode::serialize;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::datagram::{DatagramError, DatagramIterator};

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("class id {0} is defined more than once")]
    DuplicateClass(u16),

    #[error("class {class} defines field id {field} more than once")]
    DuplicateField { class: String, field: u16 },

    #[error("default for {class}.{field} is invalid: {reason}")]
    BadDefault {
        class: String,
        field: String,
        reason: String,
    },
}

/// Wire type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float64,
    String,
    Blob,
}

impl FieldType {
    /// Width in bytes, or `None` for length-prefixed types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            FieldType::Int8 | FieldType::Uint8 => Some(1),
            FieldType::Int16 | FieldType::Uint16 => Some(2),
            FieldType::Int32 | FieldType::Uint32 => Some(4),
            FieldType::Int64 | FieldType::Uint64 | FieldType::Float64 => Some(8),
            FieldType::String | FieldType::Blob => None,
        }
    }

    /// Reads one encoded value of this type, keeping its wire bytes intact.
    pub fn read_value(self, dgi: &mut DatagramIterator<'_>) -> Result<FieldValue, DatagramError> {
        match self.fixed_width() {
            Some(width) => Ok(FieldValue(dgi.read_bytes(width)?.to_vec())),
            None => {
                let body = dgi.read_blob()?;
                let mut bytes = Vec::with_capacity(body.len() + 2);
                bytes.extend_from_slice(&(body.len() as u16).to_le_bytes());
                bytes.extend_from_slice(body);
                Ok(FieldValue(bytes))
            }
        }
    }

    fn encode_default(self, default: Option<&DefaultValue>) -> Result<FieldValue, String> {
        let Some(default) = default else {
            return Ok(match self.fixed_width() {
                Some(width) => FieldValue(vec![0; width]),
                None => FieldValue(vec![0, 0]),
            });
        };

        match (self, default) {
            (FieldType::Int8, DefaultValue::Integer(v)) => encode_int::<i8>(*v),
            (FieldType::Int16, DefaultValue::Integer(v)) => encode_int::<i16>(*v),
            (FieldType::Int32, DefaultValue::Integer(v)) => encode_int::<i32>(*v),
            (FieldType::Int64, DefaultValue::Integer(v)) => encode_int::<i64>(*v),
            (FieldType::Uint8, DefaultValue::Integer(v)) => encode_int::<u8>(*v),
            (FieldType::Uint16, DefaultValue::Integer(v)) => encode_int::<u16>(*v),
            (FieldType::Uint32, DefaultValue::Integer(v)) => encode_int::<u32>(*v),
            (FieldType::Uint64, DefaultValue::Integer(v)) => encode_int::<u64>(*v),
            (FieldType::Float64, DefaultValue::Float(v)) => {
                FieldValue::encode(v).map_err(|e| e.to_string())
            }
            (FieldType::Float64, DefaultValue::Integer(v)) => {
                FieldValue::encode(&(*v as f64)).map_err(|e| e.to_string())
            }
            (FieldType::String | FieldType::Blob, DefaultValue::Text(s)) => {
                let len = u16::try_from(s.len()).map_err(|_| "value too long".to_string())?;
                let mut bytes = len.to_le_bytes().to_vec();
                bytes.extend_from_slice(s.as_bytes());
                Ok(FieldValue(bytes))
            }
            (kind, value) => Err(format!("{value:?} does not fit {kind:?}")),
        }
    }
}

fn encode_int<T>(value: i64) -> Result<FieldValue, String>
where
    T: TryFrom<i64> + Serialize,
{
    let narrowed = T::try_from(value).map_err(|_| format!("{value} is out of range"))?;
    FieldValue::encode(&narrowed).map_err(|e| e.to_string())
}

/// Literal default as written in the schema file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// A field value in its wire encoding. The DBSS never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldValue(Vec<u8>);

impl FieldValue {
    pub fn from_wire(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Encodes a fixed-width value the same way the wire does.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self, DatagramError> {
        Ok(Self(serialize(value)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<DefaultValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    pub id: u16,
    pub name: String,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldDef>,
    #[serde(skip)]
    defaults: HashMap<u16, FieldValue>,
}

impl ClassDef {
    pub fn new(id: u16, name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            id,
            name: name.into(),
            fields,
            defaults: HashMap::new(),
        }
    }

    pub fn field(&self, id: u16) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Required fields in declaration order.
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Encoded default of a required field. Only populated once the class
    /// has been accepted by a [`ClassRegistry`].
    pub fn default_value(&self, field_id: u16) -> Option<&FieldValue> {
        self.defaults.get(&field_id)
    }

    fn resolve_defaults(&mut self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.id) {
                return Err(SchemaError::DuplicateField {
                    class: self.name.clone(),
                    field: field.id,
                });
            }
        }

        let mut defaults = HashMap::new();
        for field in self.required_fields() {
            let value = field
                .kind
                .encode_default(field.default.as_ref())
                .map_err(|reason| SchemaError::BadDefault {
                    class: self.name.clone(),
                    field: field.name.clone(),
                    reason,
                })?;
            defaults.insert(field.id, value);
        }
        self.defaults = defaults;
        Ok(())
    }
}

/// Every class this instance can load, keyed by class id.
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<u16, Arc<ClassDef>>,
}

impl ClassRegistry {
    pub fn new(classes: Vec<ClassDef>) -> Result<Self, SchemaError> {
        let mut registry = HashMap::with_capacity(classes.len());
        for mut class in classes {
            class.resolve_defaults()?;
            let id = class.id;
            if registry.insert(id, Arc::new(class)).is_some() {
                return Err(SchemaError::DuplicateClass(id));
            }
        }
        Ok(Self { classes: registry })
    }

    pub fn get(&self, id: u16) -> Option<Arc<ClassDef>> {
        self.classes.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
