//! Event format catalog.
//!
//! Every event type compiled into the traced kernel has a `format`
//! description. The capture stores them all; [`Catalog`] parses them once and
//! answers lookups by (system, event name) and by numeric type id.
//!
//! # Module Organization
//!
//! - [`parser`]: text parsing of `format` blocks and `field:` lines

pub mod parser;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::endian::Endianness;
use crate::error::FormatError;
use crate::field::FieldSchema;

pub use parser::{parse_event_format, parse_fields};

/// Name of the field every event uses to store its type id.
pub const COMMON_TYPE_FIELD: &str = "common_type";

/// Name of the field every event uses to store the emitting process id.
pub const COMMON_PID_FIELD: &str = "common_pid";

/// Parsed description of one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSchema {
    pub id: u32,
    pub system: String,
    pub name: String,
    /// Fields in declaration order, common fields first.
    pub fields: Vec<FieldSchema>,
    pub print_fmt: Option<String>,
}

impl EventSchema {
    /// Look a field up by name, common or event-specific.
    pub fn find_field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn common_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.is_common())
    }

    /// Event-specific fields (everything but the common header).
    pub fn event_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| !f.is_common())
    }

    /// All field names, common fields first.
    pub fn keys(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// `system:name`, the usual way to refer to an event.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.system, self.name)
    }
}

/// Constraints applied while building a [`Catalog`].
#[derive(Debug, Clone, Copy)]
pub struct CatalogLimits {
    /// Largest payload any record can carry (the page data capacity).
    pub max_record_len: usize,
    /// Fail on a bad event instead of logging and skipping it.
    pub strict: bool,
}

impl Default for CatalogLimits {
    fn default() -> Self {
        Self {
            max_record_len: usize::MAX,
            strict: true,
        }
    }
}

/// Immutable table of every event schema in a capture.
#[derive(Debug, Default)]
pub struct Catalog {
    schemas: Vec<Arc<EventSchema>>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<(String, String), usize>,
    type_offset: usize,
    type_size: usize,
}

impl Catalog {
    /// Parse a sequence of `(system, format text)` sections.
    pub fn parse<'a, I>(sections: I, limits: CatalogLimits) -> Result<Self, FormatError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut schemas = Vec::new();
        for (system, text) in sections {
            match parse_event_format(system, text) {
                Ok(schema) => schemas.push(schema),
                Err(err) if !limits.strict => warn!("Skipping event format: {err}"),
                Err(err) => return Err(err),
            }
        }
        Self::from_schemas(schemas, limits)
    }

    /// Build the lookup tables from already parsed schemas.
    pub fn from_schemas(
        schemas: Vec<EventSchema>,
        limits: CatalogLimits,
    ) -> Result<Self, FormatError> {
        let mut catalog = Catalog {
            type_offset: 0,
            type_size: 2,
            ..Default::default()
        };
        let mut type_field_set = false;

        for schema in schemas {
            if let Err(err) = catalog.check(&schema, limits) {
                if limits.strict {
                    return Err(err);
                }
                warn!("Skipping event {}: {err}", schema.full_name());
                continue;
            }

            if !type_field_set {
                if let Some(field) = schema.find_field(COMMON_TYPE_FIELD) {
                    catalog.type_offset = field.offset;
                    catalog.type_size = field.size;
                    type_field_set = true;
                }
            }

            let index = catalog.schemas.len();
            catalog.by_id.insert(schema.id, index);
            catalog
                .by_name
                .insert((schema.system.clone(), schema.name.clone()), index);
            catalog.schemas.push(Arc::new(schema));
        }

        debug!(
            "Parsed {} event formats (type id at offset {}, size {})",
            catalog.schemas.len(),
            catalog.type_offset,
            catalog.type_size
        );
        Ok(catalog)
    }

    fn check(&self, schema: &EventSchema, limits: CatalogLimits) -> Result<(), FormatError> {
        if let Some(&existing) = self.by_id.get(&schema.id) {
            return Err(FormatError::DuplicateTypeId {
                id: schema.id,
                first: self.schemas[existing].full_name(),
                second: schema.full_name(),
            });
        }
        if let Some(field) = schema
            .fields
            .iter()
            .find(|f| f.end() > limits.max_record_len)
        {
            return Err(FormatError::FieldOutOfBounds {
                system: schema.system.clone(),
                event: schema.name.clone(),
                field: field.name.clone(),
                end: field.end(),
                limit: limits.max_record_len,
            });
        }
        Ok(())
    }

    pub fn by_name(&self, system: &str, event: &str) -> Option<&Arc<EventSchema>> {
        self.by_name
            .get(&(system.to_string(), event.to_string()))
            .map(|&i| &self.schemas[i])
    }

    pub fn by_type_id(&self, id: u32) -> Option<&Arc<EventSchema>> {
        self.by_id.get(&id).map(|&i| &self.schemas[i])
    }

    /// First schema named `event` in any system.
    pub fn find_event(&self, event: &str) -> Option<&Arc<EventSchema>> {
        self.schemas.iter().find(|s| s.name == event)
    }

    /// Read the type id embedded in a record payload.
    pub fn record_type(&self, payload: &[u8], endian: Endianness) -> Option<u32> {
        let bytes = payload.get(self.type_offset..self.type_offset + self.type_size)?;
        endian.read_uint(bytes).map(|id| id as u32)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EventSchema>> {
        self.schemas.iter()
    }

    /// Distinct system names, in first-seen order.
    pub fn systems(&self) -> Vec<&str> {
        let mut systems: Vec<&str> = Vec::new();
        for schema in &self.schemas {
            if !systems.contains(&schema.system.as_str()) {
                systems.push(&schema.system);
            }
        }
        systems
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
