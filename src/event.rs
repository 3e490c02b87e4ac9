//! Decoded-on-demand view of one record.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::endian::Endianness;
use crate::error::{DecodeError, FieldError};
use crate::field::{self, FieldKind, FieldSchema, Value};
use crate::format::{Catalog, EventSchema, COMMON_PID_FIELD};
use crate::store::RawRecord;
use crate::symbols::{PidTable, UNKNOWN_COMM};

/// A raw record bound to its event schema.
///
/// Fields are decoded on each access; the process id and name are resolved
/// once and cached.
pub struct EventView {
    record: RawRecord,
    schema: Arc<EventSchema>,
    pids: Arc<PidTable>,
    endian: Endianness,
    pid: OnceLock<Result<i32, FieldError>>,
    comm: OnceLock<String>,
}

impl EventView {
    /// Bind `record` to the schema its type id names.
    ///
    /// `None` when the catalog has no schema for the record's type.
    pub fn from_record(
        catalog: &Catalog,
        pids: &Arc<PidTable>,
        endian: Endianness,
        record: RawRecord,
    ) -> Option<Self> {
        let type_id = catalog.record_type(&record.data, endian)?;
        let schema = Arc::clone(catalog.by_type_id(type_id)?);
        Some(EventView {
            record,
            schema,
            pids: Arc::clone(pids),
            endian,
            pid: OnceLock::new(),
            comm: OnceLock::new(),
        })
    }

    fn lookup(&self, name: &str) -> Result<&FieldSchema, FieldError> {
        self.schema
            .find_field(name)
            .ok_or_else(|| FieldError::NoSuchField(name.to_string()))
    }

    /// Decode the named field, common or event-specific.
    pub fn field(&self, name: &str) -> Result<Value, FieldError> {
        let field = self.lookup(name)?;
        Ok(field::decode(field, &self.record.data, self.endian)?)
    }

    /// The named field as a signed integer.
    pub fn num_field(&self, name: &str) -> Result<i64, FieldError> {
        let field = self.lookup(name)?;
        if field.kind != FieldKind::Integer {
            return Err(FieldError::NotNumeric(name.to_string()));
        }
        field::decode(field, &self.record.data, self.endian)?
            .as_i64()
            .ok_or_else(|| FieldError::NotNumeric(name.to_string()))
    }

    /// The named field as text. Only string fields qualify.
    pub fn str_field(&self, name: &str) -> Result<String, FieldError> {
        let field = self.lookup(name)?;
        if !field.kind.is_string() {
            return Err(DecodeError::TypeMismatch {
                field: name.to_string(),
            }
            .into());
        }
        match field::decode(field, &self.record.data, self.endian)? {
            Value::Str(s) => Ok(s),
            _ => Err(DecodeError::TypeMismatch {
                field: name.to_string(),
            }
            .into()),
        }
    }

    /// Like [`str_field`](Self::str_field), replacing invalid UTF-8.
    pub fn str_field_lossy(&self, name: &str) -> Result<String, FieldError> {
        let field = self.lookup(name)?;
        if !field.kind.is_string() {
            return Err(DecodeError::TypeMismatch {
                field: name.to_string(),
            }
            .into());
        }
        let bytes = field::field_data(field, &self.record.data, self.endian)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Overwrite a fixed-layout field in the record payload.
    pub fn set_field(&mut self, name: &str, value: &Value) -> Result<(), FieldError> {
        let field = self
            .schema
            .find_field(name)
            .ok_or_else(|| FieldError::NoSuchField(name.to_string()))?;
        field::encode(field, value, &mut self.record.data, self.endian)?;
        if name == COMMON_PID_FIELD {
            self.pid = OnceLock::new();
            self.comm = OnceLock::new();
        }
        Ok(())
    }

    /// All field names, common fields first.
    pub fn keys(&self) -> Vec<&str> {
        self.schema.keys()
    }

    pub fn common_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.schema.common_fields()
    }

    pub fn event_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.schema.event_fields()
    }

    /// Process id from `common_pid`.
    pub fn pid(&self) -> Result<i32, FieldError> {
        self.pid
            .get_or_init(|| self.num_field(COMMON_PID_FIELD).map(|pid| pid as i32))
            .clone()
    }

    /// Command name of the emitting process.
    pub fn comm(&self) -> &str {
        self.comm.get_or_init(|| match self.pid() {
            Ok(pid) => self.pids.resolve(pid).to_string(),
            Err(_) => UNKNOWN_COMM.to_string(),
        })
    }

    pub fn timestamp(&self) -> u64 {
        self.record.timestamp
    }

    pub fn cpu(&self) -> usize {
        self.record.cpu
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn system(&self) -> &str {
        &self.schema.system
    }

    pub fn type_id(&self) -> u32 {
        self.schema.id
    }

    /// File offset of the underlying record.
    pub fn offset(&self) -> u64 {
        self.record.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.record.data
    }

    pub fn schema(&self) -> &Arc<EventSchema> {
        &self.schema
    }

    pub fn record(&self) -> &RawRecord {
        &self.record
    }

    pub fn into_record(self) -> RawRecord {
        self.record
    }
}

impl fmt::Debug for EventView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventView")
            .field("event", &self.schema.full_name())
            .field("cpu", &self.record.cpu)
            .field("timestamp", &self.record.timestamp)
            .field("offset", &self.record.offset)
            .finish()
    }
}

impl fmt::Display for EventView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp();
        write!(
            f,
            "{}.{:09} CPU{} {}: pid={} comm={} type={}",
            ts / 1_000_000_000,
            ts % 1_000_000_000,
            self.cpu(),
            self.name(),
            self.pid().unwrap_or(-1),
            self.comm(),
            self.type_id()
        )
    }
}
