//! Error types for the trace reader.
//!
//! Errors are split by how far they reach:
//!
//! - [`FileFormatError`]: the header or format catalog could not be parsed.
//!   Fatal to [`Trace::open`](crate::Trace::open).
//! - [`CorruptRecordError`]: one record (or the page holding it) is malformed.
//!   Ends iteration of that CPU stream only.
//! - [`FieldError`] / [`DecodeError`]: a single field access failed. The
//!   caller decides what to do; the event and the iteration stay usable.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors raised while parsing an event `format` block.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("format for {system}:{event} is missing its `{what}` line")]
    Truncated {
        system: String,
        event: String,
        what: &'static str,
    },

    #[error("invalid event id '{value}' in {system} format")]
    InvalidId { system: String, value: String },

    #[error("{system}:{event}: malformed field line '{line}'")]
    InvalidField {
        system: String,
        event: String,
        line: String,
    },

    #[error("{system}:{event}: field {field} ends at byte {end}, beyond the record limit of {limit}")]
    FieldOutOfBounds {
        system: String,
        event: String,
        field: String,
        end: usize,
        limit: usize,
    },

    #[error("event id {id} declared by both {first} and {second}")]
    DuplicateTypeId { id: u32, first: String, second: String },
}

/// The capture file could not be opened as a trace.
#[derive(Error, Debug)]
pub enum FileFormatError {
    #[error("not a trace-cmd file (bad magic)")]
    BadMagic,

    #[error("unsupported trace file version '{0}'")]
    UnsupportedVersion(String),

    #[error("invalid endianness byte {0}")]
    InvalidEndianness(u8),

    #[error("invalid long size {0}")]
    InvalidLongSize(u8),

    #[error("truncated {0} section")]
    Truncated(&'static str),

    #[error("expected section '{expected}'")]
    MissingSection { expected: &'static str },

    #[error("{0} section is not valid UTF-8")]
    InvalidText(&'static str),

    #[error("malformed option {id}: {reason}")]
    InvalidOption { id: u16, reason: String },

    #[error("unsupported data kind '{0}'")]
    UnsupportedData(String),

    #[error("invalid header_page format: {0}")]
    InvalidPageHeader(String),

    #[error(transparent)]
    Catalog(#[from] FormatError),

    #[error("I/O error reading trace header: {0}")]
    Io(#[from] io::Error),
}

/// Why a record or page was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptKind {
    /// A length-prefixed record declared a length that cannot hold its own header.
    BadLength(u32),
    /// The record runs past the committed data of its page.
    PastCommit { end: usize, commit: usize },
    /// The page's commit word claims more data than fits in a page.
    CommitTooLarge { commit: usize, capacity: usize },
    /// The page is too short to hold its own header.
    ShortPage(usize),
    /// The page lies outside the file.
    BeyondFile { file_size: u64 },
    /// Reading the page failed.
    Io(String),
}

impl fmt::Display for CorruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptKind::BadLength(len) => write!(f, "impossible record length {len}"),
            CorruptKind::PastCommit { end, commit } => {
                write!(f, "record ends at {end}, past page commit {commit}")
            }
            CorruptKind::CommitTooLarge { commit, capacity } => {
                write!(f, "page commit {commit} exceeds page capacity {capacity}")
            }
            CorruptKind::ShortPage(len) => write!(f, "page of {len} bytes is too short"),
            CorruptKind::BeyondFile { file_size } => {
                write!(f, "page extends beyond end of file ({file_size} bytes)")
            }
            CorruptKind::Io(msg) => write!(f, "read failed: {msg}"),
        }
    }
}

/// A malformed record terminated iteration of one CPU stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("corrupt record on cpu {cpu} at offset {offset:#x}: {kind}")]
pub struct CorruptRecordError {
    pub cpu: usize,
    pub offset: u64,
    pub kind: CorruptKind,
}

/// Errors from decoding (or encoding) a single field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("field {field}: bytes {start}..{end} out of bounds for payload of {len} bytes")]
    Truncated {
        field: String,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("field {field} is not valid text")]
    InvalidText { field: String },

    #[error("field {field} cannot be encoded in place")]
    NotEncodable { field: String },

    #[error("field {field}: value does not match the field kind")]
    TypeMismatch { field: String },
}

/// Errors from looking up or coercing a field on an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("no field '{0}'")]
    NoSuchField(String),

    #[error("field '{0}' is not a number field")]
    NotNumeric(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Umbrella error for callers that want a single type.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    FileFormat(#[from] FileFormatError),

    #[error(transparent)]
    CorruptRecord(#[from] CorruptRecordError),

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("cpu {cpu} out of range (trace has {cpus} cpus)")]
    NoSuchCpu { cpu: usize, cpus: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_record_display() {
        let err = CorruptRecordError {
            cpu: 1,
            offset: 0x2010,
            kind: CorruptKind::BadLength(2),
        };
        assert_eq!(
            err.to_string(),
            "corrupt record on cpu 1 at offset 0x2010: impossible record length 2"
        );
    }

    #[test]
    fn test_field_error_wraps_decode() {
        let decode = DecodeError::InvalidText {
            field: "comm".to_string(),
        };
        let err: FieldError = decode.clone().into();
        assert_eq!(err, FieldError::Decode(decode));
        assert_eq!(err.to_string(), "field comm is not valid text");
    }

    #[test]
    fn test_catalog_error_converts_to_file_format() {
        let err: FileFormatError = FormatError::DuplicateTypeId {
            id: 7,
            first: "sched:sched_switch".to_string(),
            second: "irq:irq_handler_entry".to_string(),
        }
        .into();
        assert!(matches!(err, FileFormatError::Catalog(_)));
    }

    #[test]
    fn test_io_error_converts_to_file_format() {
        let err: FileFormatError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(matches!(err, FileFormatError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert!(err.to_string().starts_with("I/O error reading trace header"));
    }
}
