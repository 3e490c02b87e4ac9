//! tracecmd - reader for ftrace `trace.dat` capture files.
//!
//! A capture written by `trace-cmd record` holds one ring-buffer dump per CPU
//! plus the format description of every event the kernel could emit. This
//! library parses the header and formats, walks the per-CPU record streams
//! and decodes event fields on demand.
//!
//! # Modules
//!
//! - [`session`] - [`Trace`], the top-level handle and its iterators
//! - [`header`] - file header, options and per-CPU data locations
//! - [`format`] - event format catalog
//! - [`field`] - field schemas and the field decoder
//! - [`store`] - per-CPU record cursors, seek and random access
//! - [`kbuffer`] - ring-buffer page decoding
//! - [`event`] - [`EventView`], a record bound to its schema
//! - [`handler`] - per-event callbacks and [`TraceSeq`]
//! - [`symbols`] - cmdlines, kallsyms and printk tables
//! - [`config`] - reader options
//!
//! # Example
//!
//! ```no_run
//! use tracecmd::{CpuSelector, Trace};
//!
//! let mut trace = Trace::open("trace.dat").expect("Failed to open trace");
//! for event in trace.events(CpuSelector::All, 0, None) {
//!     match event {
//!         Ok(event) => println!("{event}"),
//!         Err(err) => eprintln!("{err}"),
//!     }
//! }
//! ```

pub mod config;
pub mod endian;
pub mod error;
pub mod event;
pub mod field;
pub mod format;
pub mod handler;
pub mod header;
pub mod kbuffer;
pub mod session;
pub mod store;
pub mod symbols;

pub use config::{ConfigError, TraceConfig};
pub use endian::Endianness;
pub use error::{
    CorruptKind, CorruptRecordError, DecodeError, Error, FieldError, FileFormatError, FormatError,
    Result,
};
pub use event::EventView;
pub use field::{FieldKind, FieldSchema, Value};
pub use format::{Catalog, EventSchema};
pub use handler::{EventHandler, TraceSeq};
pub use header::{CpuRegion, TraceHeader, TraceOption};
pub use session::{CpuSelector, Events, Records, Trace};
pub use store::RawRecord;
