//! Parser for the trace-cmd file header.
//!
//! A version 6 capture opens with a fixed preamble (magic, version, byte
//! order, long size, page size) followed by length-prefixed sections: the page
//! and event header descriptions, the event format texts grouped by system,
//! kallsyms, printk formats, cmdlines, the CPU count, option blocks and
//! finally the `flyrecord` table locating each CPU's ring-buffer pages.
//!
//! Everything here is read once, front to back, before any record is touched.

use std::io::{self, Read};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::config::TraceConfig;
use crate::endian::Endianness;
use crate::error::FileFormatError;
use crate::field::FieldSchema;
use crate::format::{parse_fields, Catalog, CatalogLimits};
use crate::kbuffer::PageLayout;
use crate::symbols::{PidTable, PrintkTable, SymbolTable};

pub const MAGIC: &[u8] = b"\x17\x08\x44tracing";
pub const SUPPORTED_VERSION: &str = "6";

const HEADER_PAGE_TAG: &[u8] = b"header_page\0";
const HEADER_EVENT_TAG: &[u8] = b"header_event\0";
const OPTIONS_TAG: &[u8] = b"options  \0";
const LATENCY_TAG: &[u8] = b"latency  \0";
const FLYRECORD_TAG: &[u8] = b"flyrecord\0";

/// The system name trace-cmd gives the built-in ftrace events.
pub const FTRACE_SYSTEM: &str = "ftrace";

const OPTION_DATE: u16 = 1;
const OPTION_CPUSTAT: u16 = 2;
const OPTION_TRACECLOCK: u16 = 4;
const OPTION_UNAME: u16 = 5;
const OPTION_HOOK: u16 = 6;
const OPTION_OFFSET: u16 = 7;
const OPTION_CPUCOUNT: u16 = 8;
const OPTION_VERSION: u16 = 9;

/// Location of one CPU's ring-buffer pages in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuRegion {
    pub offset: u64,
    pub size: u64,
}

impl CpuRegion {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// A decoded entry of an `options` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceOption {
    /// Offset between the trace clock and wall-clock time.
    Date(String),
    CpuStat { cpu: usize, stat: String },
    TraceClock(String),
    Uname(String),
    Hook(String),
    /// Nanoseconds to add to every record timestamp.
    TimeOffset(i64),
    CpuCount(u32),
    Version(String),
    /// Options this reader doesn't interpret.
    Unknown { id: u16, data: Vec<u8> },
}

/// Everything in a capture file ahead of the ring-buffer data.
#[derive(Debug)]
pub struct TraceHeader {
    pub version: String,
    pub endian: Endianness,
    /// Width of the traced kernel's `long`.
    pub long_size: usize,
    pub page_size: usize,
    pub layout: PageLayout,
    /// Fields of the page header, as described by the capture.
    pub header_page: Vec<FieldSchema>,
    /// Raw text of the event header description.
    pub header_event: String,
    pub catalog: Catalog,
    pub pids: Arc<PidTable>,
    pub symbols: SymbolTable,
    pub printk: PrintkTable,
    pub options: Vec<TraceOption>,
    /// One entry per CPU, indexed by CPU number.
    pub regions: Vec<CpuRegion>,
}

/// Byte-order aware reader that names the section it is in when data runs out.
struct SectionReader<'a, R: Read> {
    inner: &'a mut R,
    endian: Endianness,
}

impl<R: Read> SectionReader<'_, R> {
    fn fill(&mut self, buf: &mut [u8], section: &'static str) -> Result<(), FileFormatError> {
        self.inner.read_exact(buf).map_err(|err| eof_as(err, section))
    }

    fn u8(&mut self, section: &'static str) -> Result<u8, FileFormatError> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf, section)?;
        Ok(buf[0])
    }

    fn u16(&mut self, section: &'static str) -> Result<u16, FileFormatError> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf, section)?;
        Ok(self.endian.u16(buf))
    }

    fn u32(&mut self, section: &'static str) -> Result<u32, FileFormatError> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf, section)?;
        Ok(self.endian.u32(buf))
    }

    fn u64(&mut self, section: &'static str) -> Result<u64, FileFormatError> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf, section)?;
        Ok(self.endian.u64(buf))
    }

    /// Read exactly `len` bytes without trusting `len` for the allocation.
    fn bytes(&mut self, len: u64, section: &'static str) -> Result<Vec<u8>, FileFormatError> {
        let mut buf = Vec::new();
        (&mut *self.inner).take(len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(FileFormatError::Truncated(section));
        }
        Ok(buf)
    }

    fn text(&mut self, len: u64, section: &'static str) -> Result<String, FileFormatError> {
        let bytes = self.bytes(len, section)?;
        String::from_utf8(bytes).map_err(|_| FileFormatError::InvalidText(section))
    }

    /// Read a NUL-terminated string.
    fn cstring(&mut self, section: &'static str) -> Result<String, FileFormatError> {
        let mut bytes = Vec::new();
        loop {
            match self.u8(section)? {
                0 => break,
                b => bytes.push(b),
            }
        }
        String::from_utf8(bytes).map_err(|_| FileFormatError::InvalidText(section))
    }

    fn expect_tag(&mut self, tag: &'static [u8], name: &'static str) -> Result<(), FileFormatError> {
        let mut buf = vec![0u8; tag.len()];
        self.fill(&mut buf, name)?;
        if buf != tag {
            return Err(FileFormatError::MissingSection { expected: name });
        }
        Ok(())
    }
}

fn eof_as(err: io::Error, section: &'static str) -> FileFormatError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        FileFormatError::Truncated(section)
    } else {
        FileFormatError::Io(err)
    }
}

/// Derive the page geometry from the `header_page` description.
fn page_layout(
    fields: &[FieldSchema],
    page_size: usize,
    long_size: usize,
    endian: Endianness,
) -> Result<PageLayout, FileFormatError> {
    let mut layout = PageLayout::for_long_size(page_size, long_size, endian);
    if let Some(commit) = fields.iter().find(|f| f.name == "commit") {
        if !matches!(commit.size, 4 | 8) {
            return Err(FileFormatError::InvalidPageHeader(format!(
                "commit field has size {}",
                commit.size
            )));
        }
        layout.commit_size = commit.size;
    }
    if let Some(data) = fields.iter().find(|f| f.name == "data") {
        layout.data_offset = data.offset;
    }
    if layout.data_offset < 8 + layout.commit_size || layout.data_offset >= page_size {
        return Err(FileFormatError::InvalidPageHeader(format!(
            "data offset {} does not fit a {page_size} byte page",
            layout.data_offset
        )));
    }
    Ok(layout)
}

/// Parse a signed integer written as decimal, `0x` hex or `0` octal.
fn parse_offset(id: u16, text: &str) -> Result<i64, FileFormatError> {
    let text = text.trim();
    let (digits, negative) = match text.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (text, false),
    };
    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8)
    } else {
        digits.parse()
    };
    let value = parsed.map_err(|err| FileFormatError::InvalidOption {
        id,
        reason: format!("'{text}': {err}"),
    })?;
    Ok(if negative { -value } else { value })
}

fn option_string(id: u16, data: &[u8]) -> Result<String, FileFormatError> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    std::str::from_utf8(&data[..end])
        .map(str::to_string)
        .map_err(|_| FileFormatError::InvalidOption {
            id,
            reason: "not valid UTF-8".to_string(),
        })
}

fn decode_option(
    id: u16,
    data: Vec<u8>,
    endian: Endianness,
    next_cpustat: &mut usize,
) -> Result<TraceOption, FileFormatError> {
    Ok(match id {
        OPTION_DATE => TraceOption::Date(option_string(id, &data)?),
        OPTION_CPUSTAT => {
            let cpu = *next_cpustat;
            *next_cpustat += 1;
            TraceOption::CpuStat {
                cpu,
                stat: option_string(id, &data)?,
            }
        }
        OPTION_TRACECLOCK => TraceOption::TraceClock(option_string(id, &data)?),
        OPTION_UNAME => TraceOption::Uname(option_string(id, &data)?),
        OPTION_HOOK => TraceOption::Hook(option_string(id, &data)?),
        OPTION_OFFSET => TraceOption::TimeOffset(parse_offset(id, &option_string(id, &data)?)?),
        OPTION_CPUCOUNT => {
            let bytes: [u8; 4] = data
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| FileFormatError::InvalidOption {
                    id,
                    reason: format!("expected 4 bytes, got {}", data.len()),
                })?;
            TraceOption::CpuCount(endian.u32(bytes))
        }
        OPTION_VERSION => TraceOption::Version(option_string(id, &data)?),
        _ => TraceOption::Unknown { id, data },
    })
}

impl TraceHeader {
    /// Read the header from the start of a capture.
    ///
    /// On success the reader is positioned just after the `flyrecord` table.
    pub fn read<R: Read>(reader: &mut R, config: &TraceConfig) -> Result<Self, FileFormatError> {
        let mut magic = [0u8; 10];
        reader
            .read_exact(&mut magic)
            .map_err(|err| eof_as(err, "magic"))?;
        if magic != MAGIC {
            return Err(FileFormatError::BadMagic);
        }

        // The version is a NUL-terminated string; the byte order isn't known yet.
        let mut r = SectionReader {
            inner: reader,
            endian: Endianness::Little,
        };
        let version = r.cstring("version")?;
        if version != SUPPORTED_VERSION {
            return Err(FileFormatError::UnsupportedVersion(version));
        }

        let endian_byte = r.u8("preamble")?;
        r.endian = Endianness::from_header_byte(endian_byte)
            .ok_or(FileFormatError::InvalidEndianness(endian_byte))?;
        let long_size = r.u8("preamble")?;
        if !matches!(long_size, 4 | 8) {
            return Err(FileFormatError::InvalidLongSize(long_size));
        }
        let long_size = long_size as usize;
        let page_size = r.u32("preamble")? as usize;
        debug!(
            "trace.dat v{version}: {:?} endian, long size {long_size}, page size {page_size}",
            r.endian
        );

        r.expect_tag(HEADER_PAGE_TAG, "header_page")?;
        let len = r.u64("header_page")?;
        let header_page_text = r.text(len, "header_page")?;
        let header_page = parse_fields("header_page", "page", &header_page_text)
            .map_err(|err| FileFormatError::InvalidPageHeader(err.to_string()))?;
        let layout = page_layout(&header_page, page_size, long_size, r.endian)?;

        r.expect_tag(HEADER_EVENT_TAG, "header_event")?;
        let len = r.u64("header_event")?;
        let header_event = r.text(len, "header_event")?;

        let mut formats: Vec<(String, String)> = Vec::new();
        let count = r.u32("ftrace formats")?;
        for _ in 0..count {
            let len = r.u64("ftrace formats")?;
            formats.push((FTRACE_SYSTEM.to_string(), r.text(len, "ftrace formats")?));
        }
        let systems = r.u32("event formats")?;
        for _ in 0..systems {
            let system = r.cstring("event formats")?;
            let count = r.u32("event formats")?;
            for _ in 0..count {
                let len = r.u64("event formats")?;
                formats.push((system.clone(), r.text(len, "event formats")?));
            }
        }
        let limits = CatalogLimits {
            max_record_len: layout.capacity(),
            strict: config.strict_catalog,
        };
        let catalog = Catalog::parse(
            formats.iter().map(|(s, t)| (s.as_str(), t.as_str())),
            limits,
        )?;

        let len = r.u32("kallsyms")?;
        let symbols = SymbolTable::from_kallsyms(&r.text(len as u64, "kallsyms")?);
        let len = r.u32("printk")?;
        let printk = PrintkTable::from_text(&r.text(len as u64, "printk")?);
        let len = r.u64("cmdlines")?;
        let pids = PidTable::from_cmdlines(&r.text(len, "cmdlines")?);
        debug!(
            "{} kallsyms, {} printk formats, {} cmdlines",
            symbols.len(),
            printk.len(),
            pids.len()
        );

        let cpus = r.u32("cpu count")? as usize;

        let mut options = Vec::new();
        let mut next_cpustat = 0;
        loop {
            let mut tag = [0u8; 10];
            r.fill(&mut tag, "data kind")?;
            if tag == OPTIONS_TAG {
                loop {
                    let id = r.u16("options")?;
                    if id == 0 {
                        break;
                    }
                    let len = r.u32("options")?;
                    let data = r.bytes(len as u64, "options")?;
                    let option = decode_option(id, data, r.endian, &mut next_cpustat)?;
                    if let TraceOption::Unknown { id, .. } = &option {
                        debug!("Keeping uninterpreted option {id}");
                    }
                    options.push(option);
                }
            } else if tag == FLYRECORD_TAG {
                break;
            } else if tag == LATENCY_TAG {
                return Err(FileFormatError::UnsupportedData("latency".to_string()));
            } else {
                let kind = String::from_utf8_lossy(&tag)
                    .trim_end_matches(['\0', ' '])
                    .to_string();
                return Err(FileFormatError::UnsupportedData(kind));
            }
        }

        if let Some(declared) = options.iter().find_map(|o| match o {
            TraceOption::CpuCount(n) => Some(*n as usize),
            _ => None,
        }) {
            if declared != cpus {
                warn!("CPUCOUNT option says {declared} cpus, header says {cpus}");
            }
        }

        let mut regions = Vec::with_capacity(cpus.min(4096));
        for _ in 0..cpus {
            let offset = r.u64("flyrecord")?;
            let size = r.u64("flyrecord")?;
            regions.push(CpuRegion { offset, size });
        }

        Ok(TraceHeader {
            version,
            endian: r.endian,
            long_size,
            page_size,
            layout,
            header_page,
            header_event,
            catalog,
            pids: Arc::new(pids),
            symbols,
            printk,
            options,
            regions,
        })
    }

    pub fn cpus(&self) -> usize {
        self.regions.len()
    }

    /// Sum of every OFFSET option, in nanoseconds, saturating at the `i64`
    /// bounds.
    pub fn time_offset(&self) -> i64 {
        self.options.iter().fold(0i64, |total, o| match o {
            TraceOption::TimeOffset(off) => total.saturating_add(*off),
            _ => total,
        })
    }

    pub fn uname(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            TraceOption::Uname(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn trace_clock(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            TraceOption::TraceClock(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        })
    }

    /// Version string of the trace-cmd that recorded the capture.
    pub fn tracer_version(&self) -> Option<&str> {
        self.options.iter().find_map(|o| match o {
            TraceOption::Version(s) => Some(s.as_str()),
            _ => None,
        })
    }
}
