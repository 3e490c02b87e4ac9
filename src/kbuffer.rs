//! Decoder for kernel ring-buffer pages.
//!
//! Each CPU's data region is a sequence of pages copied straight out of the
//! kernel ring buffer. A page starts with a timestamp and a commit word, and is
//! followed by a stream of events. Every event begins with a 32-bit header
//! holding a 5-bit `type_len` and a 27-bit time delta:
//!
//! - `0`: the length lives in the next word, data follows it
//! - `1..=28`: data length is `type_len * 4`, data follows the header
//! - `29`: padding (a zero delta means the rest of the page is unused)
//! - `30`: time extend, the next word holds the high bits of a larger delta
//! - `31`: absolute timestamp
//!
//! On big-endian captures the header bitfields are laid out from the most
//! significant bit, so `type_len` is the top five bits.

use std::ops::Range;

use bitfield::bitfield;
use serde::Serialize;

use crate::endian::Endianness;
use crate::error::CorruptKind;

pub const TYPE_PADDING: u32 = 29;
pub const TYPE_TIME_EXTEND: u32 = 30;
pub const TYPE_TIME_STAMP: u32 = 31;
pub const TYPE_DATA_MAX: u32 = 28;

/// Number of bits of the delta carried in the event header itself.
pub const TS_SHIFT: u32 = 27;

bitfield! {
    struct LeEventHeader(u32);
    type_len, _: 4, 0;
    time_delta, _: 31, 5;
}

bitfield! {
    struct BeEventHeader(u32);
    type_len, _: 31, 27;
    time_delta, _: 26, 0;
}

bitfield! {
    struct CommitWord(u64);
    data_size, _: 26, 0;
    missed_stored, _: 30;
    missed_events, _: 31;
}

fn split_header(word: u32, endian: Endianness) -> (u32, u32) {
    match endian {
        Endianness::Little => {
            let h = LeEventHeader(word);
            (h.type_len(), h.time_delta())
        }
        Endianness::Big => {
            let h = BeEventHeader(word);
            (h.type_len(), h.time_delta())
        }
    }
}

/// Page geometry shared by every CPU of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub page_size: usize,
    /// Width of the commit word (the kernel's `long`).
    pub commit_size: usize,
    /// Offset of the first event within the page.
    pub data_offset: usize,
    pub endian: Endianness,
}

impl PageLayout {
    /// Layout used when the capture doesn't describe its page header.
    pub fn for_long_size(page_size: usize, long_size: usize, endian: Endianness) -> Self {
        Self {
            page_size,
            commit_size: long_size,
            data_offset: 8 + long_size,
            endian,
        }
    }

    /// Bytes of event data a page can hold.
    pub fn capacity(&self) -> usize {
        self.page_size.saturating_sub(self.data_offset)
    }
}

/// Events were lost before this page was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedEvents {
    /// The kernel flagged a loss but didn't record how many.
    Unknown,
    Count(u64),
}

/// Where the decoder stands within a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePos {
    /// Byte offset within the page's data.
    pub offset: usize,
    /// Clock value after the previous event.
    pub ts: u64,
}

/// One data event found on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageEvent {
    /// Offset of the event header within the page's data.
    pub header_offset: usize,
    pub timestamp: u64,
    /// Payload range within the page's data.
    pub data: Range<usize>,
}

/// A decode failure at `offset` within the page's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageError {
    pub offset: usize,
    pub kind: CorruptKind,
}

/// A loaded ring-buffer page, holding only its committed data.
#[derive(Debug, Clone)]
pub struct Page {
    pub index: usize,
    /// File offset of the page start.
    pub file_offset: u64,
    pub timestamp: u64,
    pub missed: Option<MissedEvents>,
    data_offset: usize,
    data: Vec<u8>,
}

/// Read the timestamp and committed length from a page header.
pub fn parse_page_header(bytes: &[u8], layout: &PageLayout) -> Option<(u64, usize)> {
    let ts = layout.endian.u64(bytes.get(0..8)?.try_into().ok()?);
    let commit = layout.endian.read_uint(bytes.get(8..8 + layout.commit_size)?)?;
    Some((ts, CommitWord(commit).data_size() as usize))
}

impl Page {
    /// Decode the header of a raw page and keep its committed data.
    pub fn parse(
        index: usize,
        file_offset: u64,
        bytes: &[u8],
        layout: &PageLayout,
    ) -> Result<Self, PageError> {
        let short = || PageError {
            offset: 0,
            kind: CorruptKind::ShortPage(bytes.len()),
        };
        let word = |range: Range<usize>| {
            bytes
                .get(range)
                .and_then(|b| layout.endian.read_uint(b))
                .ok_or_else(short)
        };
        let ts = word(0..8)?;
        let commit = CommitWord(word(8..8 + layout.commit_size)?);
        let size = commit.data_size() as usize;
        if bytes.len() < layout.data_offset {
            return Err(short());
        }

        let available = bytes.len().saturating_sub(layout.data_offset);
        let capacity = layout.capacity().min(available);
        if size > capacity {
            return Err(PageError {
                offset: 0,
                kind: CorruptKind::CommitTooLarge {
                    commit: size,
                    capacity,
                },
            });
        }

        let data_start = layout.data_offset;
        let data = bytes[data_start..data_start + size].to_vec();

        let missed = if commit.missed_events() {
            let count_at = data_start + size;
            let count = if commit.missed_stored() {
                bytes
                    .get(count_at..count_at + layout.commit_size)
                    .and_then(|b| layout.endian.read_uint(b))
            } else {
                None
            };
            Some(count.map_or(MissedEvents::Unknown, MissedEvents::Count))
        } else {
            None
        };

        Ok(Page {
            index,
            file_offset,
            timestamp: ts,
            missed,
            data_offset: data_start,
            data,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// File offset of a byte within the page's data.
    pub fn file_offset_of(&self, data_offset: usize) -> u64 {
        self.file_offset + (self.data_offset + data_offset) as u64
    }

    /// Position of the first event on the page.
    pub fn start(&self) -> PagePos {
        PagePos {
            offset: 0,
            ts: self.timestamp,
        }
    }

    /// Decode the next data event at or after `pos`.
    ///
    /// Padding and time-keeping events are consumed along the way. Returns
    /// the event and the position just past it, or `None` at the end of the
    /// committed data.
    pub fn next_event(
        &self,
        pos: PagePos,
        endian: Endianness,
    ) -> Result<Option<(PageEvent, PagePos)>, PageError> {
        let data = &self.data;
        let mut off = pos.offset;
        let mut ts = pos.ts;

        let word_at = |at: usize| -> Result<u32, PageError> {
            data.get(at..at + 4)
                .map(|b| endian.u32([b[0], b[1], b[2], b[3]]))
                .ok_or(PageError {
                    offset: at,
                    kind: CorruptKind::PastCommit {
                        end: at + 4,
                        commit: data.len(),
                    },
                })
        };

        loop {
            if off >= data.len() {
                return Ok(None);
            }
            let (type_len, delta) = split_header(word_at(off)?, endian);
            let (data_start, data_len) = match type_len {
                TYPE_PADDING => {
                    if delta == 0 {
                        return Ok(None);
                    }
                    let len = word_at(off + 4)? as usize;
                    ts = ts.wrapping_add(delta as u64);
                    off += 4 + len;
                    continue;
                }
                TYPE_TIME_EXTEND => {
                    let high = word_at(off + 4)? as u64;
                    ts = ts.wrapping_add((high << TS_SHIFT) + delta as u64);
                    off += 8;
                    continue;
                }
                TYPE_TIME_STAMP => {
                    let high = word_at(off + 4)? as u64;
                    ts = (high << TS_SHIFT) + delta as u64;
                    off += 8;
                    continue;
                }
                0 => {
                    let len = word_at(off + 4)?;
                    if len < 4 {
                        return Err(PageError {
                            offset: off,
                            kind: CorruptKind::BadLength(len),
                        });
                    }
                    let len = ((len - 4) as usize + 3) & !3;
                    (off + 8, len)
                }
                n => (off + 4, n as usize * 4),
            };

            let end = data_start + data_len;
            if end > data.len() {
                return Err(PageError {
                    offset: off,
                    kind: CorruptKind::PastCommit {
                        end,
                        commit: data.len(),
                    },
                });
            }
            ts = ts.wrapping_add(delta as u64);
            let event = PageEvent {
                header_offset: off,
                timestamp: ts,
                data: data_start..end,
            };
            return Ok(Some((event, PagePos { offset: end, ts })));
        }
    }

    /// Decode every data event on the page.
    pub fn events(&self, endian: Endianness) -> Result<Vec<PageEvent>, PageError> {
        let mut events = Vec::new();
        let mut pos = self.start();
        while let Some((event, next)) = self.next_event(pos, endian)? {
            events.push(event);
            pos = next;
        }
        Ok(events)
    }
}
