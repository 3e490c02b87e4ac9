//! Per-CPU record streams over the capture's ring-buffer pages.
//!
//! [`RecordStore`] owns the capture source and one cursor per CPU. A cursor
//! position is a plain value (page index plus position within the page), so
//! peeking is just computing the next position without storing it.
//!
//! A malformed page or record is reported once as a [`CorruptRecordError`];
//! the stream then reads as ended until it is re-seeked or rewound. Other
//! CPUs are never affected.

use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, warn};
use serde::Serialize;

use crate::error::{CorruptKind, CorruptRecordError};
use crate::header::CpuRegion;
use crate::kbuffer::{
    parse_page_header, MissedEvents, Page, PageError, PageEvent, PageLayout, PagePos,
};

/// One record as stored in a CPU's ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawRecord {
    pub cpu: usize,
    /// Absolute timestamp in nanoseconds, time offset applied.
    pub timestamp: u64,
    /// File offset of the record's event header.
    pub offset: u64,
    /// The event payload.
    pub data: Vec<u8>,
    /// Set on the first record of a page when the kernel dropped events
    /// before it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missed_events: Option<MissedEvents>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Position {
    page: usize,
    /// `None` when the page hasn't been entered yet.
    within: Option<PagePos>,
}

impl Position {
    const START: Position = Position {
        page: 0,
        within: None,
    };
}

#[derive(Debug)]
enum StreamState {
    Live,
    /// A seek ran into corruption; the next read reports it.
    Pending(CorruptRecordError),
    Ended,
}

#[derive(Debug)]
struct CpuCursor {
    region: CpuRegion,
    pages: usize,
    at: Position,
    state: StreamState,
    cached: Option<Page>,
}

/// Random and sequential access to every CPU's records.
pub struct RecordStore<R> {
    source: R,
    layout: PageLayout,
    file_len: u64,
    ts_offset: i64,
    cursors: Vec<CpuCursor>,
}

fn io_corrupt(cpu: usize, offset: u64, err: io::Error) -> CorruptRecordError {
    CorruptRecordError {
        cpu,
        offset,
        kind: CorruptKind::Io(err.to_string()),
    }
}

fn make_record(cpu: usize, page: &Page, event: PageEvent, first: bool, ts_offset: i64) -> RawRecord {
    RawRecord {
        cpu,
        timestamp: event.timestamp.saturating_add_signed(ts_offset),
        offset: page.file_offset_of(event.header_offset),
        data: page.data()[event.data].to_vec(),
        missed_events: if first { page.missed } else { None },
    }
}

impl<R: Read + Seek> RecordStore<R> {
    /// `ts_offset` is added to every timestamp the store hands out.
    pub fn new(
        mut source: R,
        regions: Vec<CpuRegion>,
        layout: PageLayout,
        ts_offset: i64,
    ) -> io::Result<Self> {
        let file_len = source.seek(SeekFrom::End(0))?;
        let page_size = layout.page_size as u64;
        let cursors = regions
            .into_iter()
            .enumerate()
            .map(|(cpu, region)| {
                let pages = region.size.div_ceil(page_size) as usize;
                debug!(
                    "cpu {cpu}: {} bytes at {:#x}, {pages} pages",
                    region.size, region.offset
                );
                CpuCursor {
                    region,
                    pages,
                    at: Position::START,
                    state: StreamState::Live,
                    cached: None,
                }
            })
            .collect();
        Ok(RecordStore {
            source,
            layout,
            file_len,
            ts_offset,
            cursors,
        })
    }

    pub fn cpus(&self) -> usize {
        self.cursors.len()
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Give the source back.
    pub fn into_inner(self) -> R {
        self.source
    }

    fn adjust(&self, ts: u64) -> u64 {
        ts.saturating_add_signed(self.ts_offset)
    }

    /// File offset and length of page `index` of `cpu`.
    fn page_span(&self, cpu: usize, index: usize) -> (u64, usize) {
        let cursor = &self.cursors[cpu];
        let start = cursor.region.offset + (index * self.layout.page_size) as u64;
        let len = (cursor.region.end() - start).min(self.layout.page_size as u64);
        (start, len as usize)
    }

    fn read_bytes(&mut self, cpu: usize, offset: u64, len: usize) -> Result<Vec<u8>, CorruptRecordError> {
        if offset.saturating_add(len as u64) > self.file_len {
            return Err(CorruptRecordError {
                cpu,
                offset,
                kind: CorruptKind::BeyondFile {
                    file_size: self.file_len,
                },
            });
        }
        let mut buf = vec![0u8; len];
        self.source
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.source.read_exact(&mut buf))
            .map_err(|err| io_corrupt(cpu, offset, err))?;
        Ok(buf)
    }

    fn page_error(&self, page_offset: u64, cpu: usize, err: PageError) -> CorruptRecordError {
        CorruptRecordError {
            cpu,
            offset: page_offset + (self.layout.data_offset + err.offset) as u64,
            kind: err.kind,
        }
    }

    /// Load page `index` of `cpu` into the cursor's page cache.
    fn load_page(&mut self, cpu: usize, index: usize) -> Result<&Page, CorruptRecordError> {
        let page = match self.cursors[cpu].cached.take() {
            Some(page) if page.index == index => page,
            _ => {
                let (offset, len) = self.page_span(cpu, index);
                let bytes = self.read_bytes(cpu, offset, len)?;
                Page::parse(index, offset, &bytes, &self.layout).map_err(|err| {
                    CorruptRecordError {
                        cpu,
                        offset,
                        kind: err.kind,
                    }
                })?
            }
        };
        let page: &Page = self.cursors[cpu].cached.insert(page);
        Ok(page)
    }

    /// Decode the record at `at` and the position following it.
    fn fetch(
        &mut self,
        cpu: usize,
        mut at: Position,
    ) -> Result<Option<(RawRecord, Position)>, CorruptRecordError> {
        let endian = self.layout.endian;
        let ts_offset = self.ts_offset;
        loop {
            if at.page >= self.cursors[cpu].pages {
                return Ok(None);
            }
            let page = self.load_page(cpu, at.page)?;
            let pos = at.within.unwrap_or_else(|| page.start());
            match page.next_event(pos, endian) {
                Ok(Some((event, next))) => {
                    let record = make_record(cpu, page, event, at.within.is_none(), ts_offset);
                    let next = Position {
                        page: at.page,
                        within: Some(next),
                    };
                    return Ok(Some((record, next)));
                }
                Ok(None) => {
                    at = Position {
                        page: at.page + 1,
                        within: None,
                    };
                }
                Err(err) => {
                    let page_offset = page.file_offset;
                    return Err(self.page_error(page_offset, cpu, err));
                }
            }
        }
    }

    /// Shared body of read and peek. Errors always end the stream.
    fn advance(&mut self, cpu: usize, commit: bool) -> Result<Option<RawRecord>, CorruptRecordError> {
        let Some(cursor) = self.cursors.get_mut(cpu) else {
            return Ok(None);
        };
        match std::mem::replace(&mut cursor.state, StreamState::Live) {
            StreamState::Live => {}
            StreamState::Pending(err) => {
                cursor.state = StreamState::Ended;
                return Err(err);
            }
            StreamState::Ended => {
                cursor.state = StreamState::Ended;
                return Ok(None);
            }
        }

        let at = cursor.at;
        match self.fetch(cpu, at) {
            Ok(Some((record, next))) => {
                if commit {
                    self.cursors[cpu].at = next;
                }
                Ok(Some(record))
            }
            Ok(None) => {
                let cursor = &mut self.cursors[cpu];
                cursor.at = Position {
                    page: cursor.pages,
                    within: None,
                };
                Ok(None)
            }
            Err(err) => {
                warn!("{err}");
                self.cursors[cpu].state = StreamState::Ended;
                Err(err)
            }
        }
    }

    /// Read the next record of `cpu` and advance its cursor.
    pub fn read_next(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.advance(cpu, true)
    }

    /// Return the record `read_next` would, without advancing.
    pub fn peek_next(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.advance(cpu, false)
    }

    /// Read the record whose event header starts at file offset `offset`.
    ///
    /// Cursors are left where they are. `None` when no record starts there.
    pub fn read_at(&mut self, offset: u64) -> Result<Option<RawRecord>, CorruptRecordError> {
        if offset >= self.file_len {
            return Ok(None);
        }
        let Some(cpu) = self
            .cursors
            .iter()
            .position(|c| c.region.contains(offset))
        else {
            return Ok(None);
        };
        let endian = self.layout.endian;
        let ts_offset = self.ts_offset;
        let index = ((offset - self.cursors[cpu].region.offset) / self.layout.page_size as u64) as usize;

        let page = self.load_page(cpu, index)?;
        let mut pos = page.start();
        loop {
            match page.next_event(pos, endian) {
                Ok(Some((event, next))) => {
                    let at = page.file_offset_of(event.header_offset);
                    if at == offset {
                        let first = pos.offset == 0;
                        return Ok(Some(make_record(cpu, page, event, first, ts_offset)));
                    }
                    if at > offset {
                        return Ok(None);
                    }
                    pos = next;
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    let page_offset = page.file_offset;
                    return Err(self.page_error(page_offset, cpu, err));
                }
            }
        }
    }

    /// Page header timestamp of page `index`, or `None` for an empty or
    /// unreadable page.
    fn page_timestamp(&mut self, cpu: usize, index: usize) -> Option<u64> {
        let (offset, len) = self.page_span(cpu, index);
        let len = len.min(8 + self.layout.commit_size);
        let bytes = self.read_bytes(cpu, offset, len).ok()?;
        match parse_page_header(&bytes, &self.layout)? {
            (_, 0) => None,
            (ts, _) => Some(self.adjust(ts)),
        }
    }

    /// Position `cpu` on its first record with timestamp `>= ts`.
    ///
    /// Binary searches the page header timestamps for the last page starting
    /// at or before `ts`, then walks forward. Empty pages sort after every
    /// timestamp. Corruption met during the walk is reported by the next read.
    pub fn seek_to_timestamp(&mut self, cpu: usize, ts: u64) {
        if cpu >= self.cursors.len() {
            return;
        }
        let (mut lo, mut hi) = (0, self.cursors[cpu].pages);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.page_timestamp(cpu, mid) {
                Some(page_ts) if page_ts <= ts => lo = mid + 1,
                _ => hi = mid,
            }
        }

        let mut at = Position {
            page: lo.saturating_sub(1),
            within: None,
        };
        let state = loop {
            match self.fetch(cpu, at) {
                Ok(Some((record, next))) => {
                    if record.timestamp >= ts {
                        break StreamState::Live;
                    }
                    at = next;
                }
                Ok(None) => {
                    at = Position {
                        page: self.cursors[cpu].pages,
                        within: None,
                    };
                    break StreamState::Live;
                }
                Err(err) => {
                    warn!("seek on cpu {cpu}: {err}");
                    break StreamState::Pending(err);
                }
            }
        };
        let cursor = &mut self.cursors[cpu];
        cursor.at = at;
        cursor.state = state;
    }

    pub fn seek_all_to_timestamp(&mut self, ts: u64) {
        for cpu in 0..self.cursors.len() {
            self.seek_to_timestamp(cpu, ts);
        }
    }

    /// Move `cpu` back to its first record and clear any error state.
    pub fn rewind(&mut self, cpu: usize) {
        if let Some(cursor) = self.cursors.get_mut(cpu) {
            cursor.at = Position::START;
            cursor.state = StreamState::Live;
        }
    }

    pub fn rewind_all(&mut self) {
        for cpu in 0..self.cursors.len() {
            self.rewind(cpu);
        }
    }

    /// First record of `cpu`, leaving its cursor alone.
    pub fn first(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        if cpu >= self.cursors.len() {
            return Ok(None);
        }
        Ok(self.fetch(cpu, Position::START)?.map(|(record, _)| record))
    }

    /// Last record of `cpu`, leaving its cursor alone.
    pub fn last(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        let Some(cursor) = self.cursors.get(cpu) else {
            return Ok(None);
        };
        for index in (0..cursor.pages).rev() {
            let mut at = Position {
                page: index,
                within: None,
            };
            let mut last = None;
            while let Some((record, next)) = self.fetch(cpu, at)? {
                if next.page != index {
                    break;
                }
                last = Some(record);
                at = next;
            }
            if last.is_some() {
                return Ok(last);
            }
        }
        Ok(None)
    }
}
