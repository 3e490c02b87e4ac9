//! The top-level trace handle.
//!
//! [`Trace`] ties the parsed header, the record store and the handler
//! registry together and exposes iteration over events. Streams are walked
//! one CPU at a time in ascending CPU order; records are never merged across
//! CPUs by timestamp.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use log::{debug, warn};

use crate::config::TraceConfig;
use crate::endian::Endianness;
use crate::error::{CorruptRecordError, Error, FileFormatError};
use crate::event::EventView;
use crate::format::Catalog;
use crate::handler::{EventHandler, HandlerRegistry, TraceSeq};
use crate::header::TraceHeader;
use crate::store::{RawRecord, RecordStore};

/// Which CPU streams an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuSelector {
    #[default]
    All,
    Cpu(usize),
}

impl From<usize> for CpuSelector {
    fn from(cpu: usize) -> Self {
        CpuSelector::Cpu(cpu)
    }
}

impl From<Option<usize>> for CpuSelector {
    fn from(cpu: Option<usize>) -> Self {
        cpu.map_or(CpuSelector::All, CpuSelector::Cpu)
    }
}

/// First and last timestamps per CPU, computed on first use.
#[derive(Debug)]
struct TimeTable {
    starts: Vec<Option<u64>>,
    ends: Vec<Option<u64>>,
    start: Option<u64>,
    end: Option<u64>,
}

/// An open capture file.
pub struct Trace<R = File> {
    header: TraceHeader,
    store: RecordStore<R>,
    config: TraceConfig,
    handlers: HandlerRegistry,
    times: Option<TimeTable>,
}

impl Trace<File> {
    /// Open a capture with the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FileFormatError> {
        Self::open_with(path, TraceConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: TraceConfig) -> Result<Self, FileFormatError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let trace = Self::from_reader(file, config)?;
        debug!(
            "Opened {}: {} cpus, {} event formats",
            path.display(),
            trace.cpus(),
            trace.catalog().len()
        );
        Ok(trace)
    }
}

impl<R: Read + Seek> Trace<R> {
    /// Parse a capture from any seekable source.
    pub fn from_reader(mut source: R, config: TraceConfig) -> Result<Self, FileFormatError> {
        source.seek(SeekFrom::Start(0))?;
        let mut buffered = BufReader::new(source);
        let header = TraceHeader::read(&mut buffered, &config)?;
        let source = buffered.into_inner();

        let ts_offset = if config.apply_time_offset {
            header.time_offset()
        } else {
            0
        };
        if ts_offset != 0 {
            debug!("Applying time offset of {ts_offset}ns");
        }
        let store = RecordStore::new(source, header.regions.clone(), header.layout, ts_offset)?;
        Ok(Trace {
            header,
            store,
            config,
            handlers: HandlerRegistry::default(),
            times: None,
        })
    }

    /// Release the capture.
    pub fn close(self) {
        debug!("Closing trace");
    }

    pub fn cpus(&self) -> usize {
        self.store.cpus()
    }

    pub fn file_endian(&self) -> Endianness {
        self.header.endian
    }

    pub fn is_file_big_endian(&self) -> bool {
        self.header.endian == Endianness::Big
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn catalog(&self) -> &Catalog {
        &self.header.catalog
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Command name recorded for `pid`.
    pub fn comm_for_pid(&self, pid: i32) -> &str {
        self.header.pids.resolve(pid)
    }

    /// Kernel function containing `addr`.
    pub fn function_name(&self, addr: u64) -> Option<&str> {
        self.header.symbols.function_name(addr)
    }

    pub fn printk_string(&self, addr: u64) -> Option<&str> {
        self.header.printk.get(addr)
    }

    fn selected(&self, cpus: CpuSelector) -> Vec<usize> {
        match cpus {
            CpuSelector::All => (0..self.cpus()).collect(),
            CpuSelector::Cpu(cpu) if cpu < self.cpus() => vec![cpu],
            CpuSelector::Cpu(_) => Vec::new(),
        }
    }

    fn check_cpu(&self, cpu: usize) -> Result<(), Error> {
        if cpu >= self.cpus() {
            return Err(Error::NoSuchCpu {
                cpu,
                cpus: self.cpus(),
            });
        }
        Ok(())
    }

    /// Bind a record to its schema. `None` for an unknown event type.
    pub fn record_to_event(&self, record: RawRecord) -> Option<EventView> {
        EventView::from_record(
            &self.header.catalog,
            &self.header.pids,
            self.header.endian,
            record,
        )
    }

    /// Iterate events of the selected CPUs with timestamps in
    /// `[start_time, end_time]`, one CPU after another.
    ///
    /// Records of unknown type are skipped. A corrupt record yields one error
    /// and iteration continues with the next CPU.
    pub fn events(
        &mut self,
        cpus: CpuSelector,
        start_time: u64,
        end_time: Option<u64>,
    ) -> Events<'_, R> {
        Events {
            records: self.records(cpus, start_time, end_time),
        }
    }

    /// Like [`events`](Self::events), yielding undecoded records.
    pub fn records(
        &mut self,
        cpus: CpuSelector,
        start_time: u64,
        end_time: Option<u64>,
    ) -> Records<'_, R> {
        let cpus = self.selected(cpus);
        Records {
            trace: self,
            cpus,
            index: 0,
            seeked: false,
            start_time,
            end_time,
        }
    }

    /// Position the selected CPUs on their first record at or after
    /// `start_time`. An out-of-range CPU rewinds every CPU.
    pub fn rewind(&mut self, cpus: CpuSelector, start_time: u64) {
        let mut cpus = self.selected(cpus);
        if cpus.is_empty() {
            cpus = self.selected(CpuSelector::All);
        }
        for cpu in cpus {
            if start_time == 0 {
                self.store.rewind(cpu);
            } else {
                self.store.seek_to_timestamp(cpu, start_time);
            }
        }
    }

    /// Position `cpu` on its first record with timestamp `>= ts`.
    pub fn seek(&mut self, cpu: usize, ts: u64) -> Result<(), Error> {
        self.check_cpu(cpu)?;
        self.store.seek_to_timestamp(cpu, ts);
        Ok(())
    }

    pub fn seek_all(&mut self, ts: u64) {
        self.store.seek_all_to_timestamp(ts);
    }

    fn compute_times(&mut self) -> TimeTable {
        let mut starts = Vec::with_capacity(self.cpus());
        let mut ends = Vec::with_capacity(self.cpus());
        for cpu in 0..self.cpus() {
            let first = self.store.first(cpu).unwrap_or_else(|err| {
                warn!("No start time for cpu {cpu}: {err}");
                None
            });
            let last = self.store.last(cpu).unwrap_or_else(|err| {
                warn!("No end time for cpu {cpu}: {err}");
                None
            });
            starts.push(first.map(|r| r.timestamp));
            ends.push(last.map(|r| r.timestamp));
        }
        let start = starts.iter().flatten().copied().min();
        let end = ends.iter().flatten().copied().max();
        debug!("Trace spans {start:?}..{end:?}");
        TimeTable {
            starts,
            ends,
            start,
            end,
        }
    }

    fn time_table(&mut self) -> &TimeTable {
        let times = match self.times.take() {
            Some(times) => times,
            None => self.compute_times(),
        };
        self.times.insert(times)
    }

    /// Timestamp of the first record of the selection; `None` when it holds
    /// no records.
    pub fn start_time(&mut self, cpus: CpuSelector) -> Option<u64> {
        let times = self.time_table();
        match cpus {
            CpuSelector::All => times.start,
            CpuSelector::Cpu(cpu) => times.starts.get(cpu).copied().flatten(),
        }
    }

    /// Timestamp of the last record of the selection.
    pub fn end_time(&mut self, cpus: CpuSelector) -> Option<u64> {
        let times = self.time_table();
        match cpus {
            CpuSelector::All => times.end,
            CpuSelector::Cpu(cpu) => times.ends.get(cpu).copied().flatten(),
        }
    }

    pub fn read_record(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.store.read_next(cpu)
    }

    pub fn peek_record(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.store.peek_next(cpu)
    }

    pub fn read_record_at(&mut self, offset: u64) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.store.read_at(offset)
    }

    pub fn first_record(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.store.first(cpu)
    }

    pub fn last_record(&mut self, cpu: usize) -> Result<Option<RawRecord>, CorruptRecordError> {
        self.store.last(cpu)
    }

    /// Read the next event of `cpu`, skipping records of unknown type.
    pub fn read_event(&mut self, cpu: usize) -> Result<Option<EventView>, CorruptRecordError> {
        while let Some(record) = self.store.read_next(cpu)? {
            if let Some(event) = self.record_to_event(record) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// The event `read_event` would return next. Records of unknown type
    /// ahead of it are consumed.
    pub fn peek_event(&mut self, cpu: usize) -> Result<Option<EventView>, CorruptRecordError> {
        while let Some(record) = self.store.peek_next(cpu)? {
            if let Some(event) = self.record_to_event(record) {
                return Ok(Some(event));
            }
            self.store.read_next(cpu)?;
        }
        Ok(None)
    }

    /// The event whose record starts at file offset `offset`.
    pub fn read_event_at(&mut self, offset: u64) -> Result<Option<EventView>, CorruptRecordError> {
        Ok(self
            .store
            .read_at(offset)?
            .and_then(|record| self.record_to_event(record)))
    }

    /// Register a callback for `system:event`.
    ///
    /// Registering for an event the capture has no format for is allowed; the
    /// handler just never runs.
    pub fn register_event_handler(
        &mut self,
        system: &str,
        event: &str,
        handler: impl EventHandler + 'static,
    ) {
        if self.header.catalog.by_name(system, event).is_none() {
            debug!("Registering handler for unknown event {system}:{event}");
        }
        self.handlers.register(system, event, Box::new(handler));
    }

    /// Run the handlers registered for `event`. Returns how many ran.
    pub fn dispatch(&mut self, event: &EventView, seq: &mut TraceSeq) -> usize {
        self.handlers.dispatch(event, seq)
    }
}

/// Iterator returned by [`Trace::records`].
pub struct Records<'a, R> {
    trace: &'a mut Trace<R>,
    cpus: Vec<usize>,
    index: usize,
    seeked: bool,
    start_time: u64,
    end_time: Option<u64>,
}

impl<R> Records<'_, R> {
    fn next_cpu(&mut self) {
        self.index += 1;
        self.seeked = false;
    }
}

impl<R: Read + Seek> Iterator for Records<'_, R> {
    type Item = Result<RawRecord, CorruptRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cpu = *self.cpus.get(self.index)?;
            if !self.seeked {
                self.trace.store.seek_to_timestamp(cpu, self.start_time);
                self.seeked = true;
            }
            match self.trace.store.read_next(cpu) {
                Ok(Some(record)) => {
                    if self.end_time.is_some_and(|end| record.timestamp > end) {
                        self.next_cpu();
                        continue;
                    }
                    return Some(Ok(record));
                }
                Ok(None) => self.next_cpu(),
                Err(err) => {
                    self.next_cpu();
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Iterator returned by [`Trace::events`].
pub struct Events<'a, R> {
    records: Records<'a, R>,
}

impl<R: Read + Seek> Iterator for Events<'_, R> {
    type Item = Result<EventView, CorruptRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.records.next()? {
                Ok(record) => {
                    if let Some(event) = self.records.trace.record_to_event(record) {
                        return Some(Ok(event));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
