//! Common test utilities for tracecmd integration tests.
//!
//! [`CaptureBuilder`] writes small version 6 `trace.dat` files in either byte
//! order, with a handful of sched and ftrace event formats.

#![allow(dead_code)]

use std::io::Write;

use tempfile::NamedTempFile;
use tracecmd::Endianness;

pub const SWITCH_ID: u16 = 1;
pub const WAKEUP_ID: u16 = 2;
pub const PRINT_ID: u16 = 5;

pub const SCHED_SWITCH: &str = "name: sched_switch
ID: 1
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:char next_comm[16];\toffset:28;\tsize:16;\tsigned:0;
\tfield:pid_t next_pid;\toffset:44;\tsize:4;\tsigned:1;

print fmt: \"prev_comm=%s prev_pid=%d ==> next_comm=%s next_pid=%d\", REC->prev_comm, REC->prev_pid, REC->next_comm, REC->next_pid
";

pub const SCHED_WAKEUP: &str = "name: sched_wakeup
ID: 2
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char comm[16];\toffset:8;\tsize:16;\tsigned:0;
\tfield:pid_t pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:long delay;\toffset:32;\tsize:8;\tsigned:1;

print fmt: \"comm=%s pid=%d\", REC->comm, REC->pid
";

pub const FTRACE_PRINT: &str = "name: print
ID: 5
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:unsigned long ip;\toffset:8;\tsize:8;\tsigned:0;
\tfield:char buf[];\toffset:16;\tsize:0;\tsigned:0;

print fmt: \"%ps: %s\", REC->ip, REC->buf
";

const MAGIC: &[u8] = b"\x17\x08\x44tracing";

pub const OPTION_UNAME: u16 = 5;
pub const OPTION_OFFSET: u16 = 7;

/// Byte-order aware payload writer.
pub struct Payload {
    endian: Endianness,
    buf: Vec<u8>,
}

impl Payload {
    pub fn new(endian: Endianness, len: usize) -> Self {
        Payload {
            endian,
            buf: vec![0u8; len],
        }
    }

    pub fn uint(mut self, offset: usize, size: usize, value: u64) -> Self {
        assert!(self.endian.write_uint(value, &mut self.buf[offset..offset + size]));
        self
    }

    pub fn str(mut self, offset: usize, s: &str) -> Self {
        self.buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
        self
    }

    pub fn common(self, type_id: u16, pid: i32) -> Self {
        self.uint(0, 2, type_id as u64).uint(4, 4, pid as u32 as u64)
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

pub fn switch_payload(
    endian: Endianness,
    pid: i32,
    prev: (&str, i32),
    next: (&str, i32),
) -> Vec<u8> {
    Payload::new(endian, 48)
        .common(SWITCH_ID, pid)
        .str(8, prev.0)
        .uint(24, 4, prev.1 as u32 as u64)
        .str(28, next.0)
        .uint(44, 4, next.1 as u32 as u64)
        .build()
}

pub fn wakeup_payload(endian: Endianness, pid: i32, comm: &str, target: i32, delay: i64) -> Vec<u8> {
    Payload::new(endian, 40)
        .common(WAKEUP_ID, pid)
        .str(8, comm)
        .uint(24, 4, target as u32 as u64)
        .uint(32, 8, delay as u64)
        .build()
}

/// `ftrace:print` payload; the NUL-terminated message fills the rest of the
/// record.
pub fn print_payload(endian: Endianness, pid: i32, ip: u64, msg: &str) -> Vec<u8> {
    Payload::new(endian, 16 + msg.len() + 1)
        .common(PRINT_ID, pid)
        .uint(8, 8, ip)
        .str(16, msg)
        .build()
}

/// A payload whose type id matches no format.
pub fn unknown_payload(endian: Endianness) -> Vec<u8> {
    Payload::new(endian, 8).common(99, 1).build()
}

/// A built capture and where its pages landed.
pub struct Capture {
    pub bytes: Vec<u8>,
    pub page_size: usize,
    /// File offset of every page, per CPU.
    pub pages: Vec<Vec<u64>>,
}

impl Capture {
    /// Overwrite the commit word of a page with an impossible size.
    pub fn corrupt_commit(&mut self, cpu: usize, page: usize) {
        let at = self.pages[cpu][page] as usize + 8;
        self.bytes[at..at + 4].copy_from_slice(&[0xff, 0xff, 0xff, 0x00]);
    }

    pub fn write_temp(&self) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(&self.bytes).expect("Failed to write capture");
        file.flush().expect("Failed to flush capture");
        file
    }
}

pub struct CaptureBuilder {
    endian: Endianness,
    long_size: usize,
    page_size: usize,
    ftrace: Vec<String>,
    systems: Vec<(String, Vec<String>)>,
    kallsyms: String,
    printk: String,
    cmdlines: String,
    options: Vec<(u16, Vec<u8>)>,
    cpus: Vec<Vec<(u64, Vec<u8>)>>,
}

impl CaptureBuilder {
    /// A builder with the sched and ftrace formats and a few cmdlines.
    pub fn new(endian: Endianness) -> Self {
        CaptureBuilder {
            endian,
            long_size: 8,
            page_size: 4096,
            ftrace: vec![FTRACE_PRINT.to_string()],
            systems: vec![(
                "sched".to_string(),
                vec![SCHED_SWITCH.to_string(), SCHED_WAKEUP.to_string()],
            )],
            kallsyms: "ffffffff81000000 T _stext\nffffffff81100000 t schedule\n".to_string(),
            printk: "ffffffff82000000 : \"tick %d\"\n".to_string(),
            cmdlines: "42 bash\n77 sshd\n".to_string(),
            options: Vec::new(),
            cpus: Vec::new(),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn long_size(mut self, long_size: usize) -> Self {
        self.long_size = long_size;
        self
    }

    pub fn system(mut self, name: &str, formats: &[&str]) -> Self {
        self.systems
            .push((name.to_string(), formats.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn option(mut self, id: u16, data: &[u8]) -> Self {
        self.options.push((id, data.to_vec()));
        self
    }

    /// Add a CPU with `(absolute timestamp, payload)` records.
    pub fn cpu(mut self, records: Vec<(u64, Vec<u8>)>) -> Self {
        self.cpus.push(records);
        self
    }

    fn u16(&self, out: &mut Vec<u8>, v: u16) {
        let mut b = [0u8; 2];
        self.endian.write_uint(v as u64, &mut b);
        out.extend_from_slice(&b);
    }

    fn u32(&self, out: &mut Vec<u8>, v: u32) {
        let mut b = [0u8; 4];
        self.endian.write_uint(v as u64, &mut b);
        out.extend_from_slice(&b);
    }

    fn u64(&self, out: &mut Vec<u8>, v: u64) {
        let mut b = [0u8; 8];
        self.endian.write_uint(v, &mut b);
        out.extend_from_slice(&b);
    }

    fn event_header(&self, type_len: u32, delta: u32) -> [u8; 4] {
        match self.endian {
            Endianness::Little => ((delta << 5) | type_len).to_le_bytes(),
            Endianness::Big => ((type_len << 27) | delta).to_be_bytes(),
        }
    }

    /// Encode one record, preceded by a time extend when the delta is large.
    fn encode_record(&self, delta: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut delta = delta;
        if delta >= 1 << 27 {
            out.extend_from_slice(&self.event_header(30, (delta & ((1 << 27) - 1)) as u32));
            self.u32(&mut out, (delta >> 27) as u32);
            delta = 0;
        }
        let padded = (payload.len() + 3) & !3;
        if (4..=112).contains(&padded) {
            out.extend_from_slice(&self.event_header((padded / 4) as u32, delta as u32));
        } else {
            out.extend_from_slice(&self.event_header(0, delta as u32));
            self.u32(&mut out, (padded + 4) as u32);
        }
        out.extend_from_slice(payload);
        out.resize(out.len() + padded - payload.len(), 0);
        out
    }

    fn data_offset(&self) -> usize {
        8 + self.long_size
    }

    /// Pack records into pages. Each page starts at its first record's time.
    fn pages(&self, records: &[(u64, Vec<u8>)]) -> Vec<Vec<u8>> {
        let capacity = self.page_size - self.data_offset();
        let mut pages = Vec::new();
        let mut data: Vec<u8> = Vec::new();
        let mut page_ts = 0;
        let mut last_ts = 0;
        for (ts, payload) in records {
            let mut encoded = self.encode_record(ts - last_ts, payload);
            if data.is_empty() || data.len() + encoded.len() > capacity {
                if !data.is_empty() {
                    pages.push(self.page(page_ts, &data));
                }
                page_ts = *ts;
                encoded = self.encode_record(0, payload);
                data.clear();
            }
            data.extend_from_slice(&encoded);
            last_ts = *ts;
        }
        if !data.is_empty() {
            pages.push(self.page(page_ts, &data));
        }
        pages
    }

    fn page(&self, ts: u64, data: &[u8]) -> Vec<u8> {
        let mut page = Vec::with_capacity(self.page_size);
        self.u64(&mut page, ts);
        let mut commit = vec![0u8; self.long_size];
        self.endian.write_uint(data.len() as u64, &mut commit);
        page.extend_from_slice(&commit);
        page.extend_from_slice(data);
        page.resize(self.page_size, 0);
        page
    }

    fn header_page(&self) -> String {
        let data = self.data_offset();
        format!(
            "\tfield: u64 timestamp;\toffset:0;\tsize:8;\tsigned:0;\n\
             \tfield: local_t commit;\toffset:8;\tsize:{long};\tsigned:1;\n\
             \tfield: int overwrite;\toffset:8;\tsize:1;\tsigned:1;\n\
             \tfield: char data;\toffset:{data};\tsize:{size};\tsigned:1;\n",
            long = self.long_size,
            size = self.page_size - data,
        )
    }

    pub fn build(&self) -> Capture {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(b"6\0");
        out.push(match self.endian {
            Endianness::Little => 0,
            Endianness::Big => 1,
        });
        out.push(self.long_size as u8);
        self.u32(&mut out, self.page_size as u32);

        out.extend_from_slice(b"header_page\0");
        let text = self.header_page();
        self.u64(&mut out, text.len() as u64);
        out.extend_from_slice(text.as_bytes());
        out.extend_from_slice(b"header_event\0");
        let text = "# compressed entry header\n\ttype_len    :    5 bits\n";
        self.u64(&mut out, text.len() as u64);
        out.extend_from_slice(text.as_bytes());

        self.u32(&mut out, self.ftrace.len() as u32);
        for format in &self.ftrace {
            self.u64(&mut out, format.len() as u64);
            out.extend_from_slice(format.as_bytes());
        }
        self.u32(&mut out, self.systems.len() as u32);
        for (name, formats) in &self.systems {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            self.u32(&mut out, formats.len() as u32);
            for format in formats {
                self.u64(&mut out, format.len() as u64);
                out.extend_from_slice(format.as_bytes());
            }
        }

        self.u32(&mut out, self.kallsyms.len() as u32);
        out.extend_from_slice(self.kallsyms.as_bytes());
        self.u32(&mut out, self.printk.len() as u32);
        out.extend_from_slice(self.printk.as_bytes());
        self.u64(&mut out, self.cmdlines.len() as u64);
        out.extend_from_slice(self.cmdlines.as_bytes());

        self.u32(&mut out, self.cpus.len() as u32);
        if !self.options.is_empty() {
            out.extend_from_slice(b"options  \0");
            for (id, data) in &self.options {
                self.u16(&mut out, *id);
                self.u32(&mut out, data.len() as u32);
                out.extend_from_slice(data);
            }
            self.u16(&mut out, 0);
        }
        out.extend_from_slice(b"flyrecord\0");
        let table = out.len();
        out.resize(table + 16 * self.cpus.len(), 0);
        out.resize(out.len().div_ceil(self.page_size) * self.page_size, 0);

        let mut page_offsets = Vec::new();
        for (cpu, records) in self.cpus.iter().enumerate() {
            let start = out.len() as u64;
            let mut offsets = Vec::new();
            for page in self.pages(records) {
                offsets.push(out.len() as u64);
                out.extend_from_slice(&page);
            }
            let size = out.len() as u64 - start;

            let mut entry = Vec::new();
            self.u64(&mut entry, start);
            self.u64(&mut entry, size);
            let at = table + 16 * cpu;
            out[at..at + 16].copy_from_slice(&entry);
            page_offsets.push(offsets);
        }

        Capture {
            bytes: out,
            page_size: self.page_size,
            pages: page_offsets,
        }
    }
}
