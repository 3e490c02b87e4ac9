//! Lookup tables carried alongside the event formats in a capture: the
//! pid to command-name map, kernel symbols and printk format strings.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use serde::Serialize;

static CMDLINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(-?\d+)\s+(.+?)\s*$").expect("Invalid cmdline regex pattern"));

static KALLSYMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-fA-F]+)\s+(\S)\s+(\S+)(?:\s+\[([^\]]+)\])?")
        .expect("Invalid kallsyms regex pattern")
});

static PRINTK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:0x)?([0-9a-fA-F]+)\s*:\s*"(.*)"\s*$"#).expect("Invalid printk regex pattern")
});

/// Name reported for pid 0.
pub const IDLE_COMM: &str = "<idle>";

/// Name reported for a pid missing from the table.
pub const UNKNOWN_COMM: &str = "<...>";

/// Process id to command name, from the capture's `cmdlines` section.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PidTable {
    comms: HashMap<i32, String>,
}

impl PidTable {
    /// Parse `<pid> <comm>` lines. Lines that don't match are skipped.
    pub fn from_cmdlines(text: &str) -> Self {
        let mut table = PidTable::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match CMDLINE_RE.captures(line) {
                Some(caps) => match caps[1].parse() {
                    Ok(pid) => table.insert(pid, &caps[2]),
                    Err(_) => debug!("Skipping cmdline with bad pid: {line}"),
                },
                None => debug!("Skipping malformed cmdline: {line}"),
            }
        }
        table
    }

    pub fn insert(&mut self, pid: i32, comm: &str) {
        self.comms.insert(pid, comm.to_string());
    }

    pub fn get(&self, pid: i32) -> Option<&str> {
        self.comms.get(&pid).map(String::as_str)
    }

    /// Command name for display: `<idle>` for pid 0, `<...>` when unknown.
    pub fn resolve(&self, pid: i32) -> &str {
        if pid == 0 {
            return IDLE_COMM;
        }
        self.get(pid).unwrap_or(UNKNOWN_COMM)
    }

    pub fn len(&self) -> usize {
        self.comms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comms.is_empty()
    }
}

/// One kernel symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub address: u64,
    /// nm-style type letter (`t`, `T`, `d`, ...).
    pub kind: char,
    pub name: String,
    pub module: Option<String>,
}

/// Address-sorted kernel symbol table from the `kallsyms` section.
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: BTreeMap<u64, Symbol>,
}

impl SymbolTable {
    pub fn from_kallsyms(text: &str) -> Self {
        let mut symbols = BTreeMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let Some(caps) = KALLSYMS_RE.captures(line) else {
                debug!("Skipping malformed kallsyms line: {line}");
                continue;
            };
            let Ok(address) = u64::from_str_radix(&caps[1], 16) else {
                debug!("Skipping kallsyms line with bad address: {line}");
                continue;
            };
            let symbol = Symbol {
                address,
                kind: caps[2].chars().next().unwrap_or('?'),
                name: caps[3].to_string(),
                module: caps.get(4).map(|m| m.as_str().to_string()),
            };
            symbols.insert(address, symbol);
        }
        SymbolTable { symbols }
    }

    /// The symbol containing `addr` (nearest at or below it) and the offset
    /// of `addr` from its start.
    pub fn lookup(&self, addr: u64) -> Option<(&Symbol, u64)> {
        self.symbols
            .range(..=addr)
            .next_back()
            .map(|(&start, sym)| (sym, addr - start))
    }

    pub fn function_name(&self, addr: u64) -> Option<&str> {
        self.lookup(addr).map(|(sym, _)| sym.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Format strings used by `bprintk` style events, keyed by address.
#[derive(Debug, Default, Clone)]
pub struct PrintkTable {
    formats: BTreeMap<u64, String>,
}

impl PrintkTable {
    pub fn from_text(text: &str) -> Self {
        let mut formats = BTreeMap::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let parsed = PRINTK_RE
                .captures(line)
                .and_then(|caps| Some((u64::from_str_radix(&caps[1], 16).ok()?, caps[2].to_string())));
            match parsed {
                Some((addr, fmt)) => {
                    formats.insert(addr, fmt);
                }
                None => debug!("Skipping malformed printk line: {line}"),
            }
        }
        PrintkTable { formats }
    }

    pub fn get(&self, addr: u64) -> Option<&str> {
        self.formats.get(&addr).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}
