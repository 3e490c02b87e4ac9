//! Parser for the kernel's event `format` text.
//!
//! Each event's description looks like:
//!
//! ```text
//! name: sched_switch
//! ID: 316
//! format:
//! 	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
//! 	field:char prev_comm[16];	offset:8;	size:16;	signed:0;
//!
//! print fmt: "prev_comm=%s ...", REC->prev_comm
//! ```
//!
//! The `header_page` and `header_event` sections of a capture use the same
//! `field:` line grammar.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::FormatError;
use crate::field::{FieldKind, FieldSchema};

use super::EventSchema;

static FIELD_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*field(?:\s+special)?:\s*(?P<decl>[^;]*);\s*offset:\s*(?P<offset>\d+);\s*size:\s*(?P<size>\d+);(?:\s*signed:\s*(?P<signed>\d+);)?",
    )
    .expect("Invalid field line regex pattern")
});

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^name:\s*(\S+)").expect("Invalid name regex pattern"));

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ID:\s*(\S+)").expect("Invalid ID regex pattern"));

/// Split a C declaration like `char prev_comm[16]` into
/// (type, name, has_array_suffix).
fn split_decl(decl: &str) -> Option<(String, String, bool)> {
    let decl = decl.trim();
    let (decl, array) = match decl.strip_suffix(']') {
        Some(stripped) => {
            let open = stripped.rfind('[')?;
            let before = &stripped[..open];
            // `__data_loc char[] name` keeps its brackets in the type; only a
            // suffix glued to the name marks a fixed array.
            if before.ends_with(|c: char| c.is_whitespace()) {
                (decl, false)
            } else {
                (before, true)
            }
        }
        None => (decl, false),
    };

    let split = decl.rfind(|c: char| c.is_whitespace() || c == '*')?;
    let name = decl[split + 1..].trim();
    let type_name = decl[..=split].trim();
    if name.is_empty() || type_name.is_empty() {
        return None;
    }
    Some((type_name.to_string(), name.to_string(), array))
}

/// Parse one `field:` line, or `None` if the line is not a field line at all.
///
/// Older kernels write array fields as `field special:`.
fn parse_field_line(line: &str) -> Option<Option<FieldSchema>> {
    if !line.trim_start().starts_with("field") {
        return None;
    }
    let caps = match FIELD_LINE_RE.captures(line) {
        Some(caps) => caps,
        None => return Some(None),
    };
    let (type_name, name, array) = match split_decl(&caps["decl"]) {
        Some(parts) => parts,
        None => return Some(None),
    };
    let offset = caps["offset"].parse().ok();
    let size = caps["size"].parse().ok();
    let (offset, size) = match (offset, size) {
        (Some(o), Some(s)) => (o, s),
        _ => return Some(None),
    };
    // Old kernels omit `signed:`; fall back to the declared type.
    let signed = match caps.name("signed") {
        Some(m) => m.as_str() != "0",
        None => !type_name.contains("unsigned") && !type_name.starts_with('u'),
    };
    let kind = FieldKind::classify(&type_name, array, size);
    Some(Some(FieldSchema {
        name,
        type_name,
        offset,
        size,
        signed,
        kind,
    }))
}

/// Parse every `field:` line of `text`.
///
/// Used for the page and event header descriptions as well as the field block
/// of event formats.
pub fn parse_fields(system: &str, event: &str, text: &str) -> Result<Vec<FieldSchema>, FormatError> {
    let mut fields = Vec::new();
    for line in text.lines() {
        match parse_field_line(line) {
            None => continue,
            Some(Some(field)) => fields.push(field),
            Some(None) => {
                return Err(FormatError::InvalidField {
                    system: system.to_string(),
                    event: event.to_string(),
                    line: line.trim().to_string(),
                })
            }
        }
    }
    Ok(fields)
}

/// Parse one event `format` description belonging to `system`.
pub fn parse_event_format(system: &str, text: &str) -> Result<EventSchema, FormatError> {
    let mut name: Option<String> = None;
    let mut id: Option<u32> = None;
    let mut in_format = false;
    let mut body = String::new();
    let mut print_fmt = None;

    for line in text.lines() {
        if let Some(caps) = NAME_RE.captures(line) {
            name = Some(caps[1].to_string());
        } else if let Some(caps) = ID_RE.captures(line) {
            let value = &caps[1];
            id = Some(value.parse().map_err(|_| FormatError::InvalidId {
                system: system.to_string(),
                value: value.to_string(),
            })?);
        } else if line.starts_with("format:") {
            in_format = true;
        } else if let Some(rest) = line.strip_prefix("print fmt:") {
            print_fmt = Some(rest.trim().to_string());
            in_format = false;
        } else if in_format {
            body.push_str(line);
            body.push('\n');
        }
    }

    let truncated = |event: &str, what| FormatError::Truncated {
        system: system.to_string(),
        event: event.to_string(),
        what,
    };
    let name = name.ok_or_else(|| truncated("?", "name"))?;
    let id = id.ok_or_else(|| truncated(&name, "ID"))?;
    if !text.lines().any(|l| l.starts_with("format:")) {
        return Err(truncated(&name, "format"));
    }

    let fields = parse_fields(system, &name, &body)?;
    Ok(EventSchema {
        id,
        system: system.to_string(),
        name,
        fields,
        print_fmt,
    })
}
