//! Per-event callbacks and the text buffer they write into.

use std::collections::HashMap;
use std::fmt;

use log::debug;

use crate::event::EventView;

/// Growable text buffer handed to event handlers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TraceSeq {
    buf: String,
}

impl TraceSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string.
    pub fn puts(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Write for TraceSeq {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.push_str(s);
        Ok(())
    }
}

impl fmt::Display for TraceSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

/// Something that renders or reacts to one kind of event.
pub trait EventHandler: Send {
    fn handle(&mut self, seq: &mut TraceSeq, event: &EventView);
}

impl<F> EventHandler for F
where
    F: FnMut(&mut TraceSeq, &EventView) + Send,
{
    fn handle(&mut self, seq: &mut TraceSeq, event: &EventView) {
        self(seq, event)
    }
}

/// Handlers keyed by (system, event name), run in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Vec<Box<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, system: &str, event: &str, handler: Box<dyn EventHandler>) {
        self.handlers
            .entry((system.to_string(), event.to_string()))
            .or_default()
            .push(handler);
    }

    pub fn has_handlers(&self, system: &str, event: &str) -> bool {
        self.handlers
            .contains_key(&(system.to_string(), event.to_string()))
    }

    /// Run every handler registered for `event`. Returns how many ran.
    pub fn dispatch(&mut self, event: &EventView, seq: &mut TraceSeq) -> usize {
        let key = (event.system().to_string(), event.name().to_string());
        let Some(handlers) = self.handlers.get_mut(&key) else {
            return 0;
        };
        for handler in handlers.iter_mut() {
            handler.handle(seq, event);
        }
        debug!("Dispatched {}:{} to {} handlers", key.0, key.1, handlers.len());
        handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("events", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_trace_seq_write() {
        let mut seq = TraceSeq::new();
        seq.puts("pid=");
        write!(seq, "{}", 42).unwrap();
        assert_eq!(seq.as_str(), "pid=42");
        assert_eq!(seq.len(), 6);
        seq.clear();
        assert!(seq.is_empty());
    }

    #[test]
    fn test_register_counts() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.is_empty());
        registry.register("sched", "sched_switch", Box::new(|seq: &mut TraceSeq, _: &EventView| seq.puts("a")));
        registry.register("sched", "sched_switch", Box::new(|seq: &mut TraceSeq, _: &EventView| seq.puts("b")));
        registry.register("nope", "missing", Box::new(|_: &mut TraceSeq, _: &EventView| {}));
        assert_eq!(registry.len(), 3);
        assert!(registry.has_handlers("sched", "sched_switch"));
        assert!(!registry.has_handlers("sched", "sched_wakeup"));
    }
}
