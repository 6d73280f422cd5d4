//! Per-connection frame context.
//!
//! The frame context is the named-cell table that bridges chunks and
//! sections, within one frame and across frames on the same connection. It
//! is owned exclusively by the task driving that connection; nothing else
//! ever reads or writes it, so no locking is involved and cross-connection
//! data can never flow through it.

use std::collections::{HashMap, HashSet};

use crate::types::Value;

/// Name seeded by the framer after device identification, so protocol
/// templates can reference `${device_id}` without any section exporting it.
pub const DEVICE_ID_VAR: &str = "device_id";

/// Compile-time declaration table: every name a `${...}` reference may
/// legally resolve against. Built once per protocol by the compiler and
/// shared read-only with the plan.
#[derive(Debug, Clone, Default)]
pub struct ContextSchema {
    names: HashSet<String>,
}

impl ContextSchema {
    /// Schema pre-seeded with the ambient names the framer provides.
    pub fn with_ambient() -> Self {
        let mut schema = Self::default();
        schema.declare(DEVICE_ID_VAR);
        schema
    }

    /// Declare a producible name. Returns false if it was already declared
    /// (multiple producers for one name are legal; last write wins).
    pub fn declare(&mut self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Execution-time variable store for one connection.
///
/// Created once per accepted connection and never reset between frames:
/// a value exported in frame N stays visible in frame N+1, which is what
/// lets cross-frame constants (a firmware version, a seeded device id) be
/// produced once and referenced repeatedly.
#[derive(Debug, Default)]
pub struct FrameContext {
    cells: HashMap<String, Value>,
}

impl FrameContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context pre-seeded with the identified device id.
    pub fn seeded(device_id: &str) -> Self {
        let mut ctx = Self::new();
        ctx.set(DEVICE_ID_VAR, Value::Str(device_id.to_string()));
        ctx
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.cells.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.cells.insert(name.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_tracks_declarations() {
        let mut schema = ContextSchema::with_ambient();
        assert!(schema.is_declared(DEVICE_ID_VAR));
        assert!(!schema.is_declared("frame_len"));

        assert!(schema.declare("frame_len"));
        assert!(!schema.declare("frame_len"), "second declaration of the same name");
        assert!(schema.is_declared("frame_len"));
    }

    #[test]
    fn context_persists_and_overwrites() {
        let mut ctx = FrameContext::seeded("vobc1");
        assert_eq!(ctx.get(DEVICE_ID_VAR), Some(&Value::Str("vobc1".into())));

        ctx.set("frame_len", Value::UInt(10));
        assert_eq!(ctx.get("frame_len"), Some(&Value::UInt(10)));

        // Later frames observe the latest write.
        ctx.set("frame_len", Value::UInt(12));
        assert_eq!(ctx.get("frame_len"), Some(&Value::UInt(12)));
        assert!(ctx.get("missing").is_none());
    }
}
