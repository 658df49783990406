//! Typed path access to the shared segment
//!
//! `SharedStore` compiles a schema, opens the named segment, runs the
//! initialization handshake, and then serves coercing typed reads and
//! writes by hierarchical path. Every access optionally acquires the
//! resolved node's container semaphore (`protect = true`); callers that
//! already hold the semaphore pass `protect = false`.
//!
//! Semaphore rules (enforced by convention, not by the library): never
//! hold two container semaphores at once, never re-acquire a held one,
//! keep hold windows short, and stay out of signal handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Number, Value};
use tracing::error;

use crate::access::Payload;
use crate::clock::monotonic_ms;
use crate::config::UPDATE_POLL_US;
use crate::error::{Result, StoreError};
use crate::layout::{plan, Directory, LayoutNode, NodeKind};
use crate::schema::SchemaNode;
use crate::segment::{self, SharedSegment};
use crate::sem::{init_sem_name, NamedSemaphore};
use crate::tree;

/// A schema-driven typed object store backed by a named shared-memory
/// segment.
#[derive(Debug)]
pub struct SharedStore {
    directory: Directory,
    segment: SharedSegment,
    init_sem: Arc<NamedSemaphore>,
    initialized: bool,
}

/// Releases the held semaphore when dropped, on every exit path.
struct SemGuard<'a> {
    sem: &'a NamedSemaphore,
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sem.post() {
            error!("semaphore release failed: {}", err);
        }
    }
}

impl SharedStore {
    /// Build the store from an already-parsed schema description (a map)
    /// and attach to the named segment.
    pub fn new(def: &Value, segment_name: &str) -> Result<Self> {
        let schema = SchemaNode::parse_root(def)?;
        Self::build(&schema, segment_name)
    }

    /// Build the store from a JSON schema file.
    pub fn from_file(config_path: impl AsRef<Path>, segment_name: &str) -> Result<Self> {
        let def = tree::parse_json_file(config_path)?;
        let schema = SchemaNode::parse_root(&def)?;
        Self::build(&schema, segment_name)
    }

    /// Like [`SharedStore::new`], but invokes `f` iff this process
    /// performed the first-writer initialization, so one application can
    /// seed values the schema defaults do not cover. Every cooperating
    /// application should use this form when such seeding is required,
    /// since any of them may end up being the initializer.
    pub fn with_initializer(
        def: &Value,
        segment_name: &str,
        f: impl FnOnce(&SharedStore),
    ) -> Result<Self> {
        let store = Self::new(def, segment_name)?;
        if store.initialized {
            f(&store);
        }
        Ok(store)
    }

    fn build(schema: &SchemaNode, segment_name: &str) -> Result<Self> {
        let mut directory = plan(schema);
        let segment = SharedSegment::open(segment_name, directory.total_size() as usize)?;
        let init_sem = Arc::new(NamedSemaphore::create_or_open(
            &init_sem_name(segment_name),
            0,
        )?);
        let initialized = segment::attach(&segment.payload(), &mut directory, &init_sem)?;
        segment::normalize_shm_permissions();

        Ok(Self {
            directory,
            segment,
            init_sem,
            initialized,
        })
    }

    /// Whether this process performed the first-writer initialization.
    pub fn performed_init(&self) -> bool {
        self.initialized
    }

    /// The compiled directory.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Root container node.
    pub fn root(&self) -> &LayoutNode {
        self.directory.root()
    }

    /// The backing segment.
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    fn payload(&self) -> Payload {
        self.segment.payload()
    }

    // ---------------------------------------------------------------
    // Path resolution
    // ---------------------------------------------------------------

    /// Resolve a `/`- or `.`-delimited path from the root.
    pub fn resolve(&self, path: &str) -> Option<&LayoutNode> {
        self.directory.find(path)
    }

    /// Resolve a path relative to a previously resolved container.
    pub fn resolve_in<'a>(&self, base: &'a LayoutNode, path: &str) -> Option<&'a LayoutNode> {
        base.find(path)
    }

    fn require(&self, path: &str) -> Result<&LayoutNode> {
        self.resolve(path)
            .ok_or_else(|| StoreError::path_not_found(path))
    }

    // ---------------------------------------------------------------
    // Semaphore discipline
    // ---------------------------------------------------------------

    fn guard<'a>(&self, node: &'a LayoutNode, protect: bool) -> Option<SemGuard<'a>> {
        if !protect {
            return None;
        }
        let sem = node.semaphore()?;
        if let Err(err) = sem.wait() {
            // Keep going and still post at the end, assuming a stuck count
            error!("semaphore acquire failed: {}", err);
        }
        Some(SemGuard { sem })
    }

    /// Acquire the semaphore guarding the node at `path`. The caller must
    /// pass `protect = false` to subsequent accesses until `post_sem`.
    pub fn wait_sem(&self, path: &str) -> Result<()> {
        let node = self.require(path)?;
        match node.semaphore() {
            Some(sem) => sem.wait(),
            None => Err(StoreError::semaphore(path, "node has no bound semaphore")),
        }
    }

    /// Release the semaphore guarding the node at `path`.
    pub fn post_sem(&self, path: &str) -> Result<()> {
        let node = self.require(path)?;
        match node.semaphore() {
            Some(sem) => sem.post(),
            None => Err(StoreError::semaphore(path, "node has no bound semaphore")),
        }
    }

    // ---------------------------------------------------------------
    // Typed reads
    // ---------------------------------------------------------------

    /// Read a node coerced to double.
    pub fn double_value(&self, node: &LayoutNode, protect: bool) -> Result<f64> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Double => Ok(payload.read_f64(offset)),
            NodeKind::Int64 => Ok(payload.read_u64(offset) as i64 as f64),
            NodeKind::Int32 => Ok(payload.read_u32(offset) as i32 as f64),
            NodeKind::Int16 => Ok(payload.read_u16(offset) as i16 as f64),
            NodeKind::Int8 => Ok(payload.read_u8(offset) as i8 as f64),
            NodeKind::Bool => Ok(if payload.read_u8(offset) != 0 { 1.0 } else { 0.0 }),
            NodeKind::Char => Ok(tree::parse_double_prefix(
                &payload.read_cstr(offset, node.size()),
            )),
            NodeKind::Unit | NodeKind::Array => Err(StoreError::type_mismatch(
                node.name(),
                "container has no double value",
            )),
        }
    }

    /// Read a node coerced to a 64-bit integer. Doubles round to nearest.
    pub fn long_value(&self, node: &LayoutNode, protect: bool) -> Result<i64> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Double => Ok(payload.read_f64(offset).round() as i64),
            NodeKind::Int64 => Ok(payload.read_u64(offset) as i64),
            NodeKind::Int32 => Ok(payload.read_u32(offset) as i32 as i64),
            NodeKind::Int16 => Ok(payload.read_u16(offset) as i16 as i64),
            NodeKind::Int8 => Ok(payload.read_u8(offset) as i8 as i64),
            NodeKind::Bool => Ok((payload.read_u8(offset) != 0) as i64),
            NodeKind::Char => Ok(tree::parse_long_prefix(
                &payload.read_cstr(offset, node.size()),
            )),
            NodeKind::Unit | NodeKind::Array => Err(StoreError::type_mismatch(
                node.name(),
                "container has no integer value",
            )),
        }
    }

    /// Read a node coerced to a 32-bit integer.
    pub fn int_value(&self, node: &LayoutNode, protect: bool) -> Result<i32> {
        self.long_value(node, protect).map(|v| v as i32)
    }

    /// Read a node coerced to bool. Strings compare case-insensitively to
    /// "true"; numbers are true when non-zero.
    pub fn bool_value(&self, node: &LayoutNode, protect: bool) -> Result<bool> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Bool | NodeKind::Int8 => Ok(payload.read_u8(offset) != 0),
            NodeKind::Int16 => Ok(payload.read_u16(offset) != 0),
            NodeKind::Int32 => Ok(payload.read_u32(offset) != 0),
            NodeKind::Int64 => Ok(payload.read_u64(offset) != 0),
            NodeKind::Double => Ok(payload.read_f64(offset) != 0.0),
            NodeKind::Char => Ok(payload
                .read_cstr(offset, node.size())
                .eq_ignore_ascii_case("true")),
            NodeKind::Unit | NodeKind::Array => Err(StoreError::type_mismatch(
                node.name(),
                "container has no boolean value",
            )),
        }
    }

    /// Read a node coerced to a string. Numbers honor the schema's
    /// `precision` hint; integers render in hex.
    pub fn string_value(&self, node: &LayoutNode, protect: bool) -> Result<String> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Char => Ok(payload.read_cstr(offset, node.size())),
            NodeKind::Double => {
                let value = payload.read_f64(offset);
                Ok(match node.precision() {
                    Some(p) => format!("{:.*}", p as usize, value),
                    None => format!("{:.6}", value),
                })
            }
            NodeKind::Int64 => Ok(hex_string(payload.read_u64(offset), 12, node.precision())),
            NodeKind::Int32 => Ok(hex_string(
                payload.read_u32(offset) as u64,
                8,
                node.precision(),
            )),
            NodeKind::Int16 => Ok(hex_string(
                payload.read_u16(offset) as u64,
                4,
                node.precision(),
            )),
            NodeKind::Int8 => Ok(hex_string(
                payload.read_u8(offset) as u64,
                2,
                node.precision(),
            )),
            NodeKind::Bool => Ok(if payload.read_u8(offset) != 0 {
                "True".to_string()
            } else {
                "False".to_string()
            }),
            NodeKind::Unit | NodeKind::Array => Err(StoreError::type_mismatch(
                node.name(),
                "container has no string value",
            )),
        }
    }

    /// Read the value at `path` coerced to double.
    pub fn read_double(&self, path: &str, protect: bool) -> Result<f64> {
        self.double_value(self.require(path)?, protect)
    }

    /// Read the value at `path` coerced to a 64-bit integer.
    pub fn read_long(&self, path: &str, protect: bool) -> Result<i64> {
        self.long_value(self.require(path)?, protect)
    }

    /// Read the value at `path` coerced to a 32-bit integer.
    pub fn read_int(&self, path: &str, protect: bool) -> Result<i32> {
        self.int_value(self.require(path)?, protect)
    }

    /// Read the value at `path` coerced to bool.
    pub fn read_bool(&self, path: &str, protect: bool) -> Result<bool> {
        self.bool_value(self.require(path)?, protect)
    }

    /// Read the value at `path` coerced to a string.
    pub fn read_string(&self, path: &str, protect: bool) -> Result<String> {
        self.string_value(self.require(path)?, protect)
    }

    // ---------------------------------------------------------------
    // Typed writes
    // ---------------------------------------------------------------

    /// Store a double into a node, coercing to its kind. Integer targets
    /// round to nearest; every write stamps the update timestamp.
    pub fn set_double(&self, node: &LayoutNode, value: f64, protect: bool) -> Result<()> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Double => payload.write_f64(offset, value),
            NodeKind::Int64 => payload.write_u64(offset, value.round() as i64 as u64),
            NodeKind::Int32 => payload.write_u32(offset, value.round() as i32 as u32),
            NodeKind::Int16 => payload.write_u16(offset, value.round() as i16 as u16),
            NodeKind::Int8 => payload.write_u8(offset, value.round() as i8 as u8),
            NodeKind::Bool => payload.write_u8(offset, if value != 0.0 { 0xFF } else { 0x00 }),
            NodeKind::Char => {
                // Same rendering as the read path, precision hint included
                let text = match node.precision() {
                    Some(p) => format!("{:.*}", p as usize, value),
                    None => format!("{:.6}", value),
                };
                payload.write_cstr(offset, node.size(), &text);
            }
            NodeKind::Unit | NodeKind::Array => {
                return Err(StoreError::type_mismatch(
                    node.name(),
                    "cannot store a double into a container",
                ));
            }
        }
        self.stamp(&payload, node);
        Ok(())
    }

    /// Store a 64-bit integer into a node, coercing to its kind.
    pub fn set_long(&self, node: &LayoutNode, value: i64, protect: bool) -> Result<()> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Double => payload.write_f64(offset, value as f64),
            NodeKind::Int64 => payload.write_u64(offset, value as u64),
            NodeKind::Int32 => payload.write_u32(offset, value as u32),
            NodeKind::Int16 => payload.write_u16(offset, value as u16),
            NodeKind::Int8 => payload.write_u8(offset, value as u8),
            NodeKind::Bool => payload.write_u8(offset, if value != 0 { 0xFF } else { 0x00 }),
            NodeKind::Char => {
                payload.write_cstr(
                    offset,
                    node.size(),
                    &hex_string(value as u64, 12, node.precision()),
                );
            }
            NodeKind::Unit | NodeKind::Array => {
                return Err(StoreError::type_mismatch(
                    node.name(),
                    "cannot store an integer into a container",
                ));
            }
        }
        self.stamp(&payload, node);
        Ok(())
    }

    /// Store a 32-bit integer into a node, coercing to its kind.
    pub fn set_int(&self, node: &LayoutNode, value: i32, protect: bool) -> Result<()> {
        self.set_long(node, value as i64, protect)
    }

    /// Store a boolean into a node, coercing to its kind. The bool kind
    /// stores 0xFF for true.
    pub fn set_bool(&self, node: &LayoutNode, value: bool, protect: bool) -> Result<()> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Bool => payload.write_u8(offset, if value { 0xFF } else { 0x00 }),
            NodeKind::Double => payload.write_f64(offset, if value { 1.0 } else { 0.0 }),
            NodeKind::Int64 => payload.write_u64(offset, value as u64),
            NodeKind::Int32 => payload.write_u32(offset, value as u32),
            NodeKind::Int16 => payload.write_u16(offset, value as u16),
            NodeKind::Int8 => payload.write_u8(offset, value as u8),
            NodeKind::Char => {
                payload.write_cstr(
                    offset,
                    node.size(),
                    if value { "True" } else { "False" },
                );
            }
            NodeKind::Unit | NodeKind::Array => {
                return Err(StoreError::type_mismatch(
                    node.name(),
                    "cannot store a boolean into a container",
                ));
            }
        }
        self.stamp(&payload, node);
        Ok(())
    }

    /// Store a string into a node, coercing to its kind. Char targets
    /// truncate to `size - 1` bytes and are always NUL-terminated.
    pub fn set_string(&self, node: &LayoutNode, value: &str, protect: bool) -> Result<()> {
        let payload = self.payload();
        let _guard = self.guard(node, protect);
        let offset = node.offset();
        match node.kind() {
            NodeKind::Char => payload.write_cstr(offset, node.size(), value),
            NodeKind::Double => payload.write_f64(offset, tree::parse_double_prefix(value)),
            NodeKind::Int64 => {
                payload.write_u64(offset, tree::parse_long_prefix(value) as u64);
            }
            NodeKind::Int32 => {
                payload.write_u32(offset, tree::parse_long_prefix(value) as u32);
            }
            NodeKind::Int16 => {
                payload.write_u16(offset, tree::parse_long_prefix(value) as u16);
            }
            NodeKind::Int8 => {
                payload.write_u8(offset, tree::parse_long_prefix(value) as u8);
            }
            NodeKind::Bool => {
                let truth = value.eq_ignore_ascii_case("true");
                payload.write_u8(offset, if truth { 0xFF } else { 0x00 });
            }
            NodeKind::Unit | NodeKind::Array => {
                return Err(StoreError::type_mismatch(
                    node.name(),
                    "cannot store a string into a container",
                ));
            }
        }
        self.stamp(&payload, node);
        Ok(())
    }

    /// Write the value at `path` from a double.
    pub fn update_double(&self, path: &str, value: f64, protect: bool) -> Result<()> {
        self.set_double(self.require(path)?, value, protect)
    }

    /// Write the value at `path` from a 64-bit integer.
    pub fn update_long(&self, path: &str, value: i64, protect: bool) -> Result<()> {
        self.set_long(self.require(path)?, value, protect)
    }

    /// Write the value at `path` from a 32-bit integer.
    pub fn update_int(&self, path: &str, value: i32, protect: bool) -> Result<()> {
        self.set_int(self.require(path)?, value, protect)
    }

    /// Write the value at `path` from a boolean.
    pub fn update_bool(&self, path: &str, value: bool, protect: bool) -> Result<()> {
        self.set_bool(self.require(path)?, value, protect)
    }

    /// Write the value at `path` from a string.
    pub fn update_string(&self, path: &str, value: &str, protect: bool) -> Result<()> {
        self.set_string(self.require(path)?, value, protect)
    }

    // ---------------------------------------------------------------
    // Bulk updates from tree values
    // ---------------------------------------------------------------

    /// Apply a tree value to a subtree. Maps match unit children by name,
    /// sequences match array children by index; entries without a
    /// matching child are skipped silently, per-leaf type mismatches are
    /// skipped with a logged error. Returns true iff all applicable
    /// children applied successfully.
    pub fn update_from(&self, node: &LayoutNode, value: &Value, protect: bool) -> bool {
        self.apply_entry(node, value, protect)
    }

    /// Resolve `path` and apply a tree value to the subtree there.
    pub fn update_at(&self, path: &str, value: &Value, protect: bool) -> Result<bool> {
        Ok(self.apply_entry(self.require(path)?, value, protect))
    }

    fn apply_entry(&self, node: &LayoutNode, value: &Value, protect: bool) -> bool {
        let applied = match value {
            Value::Bool(b) => self.set_bool(node, *b, protect).is_ok(),
            Value::String(s) => self.set_string(node, s, protect).is_ok(),
            Value::Number(n) => {
                if let Some(i) = n.as_i64().or_else(|| n.as_u64().map(|u| u as i64)) {
                    self.set_long(node, i, protect).is_ok()
                } else {
                    n.as_f64()
                        .map(|f| self.set_double(node, f, protect).is_ok())
                        .unwrap_or(false)
                }
            }
            Value::Object(map) => {
                if node.kind() == NodeKind::Unit {
                    return self.apply_map(node, map, protect);
                }
                false
            }
            Value::Array(seq) => {
                if node.kind() == NodeKind::Array {
                    return self.apply_sequence(node, seq, protect);
                }
                false
            }
            Value::Null => false,
        };
        if !applied {
            error!("could not apply value to '{}'", node.name());
        }
        applied
    }

    fn apply_map(&self, node: &LayoutNode, map: &Map<String, Value>, protect: bool) -> bool {
        let mut all_ok = true;
        for (name, value) in map {
            // Match a single component by name; entries without a
            // matching child are skipped
            if let Some(child) = node.index.lookup(name).and_then(|slot| node.at(slot)) {
                if !self.apply_entry(child, value, protect) {
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    fn apply_sequence(&self, node: &LayoutNode, seq: &[Value], protect: bool) -> bool {
        let mut all_ok = true;
        for (child, value) in node.children().iter().zip(seq) {
            if !self.apply_entry(child, value, protect) {
                all_ok = false;
            }
        }
        all_ok
    }

    // ---------------------------------------------------------------
    // Tree export, sync, and comparison
    // ---------------------------------------------------------------

    /// Export a subtree as a tree value, reading each scalar under its
    /// container semaphore.
    pub fn to_value(&self, node: &LayoutNode) -> Value {
        match node.kind() {
            NodeKind::Unit => {
                let mut map = Map::new();
                for child in node.children() {
                    map.insert(child.name().to_string(), self.to_value(child));
                }
                Value::Object(map)
            }
            NodeKind::Array => {
                Value::Array(node.children().iter().map(|c| self.to_value(c)).collect())
            }
            NodeKind::Double => self
                .double_value(node, true)
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            NodeKind::Bool => self
                .bool_value(node, true)
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            NodeKind::Char => self
                .string_value(node, true)
                .map(Value::String)
                .unwrap_or(Value::Null),
            _ => self
                .long_value(node, true)
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
        }
    }

    /// Refresh a tree value in place from the store, without semaphores.
    /// Returns true when any entry differed.
    pub fn sync_value(&self, node: &LayoutNode, value: &mut Value) -> bool {
        let payload = self.payload();
        match (node.kind(), value) {
            (NodeKind::Unit, Value::Object(map)) => {
                let mut changed = false;
                for (name, entry) in map.iter_mut() {
                    let child = node.index.lookup(name).and_then(|slot| node.at(slot));
                    if let Some(child) = child {
                        if self.sync_value(child, entry) {
                            changed = true;
                        }
                    }
                }
                changed
            }
            (NodeKind::Array, Value::Array(seq)) => {
                let mut changed = false;
                for (child, entry) in node.children().iter().zip(seq.iter_mut()) {
                    if self.sync_value(child, entry) {
                        changed = true;
                    }
                }
                changed
            }
            (NodeKind::Double, entry @ Value::Number(_)) => {
                let live = payload.read_f64(node.offset());
                if entry.as_f64() != Some(live) {
                    *entry = Number::from_f64(live).map(Value::Number).unwrap_or(Value::Null);
                    true
                } else {
                    false
                }
            }
            (NodeKind::Bool, Value::Bool(b)) => {
                let live = payload.read_u8(node.offset()) != 0;
                if *b != live {
                    *b = live;
                    true
                } else {
                    false
                }
            }
            (NodeKind::Char, Value::String(s)) => {
                let live = payload.read_cstr(node.offset(), node.size());
                if *s != live {
                    *s = live;
                    true
                } else {
                    false
                }
            }
            (
                NodeKind::Int64 | NodeKind::Int32 | NodeKind::Int16 | NodeKind::Int8,
                entry @ Value::Number(_),
            ) => {
                let live = self.read_signed(&payload, node);
                if entry.as_i64() != Some(live) {
                    *entry = Value::Number(live.into());
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Compare a subtree against a tree value: scalar kinds require the
    /// matching tree type; units require every child present and equal;
    /// arrays require the same length and element-wise equality.
    pub fn equals(&self, node: &LayoutNode, value: &Value) -> bool {
        let payload = self.payload();
        match (node.kind(), value) {
            (NodeKind::Double, Value::Number(n)) => n.as_f64() == Some(payload.read_f64(node.offset())),
            (
                NodeKind::Int64 | NodeKind::Int32 | NodeKind::Int16 | NodeKind::Int8,
                Value::Number(n),
            ) => n.as_i64() == Some(self.read_signed(&payload, node)),
            (NodeKind::Bool, Value::Bool(b)) => (payload.read_u8(node.offset()) != 0) == *b,
            (NodeKind::Char, Value::String(s)) => {
                payload.read_cstr(node.offset(), node.size()) == *s
            }
            (NodeKind::Unit, Value::Object(map)) => {
                node.children().len() == map.len()
                    && node.children().iter().all(|child| {
                        map.get(child.name())
                            .map(|v| self.equals(child, v))
                            .unwrap_or(false)
                    })
            }
            (NodeKind::Array, Value::Array(seq)) => {
                node.children().len() == seq.len()
                    && node
                        .children()
                        .iter()
                        .zip(seq)
                        .all(|(child, v)| self.equals(child, v))
            }
            _ => {
                error!("'{}' does not match the compared value's type", node.name());
                false
            }
        }
    }

    fn read_signed(&self, payload: &Payload, node: &LayoutNode) -> i64 {
        match node.kind() {
            NodeKind::Int64 => payload.read_u64(node.offset()) as i64,
            NodeKind::Int32 => payload.read_u32(node.offset()) as i32 as i64,
            NodeKind::Int16 => payload.read_u16(node.offset()) as i16 as i64,
            NodeKind::Int8 => payload.read_u8(node.offset()) as i8 as i64,
            _ => 0,
        }
    }

    // ---------------------------------------------------------------
    // Update timestamps and wait-for-change
    // ---------------------------------------------------------------

    fn stamp(&self, payload: &Payload, node: &LayoutNode) {
        payload.write_u64(node.time_offset(), monotonic_ms());
    }

    /// Overwrite a scalar's update timestamp with `at`, or the current
    /// monotonic clock when absent. Containers are not stamped.
    pub fn set_update_time(&self, node: &LayoutNode, at: Option<u64>) {
        if node.kind().is_container() {
            return;
        }
        self.payload()
            .write_u64(node.time_offset(), at.unwrap_or_else(monotonic_ms));
    }

    /// Last update time of a scalar, or the maximum over a container's
    /// descendants. `None` when nothing has ever been stamped.
    pub fn update_time(&self, node: &LayoutNode) -> Option<u64> {
        if node.kind().is_container() {
            return node
                .children()
                .iter()
                .filter_map(|child| self.update_time(child))
                .max();
        }
        match self.payload().read_u64(node.time_offset()) {
            0 => None,
            t => Some(t),
        }
    }

    /// Poll a scalar's update timestamp until it exceeds `start_ms` or
    /// `timeout_ms` elapses. A `start_ms` of 0 means "from now". Returns
    /// whether a fresher timestamp was observed.
    pub fn wait_for_update(&self, node: &LayoutNode, start_ms: u64, timeout_ms: u64) -> bool {
        if node.kind().is_container() {
            return false;
        }
        let payload = self.payload();
        let mut now = monotonic_ms();
        let start = if start_ms == 0 { now } else { start_ms };
        let deadline = now + timeout_ms;
        loop {
            if payload.read_u64(node.time_offset()) > start {
                return true;
            }
            if now >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(UPDATE_POLL_US));
            now = monotonic_ms();
        }
    }

    /// Name of this store's initialization semaphore.
    pub fn init_sem_name(&self) -> &str {
        self.init_sem.name()
    }
}

fn hex_string(value: u64, default_width: usize, precision: Option<u32>) -> String {
    match precision {
        Some(p) => format!("{:0width$X}", value, width = p as usize),
        None => format!("0x{:0width$X}", value, width = default_width),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segment_name(tag: &str) -> String {
        format!("/shmstore_store_{}_{}", tag, std::process::id())
    }

    fn basic_schema() -> Value {
        json!({
            "count": { "type": "int", "size": 4, "defaultValue": 7 },
            "big": { "type": "int", "size": 8, "defaultValue": -1 },
            "ratio": { "type": "float", "defaultValue": 1.5, "precision": 2 },
            "flag": { "type": "bool", "defaultValue": false },
            "name": { "type": "string", "size": 8, "defaultValue": "hi" },
            "fmt": { "type": "string", "size": 12, "defaultValue": "", "precision": 3 },
        })
    }

    #[test]
    fn test_defaults_round_trip() {
        let store = SharedStore::new(&basic_schema(), &segment_name("defaults")).unwrap();
        assert!(store.performed_init());
        assert_eq!(store.read_int("count", true).unwrap(), 7);
        assert_eq!(store.read_long("big", true).unwrap(), -1);
        assert_eq!(store.read_double("ratio", true).unwrap(), 1.5);
        assert!(!store.read_bool("flag", true).unwrap());
        assert_eq!(store.read_string("name", true).unwrap(), "hi");
        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_cross_type_coercions() {
        let store = SharedStore::new(&basic_schema(), &segment_name("coerce")).unwrap();

        store.update_int("flag", 1, true).unwrap();
        assert_eq!(store.read_string("flag", true).unwrap(), "True");
        assert_eq!(store.read_double("flag", true).unwrap(), 1.0);

        store.update_double("count", 2.6, true).unwrap();
        assert_eq!(store.read_int("count", true).unwrap(), 3);

        store.update_string("big", "0x10", true).unwrap();
        assert_eq!(store.read_long("big", true).unwrap(), 16);

        store.update_string("ratio", "2.25 trailing", true).unwrap();
        assert_eq!(store.read_double("ratio", true).unwrap(), 2.25);
        // precision 2 governs string rendering
        assert_eq!(store.read_string("ratio", true).unwrap(), "2.25");

        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_string_truncation() {
        let store = SharedStore::new(&basic_schema(), &segment_name("trunc")).unwrap();
        store.update_string("name", "abcdefghij", true).unwrap();
        assert_eq!(store.read_string("name", true).unwrap(), "abcdefg");
        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_container_reads_fail() {
        let def = json!({
            "group": {
                "type": "unit",
                "x": { "type": "int", "size": 4, "defaultValue": 0 },
            },
        });
        let store = SharedStore::new(&def, &segment_name("container")).unwrap();
        assert!(store.read_double("group", true).is_err());
        assert!(store.read_string("group", true).is_err());
        assert!(matches!(
            store.read_int("missing", true),
            Err(StoreError::PathNotFound { .. })
        ));
        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_semaphore_pairing_across_calls() {
        let store = SharedStore::new(&basic_schema(), &segment_name("pairing")).unwrap();
        let node = store.resolve("count").unwrap();
        let sem = node.semaphore().unwrap();
        let settle = |sem: &NamedSemaphore| {
            // Other tests in this binary share /snSem_<n>; wait out their
            // transient holds before sampling
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            loop {
                let v = sem.value().unwrap();
                if v >= 1 || std::time::Instant::now() >= deadline {
                    return v;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        };
        let before = settle(sem);

        store.int_value(node, true).unwrap();
        store.set_int(node, 3, true).unwrap();
        let _ = store.read_double("group_that_does_not_exist", true);
        store.read_double("name", true).unwrap();

        assert_eq!(settle(sem), before);
        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_unprotected_under_held_semaphore() {
        let store = SharedStore::new(&basic_schema(), &segment_name("held")).unwrap();
        store.wait_sem("count").unwrap();
        store.update_int("count", 21, false).unwrap();
        assert_eq!(store.read_int("count", false).unwrap(), 21);
        store.post_sem("count").unwrap();
        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_update_timestamps() {
        let store = SharedStore::new(&basic_schema(), &segment_name("stamps")).unwrap();
        let node = store.resolve("count").unwrap();

        // Defaults are written without stamping
        assert_eq!(store.update_time(node), None);

        store.set_int(node, 1, true).unwrap();
        let first = store.update_time(node).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        store.set_int(node, 2, true).unwrap();
        let second = store.update_time(node).unwrap();
        assert!(second >= first);

        // Container time is the max over descendants
        let root_time = store.update_time(store.root()).unwrap();
        assert_eq!(root_time, second);
        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_numeric_to_string_writes_honor_precision() {
        let store = SharedStore::new(&basic_schema(), &segment_name("writeprec")).unwrap();

        store.update_double("fmt", 1.5, true).unwrap();
        assert_eq!(store.read_string("fmt", true).unwrap(), "1.500");

        store.update_long("fmt", 0x2A, true).unwrap();
        assert_eq!(store.read_string("fmt", true).unwrap(), "02A");

        // Without a hint, the default renderings apply
        store.update_double("name", 2.5, true).unwrap();
        assert_eq!(store.read_string("name", true).unwrap(), "2.50000");

        let _ = nix::sys::mman::shm_unlink(store.segment().name());
    }

    #[test]
    fn test_hex_string_rendering() {
        assert_eq!(hex_string(0x1F, 8, None), "0x0000001F");
        assert_eq!(hex_string(0x1F, 8, Some(4)), "001F");
        assert_eq!(hex_string(0xAB, 2, None), "0xAB");
    }
}
