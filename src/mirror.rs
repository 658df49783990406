//! Private mirror of the payload with hysteresis-based change detection
//!
//! A `StoreMirror` snapshots the live payload into a process-private
//! buffer at the same offsets. `check_changes` walks the directory,
//! comparing live scalars against the mirrored copy under each
//! container's semaphore; values that moved beyond their hysteresis band
//! overwrite the mirror and are appended to a structured delta, shaped
//! map-for-unit and sequence-for-array. Containers attach to the delta
//! only when they contributed something.

use serde_json::{Map, Number, Value};

use crate::access::Payload;
use crate::error::{Result, StoreError};
use crate::layout::{LayoutNode, NodeKind};
use crate::store::SharedStore;

/// In-process copy of the shared payload for poll-and-diff clients.
#[derive(Debug)]
pub struct StoreMirror<'s> {
    store: &'s SharedStore,
    local: Vec<u8>,
}

impl<'s> StoreMirror<'s> {
    /// Snapshot the live payload.
    pub fn new(store: &'s SharedStore) -> Self {
        let local = store.segment().payload().snapshot();
        Self { store, local }
    }

    /// The store this mirror tracks.
    pub fn store(&self) -> &'s SharedStore {
        self.store
    }

    fn local_payload(&self) -> Payload {
        unsafe { Payload::new(self.local.as_ptr() as *mut u8, self.local.len()) }
    }

    /// Refresh the whole mirror from the live payload without computing a
    /// delta.
    pub fn update(&mut self) {
        let store = self.store;
        self.update_node(store.root());
    }

    /// Refresh the subtree at `path`.
    pub fn update_at(&mut self, path: &str) -> Result<()> {
        let store = self.store;
        let node = store
            .resolve(path)
            .ok_or_else(|| StoreError::path_not_found(path))?;
        self.update_node(node);
        Ok(())
    }

    fn update_node(&mut self, node: &LayoutNode) {
        if node.kind().is_container() {
            for child in node.children() {
                self.update_node(child);
            }
            return;
        }
        let live = self.store.segment().payload();
        let local = self.local_payload();
        let sem = node.semaphore();
        if let Some(sem) = sem {
            let _ = sem.wait();
        }
        local.copy_field_from(&live, node.offset(), node.size());
        if let Some(sem) = sem {
            let _ = sem.post();
        }
    }

    /// Compute the delta since the last sync into `result`, which must be
    /// a map or a sequence. The target node's own changes populate
    /// `result` directly; nested containers attach as named (map) or
    /// positional (sequence) children only when non-empty. Returns
    /// whether any change was recorded.
    pub fn check_changes(&mut self, result: &mut Value) -> Result<bool> {
        let store = self.store;
        self.check_node(store.root(), result)
    }

    /// Compute the delta for the subtree at `path`.
    pub fn check_changes_at(&mut self, path: &str, result: &mut Value) -> Result<bool> {
        let store = self.store;
        let node = store
            .resolve(path)
            .ok_or_else(|| StoreError::path_not_found(path))?;
        self.check_node(node, result)
    }

    fn check_node(&mut self, node: &LayoutNode, result: &mut Value) -> Result<bool> {
        if !matches!(result, Value::Object(_) | Value::Array(_)) {
            return Err(StoreError::type_mismatch(
                node.name(),
                "delta result must be a map or a sequence",
            ));
        }
        if node.kind().is_container() {
            let mut changed = false;
            for child in node.children() {
                if self.walk(child, result) {
                    changed = true;
                }
            }
            Ok(changed)
        } else {
            match self.scalar_delta(node) {
                Some(delta) => {
                    attach(result, node.name(), delta);
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    fn walk(&mut self, node: &LayoutNode, result: &mut Value) -> bool {
        match node.kind() {
            NodeKind::Unit => {
                let mut child_result = Value::Object(Map::new());
                let mut changed = false;
                for child in node.children() {
                    if self.walk(child, &mut child_result) {
                        changed = true;
                    }
                }
                if changed {
                    attach(result, node.name(), child_result);
                }
                changed
            }
            NodeKind::Array => {
                let mut child_result = Value::Array(Vec::new());
                let mut changed = false;
                for child in node.children() {
                    if self.walk(child, &mut child_result) {
                        changed = true;
                    }
                }
                if changed {
                    attach(result, node.name(), child_result);
                }
                changed
            }
            _ => match self.scalar_delta(node) {
                Some(delta) => {
                    attach(result, node.name(), delta);
                    true
                }
                None => false,
            },
        }
    }

    /// Compare a live scalar against the mirror. When the difference
    /// exceeds the hysteresis band, overwrite the mirror and return the
    /// new value as a tree entry.
    fn scalar_delta(&mut self, node: &LayoutNode) -> Option<Value> {
        let live = self.store.segment().payload();
        let local = self.local_payload();
        let offset = node.offset();

        match node.kind() {
            NodeKind::Double => {
                // Schema hysteresis is hundredths for doubles
                let band = node.hysteresis() as f64 / 100.0;
                let fresh = locked_read(node, || live.read_f64(offset));
                let saved = local.read_f64(offset);
                if fresh > saved + band || fresh < saved - band {
                    local.write_f64(offset, fresh);
                    Some(Number::from_f64(fresh).map(Value::Number).unwrap_or(Value::Null))
                } else {
                    None
                }
            }
            NodeKind::Int64 => {
                let band = node.hysteresis() as i64;
                let fresh = locked_read(node, || live.read_u64(offset) as i64);
                let saved = local.read_u64(offset) as i64;
                if fresh > saved.saturating_add(band) || fresh < saved.saturating_sub(band) {
                    local.write_u64(offset, fresh as u64);
                    Some(Value::Number(fresh.into()))
                } else {
                    None
                }
            }
            NodeKind::Int32 => {
                let band = node.hysteresis() as i64;
                let fresh = locked_read(node, || live.read_u32(offset) as i32 as i64);
                let saved = local.read_u32(offset) as i32 as i64;
                if fresh > saved + band || fresh < saved - band {
                    local.write_u32(offset, fresh as u32);
                    Some(Value::Number(fresh.into()))
                } else {
                    None
                }
            }
            NodeKind::Int16 => {
                let band = node.hysteresis() as i64;
                let fresh = locked_read(node, || live.read_u16(offset) as i64);
                let saved = local.read_u16(offset) as i64;
                if fresh > saved + band || fresh < saved - band {
                    local.write_u16(offset, fresh as u16);
                    Some(Value::Number(fresh.into()))
                } else {
                    None
                }
            }
            NodeKind::Int8 => {
                let band = node.hysteresis() as i64;
                let fresh = locked_read(node, || live.read_u8(offset) as i64);
                let saved = local.read_u8(offset) as i64;
                if fresh > saved + band || fresh < saved - band {
                    local.write_u8(offset, fresh as u8);
                    Some(Value::Number(fresh.into()))
                } else {
                    None
                }
            }
            NodeKind::Bool => {
                let fresh = locked_read(node, || live.read_u8(offset));
                let saved = local.read_u8(offset);
                if fresh != saved {
                    local.write_u8(offset, fresh);
                    Some(Value::Bool(fresh != 0))
                } else {
                    None
                }
            }
            NodeKind::Char => {
                let fresh = locked_read(node, || live.read_bytes(offset, node.size()));
                let saved = local.read_bytes(offset, node.size());
                if fresh != saved {
                    for (i, byte) in fresh.iter().enumerate() {
                        local.write_u8(offset + i as u32, *byte);
                    }
                    Some(Value::String(cstr_of(&fresh)))
                } else {
                    None
                }
            }
            NodeKind::Unit | NodeKind::Array => None,
        }
    }
}

/// Read a live value under the node's container semaphore.
fn locked_read<T>(node: &LayoutNode, read: impl FnOnce() -> T) -> T {
    let sem = node.semaphore();
    if let Some(sem) = sem {
        let _ = sem.wait();
    }
    let value = read();
    if let Some(sem) = sem {
        let _ = sem.post();
    }
    value
}

fn attach(result: &mut Value, name: &str, value: Value) {
    match result {
        Value::Object(map) => {
            map.insert(name.to_string(), value);
        }
        Value::Array(seq) => seq.push(value),
        _ => {}
    }
}

fn cstr_of(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
