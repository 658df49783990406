//! Offset planner: one depth-first pass over the schema assigns every
//! scalar a slot in its type pool plus a timestamp slot, then a rebase
//! pass turns pool-relative offsets into absolute segment offsets.

use serde::{Deserialize, Serialize};

use crate::schema::SchemaNode;

use super::node::{LayoutNode, NodeKind};
use super::prefix::PrefixIndex;
use super::PAYLOAD_BASE;

/// Accumulated width of each type-segregated pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    pub doubles: u32,
    pub int64s: u32,
    pub int32s: u32,
    pub int16s: u32,
    pub eight_bit: u32,
    pub chars: u32,
}

impl PoolSizes {
    /// Sum of all scalar pool widths (timestamps excluded).
    pub fn total(&self) -> u32 {
        self.doubles + self.int64s + self.int32s + self.int16s + self.eight_bit + self.chars
    }
}

/// The compiled directory: a rooted tree of layout nodes plus the sizing
/// facts needed to open the segment.
#[derive(Debug)]
pub struct Directory {
    root: LayoutNode,
    pools: PoolSizes,
    scalar_count: u32,
    total_size: u32,
}

impl Directory {
    /// Root of the directory: a synthetic unit whose children are the
    /// schema's top-level entries.
    pub fn root(&self) -> &LayoutNode {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut LayoutNode {
        &mut self.root
    }

    /// Per-pool widths.
    pub fn pools(&self) -> PoolSizes {
        self.pools
    }

    /// Number of scalar fields in the layout.
    pub fn scalar_count(&self) -> u32 {
        self.scalar_count
    }

    /// Required segment size: header, timestamp pool, then the six scalar
    /// pools.
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// Resolve a path from the root.
    pub fn find(&self, path: &str) -> Option<&LayoutNode> {
        self.root.find(path)
    }
}

/// Running pool cursors threaded through the traversal.
#[derive(Debug, Default)]
struct PlanState {
    time: u32,
    doubles: u32,
    int64s: u32,
    int32s: u32,
    int16s: u32,
    eight_bit: u32,
    chars: u32,
    scalars: u32,
}

/// Compile a validated schema into a directory. Deterministic: the same
/// schema always yields byte-identical offsets.
pub fn plan(schema: &SchemaNode) -> Directory {
    let mut state = PlanState {
        // The timestamp pool leads the payload, directly past the header
        time: PAYLOAD_BASE,
        ..PlanState::default()
    };

    let mut root = build(schema, &mut state);

    let pools = PoolSizes {
        doubles: state.doubles,
        int64s: state.int64s,
        int32s: state.int32s,
        int16s: state.int16s,
        eight_bit: state.eight_bit,
        chars: state.chars,
    };

    // Pool start offsets, concatenated after the timestamp pool
    let doubles_start = PAYLOAD_BASE + 8 * state.scalars;
    let int64_start = doubles_start + pools.doubles;
    let int32_start = int64_start + pools.int64s;
    let int16_start = int32_start + pools.int32s;
    let eight_bit_start = int16_start + pools.int16s;
    let char_start = eight_bit_start + pools.eight_bit;
    let total_size = char_start + pools.chars;

    rebase(
        &mut root,
        doubles_start,
        int64_start,
        int32_start,
        int16_start,
        eight_bit_start,
        char_start,
    );

    Directory {
        root,
        pools,
        scalar_count: state.scalars,
        total_size,
    }
}

fn build(schema: &SchemaNode, state: &mut PlanState) -> LayoutNode {
    let kind = NodeKind::from_schema(schema);

    let mut node = LayoutNode {
        name: schema.name.clone(),
        kind,
        size: 0,
        offset: 0,
        time_offset: 0,
        precision: schema.precision,
        hysteresis: schema.hysteresis,
        default: schema.default.clone(),
        children: Vec::new(),
        index: PrefixIndex::empty(),
        sem: None,
    };

    if kind.is_container() {
        node.children = schema.children.iter().map(|c| build(c, state)).collect();
        node.size = node.children.iter().map(|c| c.size).sum();
        node.index = match kind {
            NodeKind::Array => PrefixIndex::for_array(node.children.len()),
            _ => {
                let names: Vec<&str> = node.children.iter().map(|c| c.name.as_str()).collect();
                PrefixIndex::for_unit(&names)
            }
        };
        return node;
    }

    node.time_offset = state.time;
    state.time += 8;
    state.scalars += 1;

    match kind {
        NodeKind::Double => {
            node.size = 8;
            node.offset = state.doubles;
            state.doubles += 8;
        }
        NodeKind::Int64 => {
            node.size = 8;
            node.offset = state.int64s;
            state.int64s += 8;
        }
        NodeKind::Int32 => {
            node.size = 4;
            node.offset = state.int32s;
            state.int32s += 4;
        }
        NodeKind::Int16 => {
            node.size = 2;
            node.offset = state.int16s;
            state.int16s += 2;
        }
        NodeKind::Int8 | NodeKind::Bool => {
            node.size = 1;
            node.offset = state.eight_bit;
            state.eight_bit += 1;
        }
        NodeKind::Char => {
            node.size = schema.size;
            node.offset = state.chars;
            state.chars += schema.size;
        }
        NodeKind::Unit | NodeKind::Array => unreachable!(),
    }

    node
}

#[allow(clippy::too_many_arguments)]
fn rebase(
    node: &mut LayoutNode,
    doubles: u32,
    int64s: u32,
    int32s: u32,
    int16s: u32,
    eight_bit: u32,
    chars: u32,
) {
    match node.kind {
        NodeKind::Double => node.offset += doubles,
        NodeKind::Int64 => node.offset += int64s,
        NodeKind::Int32 => node.offset += int32s,
        NodeKind::Int16 => node.offset += int16s,
        NodeKind::Int8 | NodeKind::Bool => node.offset += eight_bit,
        NodeKind::Char => node.offset += chars,
        NodeKind::Unit | NodeKind::Array => {}
    }
    for child in &mut node.children {
        rebase(child, doubles, int64s, int32s, int16s, eight_bit, chars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaNode;
    use serde_json::json;

    fn compile(def: &serde_json::Value) -> Directory {
        plan(&SchemaNode::parse_root(def).unwrap())
    }

    #[test]
    fn test_pool_sizes_and_total() {
        let dir = compile(&json!({
            "speed": { "type": "float", "defaultValue": 0.0 },
            "count": { "type": "int", "size": 4, "defaultValue": 0 },
            "tag": { "type": "string", "size": 12, "defaultValue": "" },
            "armed": { "type": "bool", "defaultValue": false },
        }));

        let pools = dir.pools();
        assert_eq!(pools.doubles, 8);
        assert_eq!(pools.int32s, 4);
        assert_eq!(pools.chars, 12);
        assert_eq!(pools.eight_bit, 1);
        assert_eq!(dir.scalar_count(), 4);
        assert_eq!(
            dir.total_size(),
            PAYLOAD_BASE + 8 * 4 + pools.total()
        );
    }

    #[test]
    fn test_offsets_are_disjoint() {
        let dir = compile(&json!({
            "a": { "type": "int", "size": 2, "defaultValue": 0 },
            "b": { "type": "int", "size": 2, "defaultValue": 0 },
            "c": { "type": "int", "size": 1, "defaultValue": 0 },
            "d": { "type": "bool", "defaultValue": false },
            "e": { "type": "float", "defaultValue": 0.0 },
            "nested": {
                "type": "unit",
                "f": { "type": "float", "defaultValue": 1.0 },
                "g": { "type": "string", "size": 4, "defaultValue": "x" },
            },
        }));

        let mut intervals: Vec<(u32, u32)> = Vec::new();
        let mut times: Vec<u32> = Vec::new();
        dir.root().visit(&mut |node| {
            if !node.kind().is_container() {
                intervals.push((node.offset(), node.offset() + node.size()));
                times.push(node.time_offset());
            }
        });

        intervals.sort();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping intervals {:?}", pair);
        }

        times.sort();
        for pair in times.windows(2) {
            assert!(pair[0] + 8 <= pair[1]);
        }
        assert_eq!(times[0], PAYLOAD_BASE);

        // Every scalar interval sits inside the payload
        for (_, end) in &intervals {
            assert!(*end <= dir.total_size());
        }
    }

    #[test]
    fn test_layout_is_deterministic() {
        let def = json!({
            "z": { "type": "int", "size": 8, "defaultValue": 0 },
            "a": { "type": "int", "size": 4, "defaultValue": 0 },
            "m": {
                "type": "array",
                "0": { "type": "float", "defaultValue": 0.0 },
                "1": { "type": "float", "defaultValue": 0.0 },
            },
        });
        let first = compile(&def);
        let second = compile(&def);

        let mut a = Vec::new();
        first.root().visit(&mut |n| a.push((n.name().to_string(), n.offset(), n.time_offset())));
        let mut b = Vec::new();
        second.root().visit(&mut |n| b.push((n.name().to_string(), n.offset(), n.time_offset())));
        assert_eq!(a, b);
    }

    #[test]
    fn test_unit_children_alphabetical_array_numeric() {
        let dir = compile(&json!({
            "zeta": { "type": "int", "size": 4, "defaultValue": 0 },
            "alpha": { "type": "int", "size": 4, "defaultValue": 0 },
            "list": {
                "type": "array",
                "0": { "type": "int", "size": 4, "defaultValue": 0 },
                "1": { "type": "int", "size": 4, "defaultValue": 0 },
                "2": { "type": "int", "size": 4, "defaultValue": 0 },
            },
        }));

        let names: Vec<_> = dir.root().children().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["alpha", "list", "zeta"]);

        let list = dir.find("list").unwrap();
        let indices: Vec<_> = list.children().iter().map(|c| c.name()).collect();
        assert_eq!(indices, ["0", "1", "2"]);

        // Alphabetically earlier scalar gets the earlier pool slot
        assert!(dir.find("alpha").unwrap().offset() < dir.find("zeta").unwrap().offset());
    }

    #[test]
    fn test_path_resolution_equivalence() {
        let dir = compile(&json!({
            "outer": {
                "type": "unit",
                "inner": {
                    "type": "unit",
                    "leaf": { "type": "int", "size": 4, "defaultValue": 3 },
                },
            },
        }));

        let dotted = dir.find("outer.inner.leaf").unwrap();
        let slashed = dir.find("outer/inner/leaf").unwrap();
        let mixed = dir.find("outer/inner.leaf").unwrap();
        assert_eq!(dotted.offset(), slashed.offset());
        assert_eq!(dotted.offset(), mixed.offset());
        assert!(dir.find("outer/missing").is_none());
        assert!(dir.find("outer/inner/leaf/deeper").is_none());
    }
}
