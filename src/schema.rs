//! Schema description parsing and validation
//!
//! A schema is a nested map of field declarations. Every node carries a
//! `type` key (`unit`, `array`, `int`, `float`, `bool`, `string`); scalars
//! must declare a `defaultValue` and may declare `size`, `precision`, and
//! `hysteresis`. Key lookup and type names are case-insensitive. A child
//! named `update` is reserved metadata and skipped.

use serde_json::Value;

use crate::config::{DEFAULT_INT_SIZE, DEFAULT_STRING_SIZE};
use crate::error::{Result, StoreError};
use crate::tree;

/// Reserved child name ignored during schema enumeration.
pub const RESERVED_UPDATE_KEY: &str = "update";

/// Declared kind of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// Container with named fields
    Unit,
    /// Container with sequentially-indexed fields "0", "1", ...
    Array,
    /// Integer of 1, 2, 4, or 8 bytes
    Int,
    /// IEEE 754 double
    Float,
    /// Single byte, 0x00 / 0xFF
    Bool,
    /// Fixed-size NUL-terminated byte string
    String,
}

impl SchemaKind {
    fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("unit") {
            Some(Self::Unit)
        } else if name.eq_ignore_ascii_case("array") {
            Some(Self::Array)
        } else if name.eq_ignore_ascii_case("int") {
            Some(Self::Int)
        } else if name.eq_ignore_ascii_case("float") {
            Some(Self::Float)
        } else if name.eq_ignore_ascii_case("bool") {
            Some(Self::Bool)
        } else if name.eq_ignore_ascii_case("string") {
            Some(Self::String)
        } else {
            None
        }
    }

    /// Whether this kind holds children rather than a value.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Unit | Self::Array)
    }
}

/// Default value of a scalar field, typed by its declared kind.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

/// A validated schema declaration.
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub name: String,
    pub kind: SchemaKind,
    /// Byte width for `int` and `string` kinds (fixed for the rest)
    pub size: u32,
    /// Mandatory for scalars, absent for containers
    pub default: Option<DefaultValue>,
    /// Significant digits for string rendering of numbers
    pub precision: Option<u32>,
    /// Change-detection band used by the mirror, 0 when absent
    pub hysteresis: u32,
    /// Unit children sorted alphabetically, array children by index
    pub children: Vec<SchemaNode>,
}

impl SchemaNode {
    /// Parse the root description. The root must be a map; it becomes a
    /// synthetic unit named "base" whose children are the top-level
    /// entries.
    pub fn parse_root(def: &Value) -> Result<SchemaNode> {
        let map = def
            .as_object()
            .ok_or_else(|| StoreError::schema("schema root must be a map"))?;

        let children = parse_unit_children(map, "")?;
        Ok(SchemaNode {
            name: "base".to_string(),
            kind: SchemaKind::Unit,
            size: 0,
            default: None,
            precision: None,
            hysteresis: 0,
            children,
        })
    }

    /// Count of scalar descendants (including self for scalars).
    pub fn scalar_count(&self) -> u32 {
        if self.kind.is_container() {
            self.children.iter().map(SchemaNode::scalar_count).sum()
        } else {
            1
        }
    }
}

fn parse_node(name: &str, def: &Value, path: &str) -> Result<SchemaNode> {
    let map = def
        .as_object()
        .ok_or_else(|| StoreError::schema(format!("{}: declaration must be a map", path)))?;

    let type_name = tree::find_ci(map, "type")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::schema(format!("{}: missing required key 'type'", path)))?;
    let kind = SchemaKind::from_name(type_name)
        .ok_or_else(|| StoreError::schema(format!("{}: unknown type '{}'", path, type_name)))?;

    let declared_size = tree::find_ci(map, "size").and_then(tree::as_i64_lenient);
    let precision = tree::find_ci(map, "precision")
        .and_then(tree::as_i64_lenient)
        .map(|p| p.max(0) as u32);
    let hysteresis = tree::find_ci(map, "hysteresis")
        .and_then(tree::as_i64_lenient)
        .map(|h| h.max(0) as u32)
        .unwrap_or(0);

    let mut node = SchemaNode {
        name: name.to_string(),
        kind,
        size: 0,
        default: None,
        precision,
        hysteresis,
        children: Vec::new(),
    };

    match kind {
        SchemaKind::Unit => {
            node.children = parse_unit_children(map, path)?;
        }
        SchemaKind::Array => {
            node.children = parse_array_children(map, path)?;
        }
        SchemaKind::Int => {
            // Sizes outside {1,2,4,8} fall back to 4
            node.size = match declared_size {
                Some(s @ (1 | 2 | 8)) => s as u32,
                _ => DEFAULT_INT_SIZE,
            };
            node.default = Some(DefaultValue::Int(require_default(map, path, |v| {
                tree::as_i64_lenient(v)
            })?));
        }
        SchemaKind::Float => {
            node.size = 8;
            node.default = Some(DefaultValue::Float(require_default(map, path, |v| {
                tree::as_f64_lenient(v)
            })?));
        }
        SchemaKind::Bool => {
            node.size = 1;
            node.default = Some(DefaultValue::Bool(require_default(map, path, |v| {
                tree::as_bool_lenient(v)
            })?));
        }
        SchemaKind::String => {
            let size = declared_size.unwrap_or(DEFAULT_STRING_SIZE as i64);
            if size < 1 {
                return Err(StoreError::schema(format!(
                    "{}: string size must be at least 1 (got {})",
                    path, size
                )));
            }
            node.size = size as u32;
            node.default = Some(DefaultValue::Str(require_default(map, path, |v| {
                v.as_str().map(str::to_string)
            })?));
        }
    }

    Ok(node)
}

fn require_default<T>(
    map: &serde_json::Map<String, Value>,
    path: &str,
    coerce: impl FnOnce(&Value) -> Option<T>,
) -> Result<T> {
    let value = tree::find_ci(map, "defaultValue").ok_or_else(|| {
        StoreError::schema(format!("{}: every scalar requires a defaultValue", path))
    })?;
    coerce(value).ok_or_else(|| {
        StoreError::schema(format!("{}: defaultValue has the wrong type", path))
    })
}

fn parse_unit_children(
    map: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<Vec<SchemaNode>> {
    let mut children = Vec::new();
    for (name, value) in map {
        // Only map-valued entries declare fields; scalar keys like "type"
        // at the same level are attributes, not children.
        if !value.is_object() || name == RESERVED_UPDATE_KEY {
            continue;
        }
        let child_path = join_path(path, name);
        children.push(parse_node(name, value, &child_path)?);
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

fn parse_array_children(
    map: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<Vec<SchemaNode>> {
    let mut indexed = Vec::new();
    for (name, value) in map {
        if !value.is_object() || name == RESERVED_UPDATE_KEY {
            continue;
        }
        let index: usize = name.parse().map_err(|_| {
            StoreError::schema(format!(
                "{}: array child '{}' is not a decimal index",
                path, name
            ))
        })?;
        let child_path = join_path(path, name);
        indexed.push((index, parse_node(name, value, &child_path)?));
    }
    indexed.sort_by_key(|(i, _)| *i);

    for (expected, (actual, _)) in indexed.iter().enumerate() {
        if *actual != expected {
            return Err(StoreError::schema(format!(
                "{}: array indices must form an unbroken sequence (missing {})",
                path, expected
            )));
        }
    }
    Ok(indexed.into_iter().map(|(_, node)| node).collect())
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}
