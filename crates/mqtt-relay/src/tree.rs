// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Path-addressed access to the live configuration tree.
//!
//! A path is a `/`-separated list of segments. Segments address mapping
//! keys, or sequence indices when the node is a sequence. The empty path,
//! `/` and `root` all address the whole tree.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Path resolution and mutation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Index {index} out of bounds at '{path}' (length {len})")]
    OutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("Segment '{segment}' is not a sequence index at '{path}'")]
    InvalidIndex { path: String, segment: String },

    #[error("Cannot descend into a scalar value at '{0}'")]
    NotContainer(String),

    #[error("The configuration root must be a mapping")]
    RootNotMapping,
}

/// One component of a [`ConfigPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment(String);

impl Segment {
    /// Raw segment text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Segment as a sequence index, when it is made of ASCII digits only.
    pub fn as_index(&self) -> Option<usize> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            self.0.parse().ok()
        } else {
            None
        }
    }
}

/// A parsed configuration path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConfigPath {
    segments: Vec<Segment>,
}

impl ConfigPath {
    /// Path addressing the whole tree.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a raw path. Leading and trailing separators are ignored.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() || trimmed == "root" {
            return Self::root();
        }
        Self {
            segments: trimmed
                .split('/')
                .map(|s| Segment(s.to_string()))
                .collect(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Topic-safe form: segments joined with `_`, or `root`.
    pub fn response_key(&self) -> String {
        if self.is_root() {
            return "root".to_string();
        }
        self.segments
            .iter()
            .map(Segment::as_str)
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("(root)");
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment.as_str())?;
        }
        Ok(())
    }
}

/// Outcome of [`merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Both sides were mappings; keys were merged one level deep.
    Merged,
    /// The existing node was replaced by the new value.
    Overwritten,
}

/// Resolve `path` against `tree`.
pub fn get<'a>(tree: &'a Value, path: &ConfigPath) -> Option<&'a Value> {
    let mut current = tree;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map.get(segment.as_str())?,
            Value::Array(items) => items.get(segment.as_index()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn get_mut<'a>(tree: &'a mut Value, path: &ConfigPath) -> Option<&'a mut Value> {
    let mut current = tree;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map.get_mut(segment.as_str())?,
            Value::Array(items) => items.get_mut(segment.as_index()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at `path`, creating missing intermediate nodes.
///
/// A missing intermediate becomes a sequence when the following segment is
/// numeric, a mapping otherwise. Sequence writes may replace an existing
/// element or append at exactly `len`; anything further is rejected.
pub fn set(tree: &mut Value, path: &ConfigPath, value: Value) -> Result<(), PathError> {
    let segments = path.segments();
    let Some((last, parents)) = segments.split_last() else {
        if !value.is_object() {
            return Err(PathError::RootNotMapping);
        }
        *tree = value;
        return Ok(());
    };

    let mut current = tree;
    for (depth, segment) in parents.iter().enumerate() {
        let next_is_index = segments[depth + 1].as_index().is_some();
        current = child_or_create(current, segment, next_is_index, path)?;
    }
    assign(current, last, value, path)
}

/// Shallow-merge `value` into the existing node at `path`.
///
/// When both the node and `value` are mappings, keys of `value` are written
/// over the node's keys. Otherwise the node is overwritten.
pub fn merge(tree: &mut Value, path: &ConfigPath, value: Value) -> Result<MergeOutcome, PathError> {
    let existing = get_mut(tree, path).ok_or_else(|| PathError::NotFound(path.to_string()))?;
    match (existing, value) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, item) in patch {
                target.insert(key, item);
            }
            Ok(MergeOutcome::Merged)
        }
        (existing, value) => {
            *existing = value;
            Ok(MergeOutcome::Overwritten)
        }
    }
}

fn empty_container(sequence: bool) -> Value {
    if sequence {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn parse_index(segment: &Segment, path: &ConfigPath) -> Result<usize, PathError> {
    segment.as_index().ok_or_else(|| PathError::InvalidIndex {
        path: path.to_string(),
        segment: segment.as_str().to_string(),
    })
}

fn child_or_create<'a>(
    node: &'a mut Value,
    segment: &Segment,
    next_is_index: bool,
    path: &ConfigPath,
) -> Result<&'a mut Value, PathError> {
    let child = match node {
        Value::Object(map) => map
            .entry(segment.as_str().to_string())
            .or_insert_with(|| empty_container(next_is_index)),
        Value::Array(items) => {
            let index = parse_index(segment, path)?;
            if index == items.len() {
                items.push(empty_container(next_is_index));
            }
            let len = items.len();
            items.get_mut(index).ok_or(PathError::OutOfBounds {
                path: path.to_string(),
                index,
                len,
            })?
        }
        _ => return Err(PathError::NotContainer(path.to_string())),
    };
    if !(child.is_object() || child.is_array()) {
        *child = empty_container(next_is_index);
    }
    Ok(child)
}

fn assign(node: &mut Value, last: &Segment, value: Value, path: &ConfigPath) -> Result<(), PathError> {
    match node {
        Value::Object(map) => {
            map.insert(last.as_str().to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last, path)?;
            let len = items.len();
            if index < len {
                items[index] = value;
            } else if index == len {
                items.push(value);
            } else {
                return Err(PathError::OutOfBounds {
                    path: path.to_string(),
                    index,
                    len,
                });
            }
            Ok(())
        }
        _ => Err(PathError::NotContainer(path.to_string())),
    }
}
