//! Bounded decoding of stored JSON values.
//!
//! Stored values come from many agents and are never trusted. Decoding runs
//! in non-recursive passes:
//!
//! 1. a structural scan with an explicit bracket stack that rejects nesting
//!    deeper than `max_depth` before any parser sees the bytes;
//! 2. `serde_json` parsing of the now depth-bounded document.
//!
//! [`BoundedDecoder::decode`] and [`BoundedDecoder::decode_value`] stop there
//! and return the document exactly as stored, so payloads that happen to
//! contain `$ref` keys round-trip untouched.
//!
//! [`BoundedDecoder::decode_resolved`] adds a third pass for callers that
//! store reference documents on purpose: iterative expansion of
//! `{"$ref": "#/json/pointer"}` nodes against the document root, tracking the
//! chain of references being expanded so a cyclic reference fails with
//! [`DecodeError::CycleDetected`] instead of expanding forever.
use crate::error::SwarmResult;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Default maximum nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Default cap on reference expansions per document.
pub const DEFAULT_MAX_EXPANSIONS: usize = 10_000;

/// Reasons a stored value failed to decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input exceeds the byte limit
    #[error("value of {size} bytes exceeds limit of {max} bytes")]
    TooLarge {
        /// Actual size
        size: usize,
        /// Allowed size
        max: usize,
    },

    /// Nesting exceeds the depth limit
    #[error("nesting depth exceeds {max} at byte {offset}")]
    DepthExceeded {
        /// Allowed depth
        max: usize,
        /// Byte offset (or expansion count) where the limit was hit
        offset: usize,
    },

    /// Brackets do not balance
    #[error("unbalanced brackets at byte {offset}")]
    Unbalanced {
        /// Byte offset of the offending bracket
        offset: usize,
    },

    /// A reference points back into its own expansion chain
    #[error("reference cycle through '{pointer}'")]
    CycleDetected {
        /// The pointer that closed the cycle
        pointer: String,
    },

    /// A reference points nowhere
    #[error("dangling reference '{pointer}'")]
    DanglingReference {
        /// The unresolved pointer
        pointer: String,
    },

    /// Reference expansion exceeded its budget
    #[error("more than {max} reference expansions")]
    TooManyExpansions {
        /// Allowed expansions
        max: usize,
    },

    /// The JSON itself is invalid
    #[error("invalid JSON: {0}")]
    Invalid(String),
}

/// Depth- and size-bounded JSON decoder.
#[derive(Debug, Clone, Copy)]
pub struct BoundedDecoder {
    max_depth: usize,
    max_bytes: usize,
    max_expansions: usize,
}

impl Default for BoundedDecoder {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_bytes: 4 * 1024 * 1024,
            max_expansions: DEFAULT_MAX_EXPANSIONS,
        }
    }
}

impl BoundedDecoder {
    /// Decoder with explicit depth and size limits.
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            ..Self::default()
        }
    }

    /// Override the reference expansion budget.
    pub fn with_max_expansions(mut self, max_expansions: usize) -> Self {
        self.max_expansions = max_expansions;
        self
    }

    /// Decode bytes into a JSON value, leaving `$ref` nodes as stored.
    pub fn decode_value(&self, bytes: &[u8]) -> Result<JsonValue, DecodeError> {
        if bytes.len() > self.max_bytes {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                max: self.max_bytes,
            });
        }
        scan_depth(bytes, self.max_depth)?;
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Invalid(e.to_string()))
    }

    /// Decode bytes into a JSON value with `$ref` nodes expanded against the
    /// document root.
    pub fn decode_resolved(&self, bytes: &[u8]) -> Result<JsonValue, DecodeError> {
        let value = self.decode_value(bytes)?;
        self.resolve_refs(value)
    }

    /// Decode bytes into a typed value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> SwarmResult<T> {
        let value = self.decode_value(bytes)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Expand `$ref` nodes without recursion.
    fn resolve_refs(&self, root: JsonValue) -> Result<JsonValue, DecodeError> {
        if !contains_ref(&root) {
            return Ok(root);
        }

        let mut out = root.clone();
        // (pointer into `out`, depth, chain of refs expanded at this node)
        let mut stack: Vec<(String, usize, Vec<String>)> = vec![(String::new(), 0, Vec::new())];
        let mut expansions = 0usize;

        while let Some((pointer, depth, chain)) = stack.pop() {
            if depth > self.max_depth {
                return Err(DecodeError::DepthExceeded {
                    max: self.max_depth,
                    offset: expansions,
                });
            }
            let Some(node) = out.pointer_mut(&pointer) else {
                continue;
            };

            if let Some(target) = ref_target(node) {
                if chain.iter().any(|seen| seen == &target) {
                    return Err(DecodeError::CycleDetected { pointer: target });
                }
                expansions += 1;
                if expansions > self.max_expansions {
                    return Err(DecodeError::TooManyExpansions {
                        max: self.max_expansions,
                    });
                }
                let path = target.strip_prefix('#').unwrap_or(&target);
                let replacement = root
                    .pointer(path)
                    .cloned()
                    .ok_or_else(|| DecodeError::DanglingReference {
                        pointer: target.clone(),
                    })?;
                *node = replacement;
                let mut chain = chain;
                chain.push(target);
                stack.push((pointer, depth, chain));
                continue;
            }

            match node {
                JsonValue::Object(map) => {
                    for key in map.keys() {
                        stack.push((
                            format!("{}/{}", pointer, escape_pointer_token(key)),
                            depth + 1,
                            chain.clone(),
                        ));
                    }
                }
                JsonValue::Array(items) => {
                    for index in 0..items.len() {
                        stack.push((format!("{}/{}", pointer, index), depth + 1, chain.clone()));
                    }
                }
                _ => {}
            }
        }

        Ok(out)
    }
}

/// Reject nesting deeper than `max_depth` using an explicit bracket stack.
pub fn scan_depth(bytes: &[u8], max_depth: usize) -> Result<usize, DecodeError> {
    let mut stack: Vec<u8> = Vec::with_capacity(16);
    let mut deepest = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                stack.push(byte);
                if stack.len() > max_depth {
                    return Err(DecodeError::DepthExceeded {
                        max: max_depth,
                        offset,
                    });
                }
                deepest = deepest.max(stack.len());
            }
            b'}' | b']' => {
                let open = if byte == b'}' { b'{' } else { b'[' };
                if stack.pop() != Some(open) {
                    return Err(DecodeError::Unbalanced { offset });
                }
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(DecodeError::Unbalanced {
            offset: bytes.len(),
        });
    }
    Ok(deepest)
}

fn ref_target(node: &JsonValue) -> Option<String> {
    let map = node.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get("$ref")?.as_str().map(str::to_string)
}

fn contains_ref(root: &JsonValue) -> bool {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            JsonValue::Object(map) => {
                if map.contains_key("$ref") {
                    return true;
                }
                stack.extend(map.values());
            }
            JsonValue::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    false
}

fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
