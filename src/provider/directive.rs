//! Streaming parser for tool directives embedded in plain model text.
//!
//! Backends without a native tool protocol are asked to answer with
//! `{"tool_call": {"name": ..., "arguments": {...}}}`. The parser forwards
//! ordinary text as soon as it arrives and holds back anything from an opening
//! brace until the matching close brace, tracking JSON strings so braces inside
//! them do not count. A balanced object that decodes as a directive becomes a
//! tool call; any other held text is released unchanged.

use crate::error::{AicliError, Result};
use crate::types::{ToolArgumentMap, ToolCallRequest};

use super::format::generated_call_id;

/// Held text larger than this is released as text.
const MAX_HELD_BYTES: usize = 256 * 1024;

/// Output of the parser, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveChunk {
    Text(String),
    Call(ToolCallRequest),
}

#[derive(Debug, Default)]
pub struct DirectiveParser {
    held: String,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl DirectiveParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next text fragment.
    pub fn push(&mut self, fragment: &str) -> Result<Vec<DirectiveChunk>> {
        let mut out = Vec::new();
        let mut plain = String::new();

        for c in fragment.chars() {
            if self.depth == 0 {
                if c == '{' {
                    flush_text(&mut out, &mut plain);
                    self.held.push(c);
                    self.depth = 1;
                    self.in_string = false;
                    self.escaped = false;
                } else {
                    plain.push(c);
                }
                continue;
            }

            self.held.push(c);
            if self.in_string {
                match c {
                    _ if self.escaped => self.escaped = false,
                    '\\' => self.escaped = true,
                    '"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let held = std::mem::take(&mut self.held);
                        match decode_directive(&held)? {
                            Some(call) => out.push(DirectiveChunk::Call(call)),
                            None => out.push(DirectiveChunk::Text(held)),
                        }
                    }
                }
                _ => {}
            }

            if self.held.len() > MAX_HELD_BYTES {
                out.push(DirectiveChunk::Text(std::mem::take(&mut self.held)));
                self.depth = 0;
                self.in_string = false;
                self.escaped = false;
            }
        }

        flush_text(&mut out, &mut plain);
        Ok(out)
    }

    /// Release anything still held once the stream has ended.
    pub fn finish(&mut self) -> Vec<DirectiveChunk> {
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        let held = std::mem::take(&mut self.held);
        if held.is_empty() {
            Vec::new()
        } else {
            vec![DirectiveChunk::Text(held)]
        }
    }
}

fn flush_text(out: &mut Vec<DirectiveChunk>, plain: &mut String) {
    if !plain.is_empty() {
        out.push(DirectiveChunk::Text(std::mem::take(plain)));
    }
}

/// `Ok(None)` when the object is not a directive at all.
fn decode_directive(raw: &str) -> Result<Option<ToolCallRequest>> {
    let Ok(serde_json::Value::Object(mut outer)) = serde_json::from_str::<serde_json::Value>(raw)
    else {
        return Ok(None);
    };
    let Some(serde_json::Value::Object(mut inner)) = outer.remove("tool_call") else {
        return Ok(None);
    };
    let Some(name) = inner
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::to_string)
    else {
        return Ok(None);
    };
    let arguments = match inner.remove("arguments") {
        None | Some(serde_json::Value::Null) => ToolArgumentMap::new(),
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            return Err(AicliError::protocol(format!(
                "arguments for tool '{name}' are not a JSON object: {other}"
            )))
        }
    };
    Ok(Some(ToolCallRequest::new(generated_call_id(), name, arguments)))
}
