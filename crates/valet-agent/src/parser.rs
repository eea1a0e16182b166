//! Incremental parser for the model's output stream.
//!
//! Tool invocations arrive embedded in free-form text, framed as
//! ` ```tool\n{ "tool": ..., "arguments": ... }\n``` `. Fragment boundaries
//! are arbitrary — a delimiter can be split across any number of fragments —
//! so the parser buffers just enough to never misclassify a partial
//! delimiter while still emitting prose as soon as it is safe to.

use serde_json::Value;
use tracing::warn;

/// Opening delimiter of a tool-call blob. Must match the prompt compiler's
/// tool usage instructions exactly.
pub const TOOL_START: &str = "```tool\n";
/// Closing delimiter of a tool-call blob.
pub const TOOL_END: &str = "\n```";

#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Prose emitted verbatim, in source order.
    Text(String),
    /// A well-formed tool invocation.
    ToolCall { name: String, arguments: Value },
    /// A delimited blob that wasn't a valid tool call. The stream continues.
    Error {
        message: String,
        details: Option<Value>,
    },
}

#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one fragment and return every event it completes.
    pub fn feed(&mut self, fragment: &str) -> Vec<ParserEvent> {
        self.buffer.push_str(fragment);
        let mut events = Vec::new();

        loop {
            let Some(start) = self.buffer.find(TOOL_START) else {
                // No opening delimiter. Flush everything except a trailing
                // run that could still grow into one.
                let hold = holdback_len(&self.buffer);
                let safe = self.buffer.len() - hold;
                if safe > 0 {
                    let text: String = self.buffer.drain(..safe).collect();
                    events.push(ParserEvent::Text(text));
                }
                break;
            };

            if start > 0 {
                let text: String = self.buffer.drain(..start).collect();
                events.push(ParserEvent::Text(text));
            }

            // Look for the closing delimiter beyond the opener. Not finding
            // one means the blob is still streaming in — hold the buffer.
            let Some(rel_end) = self.buffer[TOOL_START.len()..].find(TOOL_END) else {
                break;
            };
            let end = TOOL_START.len() + rel_end;

            let blob = self.buffer[TOOL_START.len()..end].trim().to_string();
            events.push(decode_blob(&blob));
            self.buffer.drain(..end + TOOL_END.len());
        }

        events
    }

    /// Signal end of stream: whatever remains buffered — including an
    /// unterminated opening delimiter — is flushed as literal text.
    pub fn finish(&mut self) -> Vec<ParserEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        vec![ParserEvent::Text(std::mem::take(&mut self.buffer))]
    }
}

/// Length of the longest buffer suffix that is a proper prefix of
/// `TOOL_START`. That suffix must not be flushed as text yet: the next
/// fragment may complete the delimiter.
fn holdback_len(buffer: &str) -> usize {
    let max = TOOL_START.len().saturating_sub(1).min(buffer.len());
    for k in (1..=max).rev() {
        if buffer.ends_with(&TOOL_START[..k]) {
            return k;
        }
    }
    0
}

fn decode_blob(blob: &str) -> ParserEvent {
    match serde_json::from_str::<Value>(blob) {
        Ok(value) => {
            let name = value.get("tool").and_then(|t| t.as_str());
            let arguments = value.get("arguments").filter(|a| a.is_object());
            match (name, arguments) {
                (Some(name), Some(arguments)) => ParserEvent::ToolCall {
                    name: name.to_string(),
                    arguments: arguments.clone(),
                },
                _ => {
                    warn!("tool blob parsed as JSON but lacks tool/arguments shape");
                    ParserEvent::Error {
                        message: "Invalid tool call format received from LLM".to_string(),
                        details: Some(Value::String(blob.to_string())),
                    }
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to parse tool call JSON blob");
            ParserEvent::Error {
                message: format!("Failed to parse tool call JSON: {e}"),
                details: Some(Value::String(blob.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a whole fragment sequence through a fresh parser.
    fn parse_all(fragments: &[&str]) -> Vec<ParserEvent> {
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        for fragment in fragments {
            events.extend(parser.feed(fragment));
        }
        events.extend(parser.finish());
        events
    }

    fn text(s: &str) -> ParserEvent {
        ParserEvent::Text(s.to_string())
    }

    #[test]
    fn pure_text_fragments_pass_through() {
        // S1: each fragment is safe to emit as soon as it arrives.
        let events = parse_all(&["Hello ", "world."]);
        assert_eq!(events, vec![text("Hello "), text("world.")]);
    }

    #[test]
    fn single_tool_call_with_surrounding_prose() {
        // S2 at the parser level.
        let events = parse_all(&[
            "Okay.\n",
            "```tool\n{\"tool\":\"mem:search\",\"arguments\":{\"q\":\"x\"}}\n```",
            " Done.",
        ]);
        assert_eq!(
            events,
            vec![
                text("Okay.\n"),
                ParserEvent::ToolCall {
                    name: "mem:search".to_string(),
                    arguments: serde_json::json!({"q": "x"}),
                },
                text(" Done."),
            ]
        );
    }

    #[test]
    fn malformed_blob_yields_one_error_and_resumes() {
        // S3: exactly one error, and parsing continues past the end delimiter.
        let events = parse_all(&["```tool\n{not json}\n```", "after"]);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ParserEvent::Error { .. }));
        assert_eq!(events[1], text("after"));
    }

    #[test]
    fn start_delimiter_split_across_fragments() {
        // S4: no spurious text chunks from the partial delimiter.
        let events = parse_all(&["```t", "ool\n{\"tool\":\"a:b\",\"arguments\":{}}\n```"]);
        assert_eq!(
            events,
            vec![ParserEvent::ToolCall {
                name: "a:b".to_string(),
                arguments: serde_json::json!({}),
            }]
        );
    }

    #[test]
    fn delimiter_split_byte_by_byte() {
        let full = "pre ```tool\n{\"tool\":\"s:t\",\"arguments\":{\"n\":1}}\n``` post";
        let fragments: Vec<String> = full.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = fragments.iter().map(|s| s.as_str()).collect();

        let events = parse_all(&refs);
        let merged = merge_text(events);
        assert_eq!(
            merged,
            vec![
                text("pre "),
                ParserEvent::ToolCall {
                    name: "s:t".to_string(),
                    arguments: serde_json::json!({"n": 1}),
                },
                text(" post"),
            ]
        );
    }

    #[test]
    fn literal_backticks_in_prose_survive() {
        // A ``` that never grows into the full start delimiter is plain text.
        let events = parse_all(&["use ```", " fences for code"]);
        let merged = merge_text(events);
        assert_eq!(merged, vec![text("use ``` fences for code")]);
    }

    #[test]
    fn unterminated_start_is_flushed_as_text() {
        let events = parse_all(&["```tool\n{\"tool\":\"x:y\""]);
        assert_eq!(events, vec![text("```tool\n{\"tool\":\"x:y\"")]);
    }

    #[test]
    fn blob_with_wrong_shape_is_an_error() {
        // JSON parses but has no arguments object.
        let events = parse_all(&["```tool\n{\"tool\":\"a:b\",\"arguments\":3}\n```"]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ParserEvent::Error { .. }));
    }

    #[test]
    fn multiple_blobs_preserve_source_order() {
        let events = parse_all(&[
            "one ```tool\n{\"tool\":\"a:x\",\"arguments\":{}}\n``` two ",
            "```tool\n{\"tool\":\"b:y\",\"arguments\":{}}\n``` three",
        ]);
        let merged = merge_text(events);
        assert_eq!(merged.len(), 5);
        assert_eq!(merged[0], text("one "));
        assert!(matches!(merged[1], ParserEvent::ToolCall { ref name, .. } if name == "a:x"));
        assert_eq!(merged[2], text(" two "));
        assert!(matches!(merged[3], ParserEvent::ToolCall { ref name, .. } if name == "b:y"));
        assert_eq!(merged[4], text(" three"));
    }

    #[test]
    fn empty_stream_emits_nothing() {
        assert!(parse_all(&[]).is_empty());
        assert!(parse_all(&[""]).is_empty());
    }

    /// Collapse adjacent Text events so fragmentation-dependent splits don't
    /// make order assertions brittle.
    fn merge_text(events: Vec<ParserEvent>) -> Vec<ParserEvent> {
        let mut out: Vec<ParserEvent> = Vec::new();
        for event in events {
            match (out.last_mut(), event) {
                (Some(ParserEvent::Text(prev)), ParserEvent::Text(next)) => prev.push_str(&next),
                (_, event) => out.push(event),
            }
        }
        out
    }
}
