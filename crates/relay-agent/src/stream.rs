use serde_json::Value;

/// Events emitted while a backend runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Incremental answer text.
    TextDelta { text: String },

    /// Progress line (tool use, raw output).  Shown only in verbose mode.
    Progress { line: String },

    /// Run finished.  `text`, when present, is the authoritative final answer
    /// and replaces any accumulated deltas.
    Done {
        text: Option<String>,
        conversation: Option<String>,
    },

    /// The backend reported a failure for this run.
    Error { message: String },
}

/// Longest tool-input summary kept in a progress line.
const TOOL_SUMMARY_MAX: usize = 120;

/// Parse one stdout line of the Claude CLI `stream-json` output format.
///
/// Lines that are not JSON are passed through as progress.  Known record
/// types:
///   `{"type":"assistant","message":{"content":[{"type":"text",...},{"type":"tool_use",...}]}}`
///   `{"type":"result","result":"...","session_id":"...","is_error":false}`
pub fn parse_stream_line(line: &str) -> Vec<BackendEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let json: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(_) => {
            return vec![BackendEvent::Progress {
                line: trimmed.to_string(),
            }]
        }
    };

    match json.get("type").and_then(Value::as_str) {
        Some("assistant") => json
            .pointer("/message/content")
            .and_then(Value::as_array)
            .map(|blocks| blocks.iter().filter_map(content_block).collect())
            .unwrap_or_default(),
        Some("result") => {
            let text = json
                .get("result")
                .and_then(Value::as_str)
                .map(String::from);
            if json.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
                return vec![BackendEvent::Error {
                    message: text.unwrap_or_else(|| "unknown error from backend".to_string()),
                }];
            }
            vec![BackendEvent::Done {
                text,
                conversation: json
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(String::from),
            }]
        }
        _ => Vec::new(),
    }
}

fn content_block(block: &Value) -> Option<BackendEvent> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => {
            let text = block.get("text").and_then(Value::as_str)?;
            Some(BackendEvent::TextDelta {
                text: text.to_string(),
            })
        }
        "tool_use" => {
            let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            Some(BackendEvent::Progress {
                line: format!("{name}: {}", summarize_tool_input(&input)),
            })
        }
        _ => None,
    }
}

/// Pick the most telling field of a tool input, falling back to compact JSON.
fn summarize_tool_input(input: &Value) -> String {
    const KEYS: &[&str] = &["command", "file_path", "path", "pattern", "url", "description"];
    let summary = KEYS
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .map(|s| s.replace('\n', " "))
        .unwrap_or_else(|| input.to_string());
    if summary.chars().count() > TOOL_SUMMARY_MAX {
        let cut: String = summary.chars().take(TOOL_SUMMARY_MAX).collect();
        format!("{cut}...")
    } else {
        summary
    }
}
