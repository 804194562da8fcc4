//! Claude Code `stream-json` output, one JSON object per line.

use serde::Deserialize;
use serde_json::Value;

use taskrelay::protocol::{RunMetrics, StreamEvent};

/// Longest command shown in a tool label.
pub const COMMAND_LABEL_MAX: usize = 80;

/// Longest tool result echoed back as an event.
pub const TOOL_RESULT_MAX: usize = 500;

/// Cut `text` to `max` characters, marking the cut with `...`.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Line {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    duration_ms: f64,
    #[serde(default)]
    num_turns: u64,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<Block>,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<Value>,
    /// Tool results carry either a string or a list of text blocks
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    is_error: bool,
}

/// Translate one stdout line. `None` for lines that carry nothing to show.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let msg: Line = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(_) => {
            tracing::debug!("skip unparseable line: {}", truncate(line, 200));
            return None;
        }
    };

    match msg.kind.as_str() {
        "system" => Some(StreamEvent::System {
            text: "系统初始化".to_string(),
            session_id: msg.session_id,
        }),
        "assistant" => {
            let blocks = msg.message.map(|m| m.content).unwrap_or_default();
            for block in blocks {
                match block.kind.as_str() {
                    "text" if !block.text.is_empty() => {
                        return Some(StreamEvent::assistant(block.text));
                    }
                    "tool_use" => {
                        let input = block.input.map(|v| v.to_string()).unwrap_or_default();
                        let label = tool_label(&block.name, &input);
                        return Some(StreamEvent::tool(block.name, input, label));
                    }
                    _ => {}
                }
            }
            if msg.subtype.is_empty() {
                None
            } else {
                Some(StreamEvent::system(msg.subtype))
            }
        }
        "user" => {
            let blocks = msg.message.map(|m| m.content).unwrap_or_default();
            blocks.into_iter().find_map(|block| {
                if block.kind == "text" && !block.text.is_empty() {
                    return Some(StreamEvent::User {
                        text: truncate(&block.text, TOOL_RESULT_MAX),
                    });
                }
                if block.kind != "tool_result" {
                    return None;
                }
                let text = result_text(block.content.as_ref()?);
                if text.is_empty() {
                    return None;
                }
                let text = truncate(&text, TOOL_RESULT_MAX);
                Some(if block.is_error {
                    StreamEvent::error(format!("⚠️ {}", text))
                } else {
                    StreamEvent::system(text)
                })
            })
        }
        "result" => {
            let usage = msg.usage.unwrap_or_default();
            Some(StreamEvent::Result(RunMetrics {
                text: msg.result,
                session_id: msg.session_id,
                cost_usd: msg.cost_usd.or(msg.total_cost_usd).unwrap_or_default(),
                tokens_in: msg.input_tokens.unwrap_or(usage.input_tokens),
                tokens_out: msg.output_tokens.unwrap_or(usage.output_tokens),
                duration_ms: msg.duration_ms,
                num_turns: msg.num_turns,
                done: true,
            }))
        }
        other => {
            tracing::debug!(kind = %other, "ignoring stream line");
            None
        }
    }
}

fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

/// Human readable label for a tool call.
pub fn tool_label(name: &str, input: &str) -> String {
    let args: Value = serde_json::from_str(input).unwrap_or(Value::Null);
    match name {
        "Write" | "write_file" | "write" => match arg(&args, "file_path") {
            Some(path) => format!("✏️ 写入 {}", path),
            None => "✏️ 写入文件".to_string(),
        },
        "Read" | "read_file" | "read" => match arg(&args, "file_path") {
            Some(path) => format!("📖 读取 {}", path),
            None => "📖 读取文件".to_string(),
        },
        "Edit" | "edit_file" => match arg(&args, "file_path") {
            Some(path) => format!("✏️ 编辑 {}", path),
            None => "✏️ 编辑文件".to_string(),
        },
        "Bash" | "bash" | "run_command" => match arg(&args, "command") {
            Some(cmd) => format!("💻 执行: {}", truncate(cmd, COMMAND_LABEL_MAX)),
            None => "💻 执行命令".to_string(),
        },
        _ => format!("🔧 {}", name),
    }
}

/// Claude Code writes only diagnostics to stderr.
pub fn parse_stderr(line: &str) -> Option<StreamEvent> {
    if line.trim().is_empty() {
        return None;
    }
    Some(StreamEvent::error(format!("⚠️ {}", line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_system_line() {
        let event = parse_line(r#"{"type":"system","subtype":"init","session_id":"cs1"}"#);
        assert_eq!(
            event,
            Some(StreamEvent::System {
                text: "系统初始化".to_string(),
                session_id: Some("cs1".to_string()),
            })
        );
    }

    #[test]
    fn test_assistant_text_and_tool_use() {
        let text = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"ok"}]}}"#;
        assert_eq!(parse_line(text), Some(StreamEvent::assistant("ok")));

        let tool = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Write","input":{"file_path":"file.txt","content":"x"}}]}}"#;
        match parse_line(tool) {
            Some(StreamEvent::Tool {
                text,
                tool_name,
                tool_input,
            }) => {
                assert_eq!(text, "✏️ 写入 file.txt");
                assert_eq!(tool_name, "Write");
                let input: Value = serde_json::from_str(&tool_input).unwrap();
                assert_eq!(input["file_path"], "file.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_long_command_label_truncated() {
        let cmd = "x".repeat(100);
        let label = tool_label("Bash", &serde_json::json!({ "command": cmd }).to_string());
        assert_eq!(label, format!("💻 执行: {}...", "x".repeat(80)));
        assert_eq!(tool_label("Glob", "{}"), "🔧 Glob");
        assert_eq!(tool_label("Read", "not json"), "📖 读取文件");
    }

    #[test]
    fn test_user_tool_result() {
        let long = "y".repeat(600);
        let line = serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "content": long}]}
        })
        .to_string();
        match parse_line(&line) {
            Some(StreamEvent::System { text, .. }) => {
                assert_eq!(text.chars().count(), 503);
                assert!(text.ends_with("..."));
            }
            other => panic!("unexpected {:?}", other),
        }

        let err = r#"{"type":"user","message":{"content":[{"type":"tool_result","is_error":true,"content":[{"type":"text","text":"boom"}]}]}}"#;
        assert_eq!(parse_line(err), Some(StreamEvent::error("⚠️ boom")));
    }

    #[test]
    fn test_user_text_block() {
        let line = r#"{"type":"user","message":{"content":[{"type":"text","text":"continue please"}]}}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(event.kind(), "user");
        assert_eq!(event.text(), "continue please");
        assert_eq!(
            parse_line(r#"{"type":"user","message":{"content":[{"type":"image"}]}}"#),
            None
        );
    }

    #[test]
    fn test_result_metrics() {
        let line = r#"{"type":"result","subtype":"success","result":"all done","session_id":"cs1","total_cost_usd":0.25,"duration_ms":4200,"num_turns":3,"usage":{"input_tokens":100,"output_tokens":40}}"#;
        match parse_line(line) {
            Some(StreamEvent::Result(metrics)) => {
                assert_eq!(metrics.text, "all done");
                assert_eq!(metrics.cost_usd, 0.25);
                assert_eq!(metrics.tokens_in, 100);
                assert_eq!(metrics.tokens_out, 40);
                assert_eq!(metrics.duration_ms, 4200.0);
                assert_eq!(metrics.num_turns, 3);
                assert!(metrics.done);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ignored_lines() {
        assert_eq!(parse_line("not json"), None);
        assert_eq!(parse_line(r#"{"type":"stream_event"}"#), None);
        assert_eq!(parse_line(r#"{"type":"assistant","message":{"content":[]}}"#), None);
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo", 3), "hél...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
