//! OpenCode `run --format json` output.
//!
//! Stdout carries NDJSON step, text and tool events; stderr carries the
//! human progress log (`> phase · model`, `$ command`, command output).

use serde::Deserialize;
use serde_json::Value;

use taskrelay::protocol::{RunMetrics, StreamEvent};

use crate::stream::{truncate, COMMAND_LABEL_MAX, TOOL_RESULT_MAX};

#[derive(Debug, Deserialize)]
struct Line {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    part: Option<Part>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    state: Option<ToolState>,
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    tokens: Option<Tokens>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    error: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct Tokens {
    #[serde(default)]
    input: u64,
    #[serde(default)]
    output: u64,
}

pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let msg: Line = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(_) => {
            tracing::debug!("opencode: skip unparseable line: {}", truncate(line, 200));
            return None;
        }
    };
    let part = msg.part.unwrap_or_default();

    match msg.kind.as_str() {
        "text" if !part.text.is_empty() => Some(StreamEvent::assistant(part.text)),
        "tool_use" => {
            let name = if part.tool.is_empty() {
                "unknown".to_string()
            } else {
                part.tool
            };
            let state = part.state.unwrap_or_default();
            if state.status == "error" {
                return Some(StreamEvent::error(format!("⚠️ {}: {}", name, state.error)));
            }
            let input = state.input.as_ref().map(Value::to_string).unwrap_or_default();
            let label = tool_label(&name, &state);
            Some(StreamEvent::tool(name, input, label))
        }
        "step_start" => Some(StreamEvent::system("开始新的推理步骤...")),
        // Intermediate step; the run is finished by the task completion.
        "step_finish" => {
            let tokens = part.tokens.unwrap_or_default();
            Some(StreamEvent::Result(RunMetrics {
                cost_usd: part.cost,
                tokens_in: tokens.input,
                tokens_out: tokens.output,
                done: false,
                ..Default::default()
            }))
        }
        "error" => {
            let text = match msg.error {
                Some(Value::String(s)) if !s.is_empty() => s,
                Some(Value::Object(obj)) => obj
                    .get("message")
                    .or_else(|| obj.get("data").and_then(|d| d.get("message")))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
                _ => "unknown error".to_string(),
            };
            Some(StreamEvent::error(format!("⚠️ {}", text)))
        }
        _ => None,
    }
}

fn first_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| input.get(*k).and_then(Value::as_str))
}

fn tool_label(name: &str, state: &ToolState) -> String {
    let input = state.input.clone().unwrap_or(Value::Null);
    let titled = |icon: &str, fallback: &str| {
        if state.title.is_empty() {
            fallback.to_string()
        } else {
            format!("{} {}", icon, state.title)
        }
    };

    match name {
        "bash" => match first_str(&input, &["command"]) {
            Some(cmd) => {
                let mut label = format!("💻 命令: {}", truncate(cmd, COMMAND_LABEL_MAX));
                if let Some(desc) = first_str(&input, &["description"]).filter(|d| !d.is_empty()) {
                    label.push_str(&format!("\n说明: {}", desc));
                }
                label
            }
            None => titled("💻", "💻 执行命令"),
        },
        "read" => match first_str(&input, &["filePath", "file", "path"]) {
            Some(path) => format!("📖 文件: {}", path),
            None => titled("📖", "📖 读取文件"),
        },
        "write" => match first_str(&input, &["filePath", "file"]) {
            Some(path) => format!("✏️ 文件: {}", path),
            None => titled("✏️", "✏️ 写入文件"),
        },
        "edit" => match first_str(&input, &["filePath"]) {
            Some(path) => format!("✏️ 编辑: {}", path),
            None => titled("✏️", "✏️ 编辑文件"),
        },
        "glob" => match first_str(&input, &["pattern"]) {
            Some(pattern) => format!("🔍 搜索文件: {}", pattern),
            None => "🔍 搜索文件".to_string(),
        },
        "grep" => match first_str(&input, &["pattern"]) {
            Some(pattern) => format!("🔍 搜索内容: {}", pattern),
            None => "🔍 搜索内容".to_string(),
        },
        _ if !state.title.is_empty() => format!("🔧 {}: {}", name, state.title),
        _ => format!("🔧 {}", name),
    }
}

pub fn parse_stderr(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(cmd) = trimmed.strip_prefix("$ ") {
        return Some(StreamEvent::tool("bash", "", format!("💻 执行: {}", cmd)));
    }
    if trimmed.starts_with("> ") {
        return Some(StreamEvent::system(trimmed));
    }
    Some(StreamEvent::system(truncate(trimmed, TOOL_RESULT_MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_text_and_steps() {
        assert_eq!(
            parse_line(r#"{"type":"text","part":{"type":"text","text":"你好！"}}"#),
            Some(StreamEvent::assistant("你好！"))
        );
        assert_eq!(
            parse_line(r#"{"type":"step_start","part":{"type":"step-start"}}"#),
            Some(StreamEvent::system("开始新的推理步骤..."))
        );
        match parse_line(
            r#"{"type":"step_finish","part":{"type":"step-finish","reason":"stop","cost":0.0003,"tokens":{"input":33,"output":35}}}"#,
        ) {
            Some(StreamEvent::Result(m)) => {
                assert_eq!(m.cost_usd, 0.0003);
                assert_eq!(m.tokens_in, 33);
                assert_eq!(m.tokens_out, 35);
                assert!(!m.done);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tool_use() {
        let line = r#"{"type":"tool_use","part":{"type":"tool","tool":"bash","state":{"status":"completed","input":{"command":"ls -la","description":"list"},"output":"x"}}}"#;
        match parse_line(line) {
            Some(StreamEvent::Tool {
                text, tool_name, ..
            }) => {
                assert_eq!(tool_name, "bash");
                assert_eq!(text, "💻 命令: ls -la\n说明: list");
            }
            other => panic!("unexpected {:?}", other),
        }

        let failed = r#"{"type":"tool_use","part":{"tool":"write","state":{"status":"error","error":"denied"}}}"#;
        assert_eq!(parse_line(failed), Some(StreamEvent::error("⚠️ write: denied")));

        let titled = r#"{"type":"tool_use","part":{"tool":"webfetch","state":{"status":"completed","title":"example.com"}}}"#;
        assert_eq!(parse_line(titled).unwrap().text(), "🔧 webfetch: example.com");
    }

    #[test]
    fn test_error_line() {
        assert_eq!(
            parse_line(r#"{"type":"error","error":"rate limited"}"#),
            Some(StreamEvent::error("⚠️ rate limited"))
        );
        assert_eq!(
            parse_line(r#"{"type":"error"}"#),
            Some(StreamEvent::error("⚠️ unknown error"))
        );
    }

    #[test]
    fn test_stderr_lines() {
        assert_eq!(parse_stderr("   "), None);
        assert_eq!(
            parse_stderr("$ cargo test"),
            Some(StreamEvent::tool("bash", "", "💻 执行: cargo test"))
        );
        assert_eq!(
            parse_stderr("> build · deepseek"),
            Some(StreamEvent::system("> build · deepseek"))
        );
        let long = "z".repeat(700);
        assert_eq!(parse_stderr(&long).unwrap().text().chars().count(), 503);
    }
}
