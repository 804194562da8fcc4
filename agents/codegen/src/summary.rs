//! Per-task accounting, logged when a coding run finishes.

use serde_json::Value;

use taskrelay::protocol::StreamEvent;

use crate::stream::truncate;

const REPORT_TEXT_MAX: usize = 3000;

#[derive(Debug, Default)]
pub struct TaskSummary {
    pub files_written: Vec<String>,
    pub files_edited: Vec<String>,
    pub files_read: Vec<String>,
    pub commands_run: Vec<String>,
    pub result_text: String,
    pub assistant_text: String,
    pub total_cost: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: f64,
    pub num_turns: u64,
}

fn file_path(input: &Value) -> Option<String> {
    ["file_path", "filePath", "path", "file"]
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

impl TaskSummary {
    pub fn update(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Result(metrics) => {
                self.total_cost += metrics.cost_usd;
                self.tokens_in += metrics.tokens_in;
                self.tokens_out += metrics.tokens_out;
                if metrics.duration_ms > 0.0 {
                    self.duration_ms = metrics.duration_ms;
                }
                if metrics.num_turns > 0 {
                    self.num_turns = metrics.num_turns;
                }
                if !metrics.text.is_empty() {
                    self.result_text = metrics.text.clone();
                }
            }
            StreamEvent::Assistant { text } => {
                self.assistant_text.push_str(text);
                self.assistant_text.push('\n');
            }
            StreamEvent::Tool {
                tool_name,
                tool_input,
                ..
            } if !tool_input.is_empty() => {
                let input: Value = serde_json::from_str(tool_input).unwrap_or(Value::Null);
                match tool_name.as_str() {
                    "write" | "Write" => self.files_written.extend(file_path(&input)),
                    "edit" | "Edit" | "edit_file" => self.files_edited.extend(file_path(&input)),
                    "read" | "Read" | "read_file" => self.files_read.extend(file_path(&input)),
                    "bash" | "Bash" | "run_command" => {
                        if let Some(cmd) = input.get("command").and_then(Value::as_str) {
                            if !cmd.is_empty() {
                                self.commands_run.push(cmd.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    pub fn report(&self) -> String {
        let mut lines = vec!["📋 任务完成报告".to_string(), "━━━━━━━━━━━━━━━━".to_string()];

        let result = if self.result_text.is_empty() {
            self.last_assistant_block()
        } else {
            self.result_text.clone()
        };
        if !result.is_empty() {
            lines.push(String::new());
            lines.push("📝 完成内容:".to_string());
            lines.push(truncate(&result, REPORT_TEXT_MAX));
            lines.push(String::new());
            lines.push("━━━━━━━━━━━━━━━━".to_string());
        }

        let written = unique(&self.files_written);
        if !written.is_empty() {
            lines.push(format!("✏️ 新建文件 ({}):", written.len()));
            lines.extend(written.iter().map(|f| format!("   • {}", shorten_path(f))));
        }
        let edited = unique(&self.files_edited);
        if !edited.is_empty() {
            lines.push(format!("✏️ 编辑文件 ({}):", edited.len()));
            lines.extend(edited.iter().map(|f| format!("   • {}", shorten_path(f))));
        }
        if !self.files_read.is_empty() {
            lines.push(format!("📖 读取文件 ({})", unique(&self.files_read).len()));
        }
        if !self.commands_run.is_empty() {
            lines.push(format!("💻 执行命令 ({})", self.commands_run.len()));
        }

        let mut stats = Vec::new();
        if self.total_cost > 0.0 {
            stats.push(format!("${:.4}", self.total_cost));
        }
        if self.tokens_out > 0 {
            stats.push(format!("{} tokens", self.tokens_out));
        }
        if self.num_turns > 0 {
            stats.push(format!("{} turns", self.num_turns));
        }
        if self.duration_ms > 0.0 {
            let secs = self.duration_ms / 1000.0;
            if secs >= 60.0 {
                stats.push(format!("{:.1} min", secs / 60.0));
            } else {
                stats.push(format!("{:.0}s", secs));
            }
        }
        if !stats.is_empty() {
            lines.push(format!("📊 {}", stats.join(" | ")));
        }

        lines.join("\n")
    }

    /// Tail of the assistant output, starting at a line boundary.
    fn last_assistant_block(&self) -> String {
        let text = self.assistant_text.trim();
        let count = text.chars().count();
        if count <= REPORT_TEXT_MAX {
            return text.to_string();
        }
        let tail: String = text.chars().skip(count - REPORT_TEXT_MAX).collect();
        match tail.find('\n') {
            Some(idx) if idx < 200 => tail[idx + 1..].to_string(),
            _ => tail,
        }
    }
}

fn unique(items: &[String]) -> Vec<&String> {
    let mut seen = std::collections::HashSet::new();
    items.iter().filter(|i| seen.insert(i.as_str())).collect()
}

/// Keep the last two path segments.
fn shorten_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        return path;
    }
    format!(".../{}", parts[parts.len() - 2..].join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrelay::protocol::RunMetrics;

    #[test]
    fn test_collects_tool_activity() {
        let mut summary = TaskSummary::default();
        summary.update(&StreamEvent::tool("Write", r#"{"file_path":"/a/b/c.txt"}"#, ""));
        summary.update(&StreamEvent::tool("Write", r#"{"file_path":"/a/b/c.txt"}"#, ""));
        summary.update(&StreamEvent::tool("edit", r#"{"filePath":"x.rs"}"#, ""));
        summary.update(&StreamEvent::tool("Bash", r#"{"command":"ls"}"#, ""));
        summary.update(&StreamEvent::tool("bash", "", "💻 执行: ls"));
        summary.update(&StreamEvent::Result(RunMetrics {
            text: "finished".to_string(),
            cost_usd: 0.5,
            tokens_out: 42,
            duration_ms: 90_000.0,
            num_turns: 4,
            done: true,
            ..Default::default()
        }));

        assert_eq!(summary.files_written.len(), 2);
        assert_eq!(summary.files_edited, vec!["x.rs"]);
        assert_eq!(summary.commands_run, vec!["ls"]);

        let report = summary.report();
        assert!(report.contains("📝 完成内容:\nfinished"));
        assert!(report.contains("✏️ 新建文件 (1):\n   • .../b/c.txt"));
        assert!(report.contains("💻 执行命令 (1)"));
        assert!(report.contains("📊 $0.5000 | 42 tokens | 4 turns | 1.5 min"));
    }

    #[test]
    fn test_falls_back_to_assistant_text() {
        let mut summary = TaskSummary::default();
        summary.update(&StreamEvent::assistant("first"));
        summary.update(&StreamEvent::assistant("second"));
        assert!(summary.report().contains("first\nsecond"));
    }

    #[test]
    fn test_shorten_path() {
        assert_eq!(shorten_path("a/b"), "a/b");
        assert_eq!(shorten_path("C:\\x\\y\\z.txt"), ".../y/z.txt");
    }
}
