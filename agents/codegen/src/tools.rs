//! Coding CLIs the agent can drive and how to talk to each of them.

use std::path::Path;

use serde::Deserialize;

use taskrelay::process;
use taskrelay::protocol::{StreamEvent, TaskAssign};

use crate::config::CodegenConfig;
use crate::{opencode, stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingTool {
    ClaudeCode,
    OpenCode,
}

impl CodingTool {
    /// Tool requested by a task. Anything unrecognised runs Claude Code.
    pub fn from_task(tool: &str) -> Self {
        match tool {
            "opencode" => CodingTool::OpenCode,
            _ => CodingTool::ClaudeCode,
        }
    }

    /// Identifier used on the wire.
    pub fn id(&self) -> &'static str {
        match self {
            CodingTool::ClaudeCode => "claudecode",
            CodingTool::OpenCode => "opencode",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CodingTool::ClaudeCode => "Claude Code",
            CodingTool::OpenCode => "OpenCode",
        }
    }

    pub fn program<'a>(&self, config: &'a CodegenConfig) -> &'a str {
        match self {
            CodingTool::ClaudeCode => &config.claude_path,
            CodingTool::OpenCode => &config.opencode_path,
        }
    }

    pub fn settings_dir<'a>(&self, config: &'a CodegenConfig) -> &'a Path {
        match self {
            CodingTool::ClaudeCode => &config.claudecode_settings_dir,
            CodingTool::OpenCode => &config.opencode_settings_dir,
        }
    }

    pub fn args(&self, task: &TaskAssign, config: &CodegenConfig) -> Vec<String> {
        match self {
            CodingTool::ClaudeCode => claude_args(task, config),
            CodingTool::OpenCode => opencode_args(task, config),
        }
    }

    pub fn parse_stdout(&self, line: &str) -> Option<StreamEvent> {
        match self {
            CodingTool::ClaudeCode => stream::parse_line(line),
            CodingTool::OpenCode => opencode::parse_line(line),
        }
    }

    pub fn parse_stderr(&self, line: &str) -> Option<StreamEvent> {
        match self {
            CodingTool::ClaudeCode => stream::parse_stderr(line),
            CodingTool::OpenCode => opencode::parse_stderr(line),
        }
    }
}

fn claude_args(task: &TaskAssign, config: &CodegenConfig) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        task.prompt.clone(),
        "--verbose".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--dangerously-skip-permissions".into(),
    ];

    if !task.system_prompt.is_empty() {
        args.push("--append-system-prompt".into());
        args.push(task.system_prompt.clone());
    }

    let max_turns = if task.max_turns > 0 {
        task.max_turns
    } else {
        config.max_turns as i64
    };
    if max_turns > 0 {
        args.push("--max-turns".into());
        args.push(max_turns.to_string());
    }

    if !task.model.is_empty() {
        let settings = config
            .claudecode_settings_dir
            .join(format!("{}.json", task.model));
        if settings.is_file() {
            args.push("--settings".into());
            args.push(settings.to_string_lossy().into_owned());
        }
    }

    args
}

fn opencode_args(task: &TaskAssign, config: &CodegenConfig) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--format".into(), "json".into()];

    if !task.model.is_empty() {
        args.push("--model".into());
        args.push(opencode_model(&config.opencode_settings_dir, &task.model));
    }

    // No system prompt flag; fold it into the prompt.
    if task.system_prompt.is_empty() {
        args.push(task.prompt.clone());
    } else {
        args.push(format!(
            "[系统指令] {}\n\n[用户需求] {}",
            task.system_prompt, task.prompt
        ));
    }
    args
}

#[derive(Deserialize)]
struct OpenCodeSettings {
    #[serde(default)]
    model: String,
}

/// `provider/model` id for a configured model name.
fn opencode_model(settings_dir: &Path, model: &str) -> String {
    let path = settings_dir.join(format!("{}.json", model));
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<OpenCodeSettings>(&text).ok())
        .map(|s| s.model)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| model.to_string())
}

/// Model names offered by a settings directory: its `*.json` file stems.
pub fn scan_models(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut models: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let path = e.path();
            let is_json = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if !is_json {
                return None;
            }
            path.file_stem().map(|s| s.to_string_lossy().into_owned())
        })
        .collect();
    models.sort();
    models
}

/// What this machine can offer, reported on register and heartbeat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub claudecode_models: Vec<String>,
    pub opencode_models: Vec<String>,
    pub models: Vec<String>,
    pub tools: Vec<String>,
}

impl Inventory {
    pub fn scan(config: &CodegenConfig) -> Self {
        let claudecode_models = scan_models(&config.claudecode_settings_dir);
        let opencode_models = scan_models(&config.opencode_settings_dir);

        let mut models: Vec<String> = claudecode_models
            .iter()
            .chain(opencode_models.iter())
            .cloned()
            .collect();
        models.sort();
        models.dedup();

        let tools = [CodingTool::ClaudeCode, CodingTool::OpenCode]
            .into_iter()
            .filter(|tool| process::which(tool.program(config)).is_some())
            .map(|tool| tool.id().to_string())
            .collect();

        Self {
            claudecode_models,
            opencode_models,
            models,
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use taskrelay::conf;

    fn config(settings: &Path) -> CodegenConfig {
        let text = format!(
            "server_url = ws://s\nworkspaces = /ws\nclaude_path = sh\nopencode_path = no-such-opencode-bin\n\
             claudecode_settings_dir = {0}/cc\nopencode_settings_dir = {0}/oc\n",
            settings.display()
        );
        CodegenConfig::from_section(&conf::parse(&text).flatten(), settings, settings).unwrap()
    }

    fn task() -> TaskAssign {
        TaskAssign {
            session_id: "abc".to_string(),
            project: "proj1".to_string(),
            prompt: "hello".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_task() {
        assert_eq!(CodingTool::from_task("opencode"), CodingTool::OpenCode);
        assert_eq!(CodingTool::from_task("claudecode"), CodingTool::ClaudeCode);
        assert_eq!(CodingTool::from_task(""), CodingTool::ClaudeCode);
        assert_eq!(CodingTool::from_task("vim"), CodingTool::ClaudeCode);
    }

    #[test]
    fn test_claude_args() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let args = CodingTool::ClaudeCode.args(&task(), &config);
        assert_eq!(
            args,
            vec![
                "-p",
                "hello",
                "--verbose",
                "--output-format",
                "stream-json",
                "--dangerously-skip-permissions",
                "--max-turns",
                "20",
            ]
        );

        fs::create_dir_all(dir.path().join("cc")).unwrap();
        fs::write(dir.path().join("cc/sonnet.json"), "{}").unwrap();
        let mut t = task();
        t.system_prompt = "be brief".to_string();
        t.max_turns = 5;
        t.model = "sonnet".to_string();
        let args = CodingTool::ClaudeCode.args(&t, &config);
        let tail: Vec<&str> = args[6..].iter().map(String::as_str).collect();
        let settings = dir.path().join("cc/sonnet.json");
        assert_eq!(
            tail,
            vec![
                "--append-system-prompt",
                "be brief",
                "--max-turns",
                "5",
                "--settings",
                settings.to_str().unwrap(),
            ]
        );

        t.model = "missing".to_string();
        assert!(!CodingTool::ClaudeCode
            .args(&t, &config)
            .contains(&"--settings".to_string()));
    }

    #[test]
    fn test_opencode_args() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(dir.path().join("oc")).unwrap();
        fs::write(
            dir.path().join("oc/deepseek.json"),
            r#"{"model":"deepseek/deepseek-reasoner"}"#,
        )
        .unwrap();

        let mut t = task();
        t.model = "deepseek".to_string();
        t.system_prompt = "rules".to_string();
        assert_eq!(
            CodingTool::OpenCode.args(&t, &config),
            vec![
                "run",
                "--format",
                "json",
                "--model",
                "deepseek/deepseek-reasoner",
                "[系统指令] rules\n\n[用户需求] hello",
            ]
        );

        t.model = "plain".to_string();
        t.system_prompt.clear();
        let args = CodingTool::OpenCode.args(&t, &config);
        assert_eq!(args[3..], ["--model", "plain", "hello"]);
    }

    #[test]
    fn test_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(dir.path().join("cc")).unwrap();
        fs::create_dir_all(dir.path().join("oc")).unwrap();
        fs::write(dir.path().join("cc/b.json"), "{}").unwrap();
        fs::write(dir.path().join("cc/a.JSON"), "{}").unwrap();
        fs::write(dir.path().join("cc/notes.txt"), "").unwrap();
        fs::write(dir.path().join("oc/b.json"), "{}").unwrap();
        fs::write(dir.path().join("oc/c.json"), "{}").unwrap();

        let inventory = Inventory::scan(&config);
        assert_eq!(inventory.claudecode_models, vec!["a", "b"]);
        assert_eq!(inventory.opencode_models, vec!["b", "c"]);
        assert_eq!(inventory.models, vec!["a", "b", "c"]);
        if cfg!(unix) {
            assert_eq!(inventory.tools, vec!["claudecode"]);
        }
    }
}
