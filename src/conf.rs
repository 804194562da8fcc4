//! Line oriented `key = value` config files.
//!
//! `#` starts a comment line, `[name]` opens a section, and everything
//! before the first section is global. Only the first `=` splits, so values
//! may contain `=`. Lines without `=` are skipped.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Ordered key/value pairs. Later duplicates win on lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty value for `key`, if any.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub globals: Section,
    /// Sections in declaration order; a repeated header appends to the
    /// existing section.
    pub sections: Vec<(String, Section)>,
}

impl Document {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Every pair in the file with section headers ignored.
    pub fn flatten(&self) -> Section {
        let mut flat = self.globals.clone();
        for (_, section) in &self.sections {
            for (k, v) in section.iter() {
                flat.push(k, v);
            }
        }
        flat
    }
}

pub fn parse(text: &str) -> Document {
    let mut doc = Document::default();
    let mut current: Option<usize> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim();
            if name.is_empty() {
                continue;
            }
            let idx = match doc.sections.iter().position(|(n, _)| n == name) {
                Some(idx) => idx,
                None => {
                    doc.sections.push((name.to_string(), Section::default()));
                    doc.sections.len() - 1
                }
            };
            current = Some(idx);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match current {
            Some(idx) => doc.sections[idx].1.push(key, value),
            None => doc.globals.push(key, value),
        }
    }

    doc
}

pub fn load(path: &Path) -> Result<Document> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    Ok(parse(&text))
}

/// Split a comma separated list, trimming and dropping empty items.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a strictly positive integer, falling back to `default` for
/// missing, malformed, zero or negative values.
pub fn positive_or(value: Option<&str>, default: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map(|n| n as u64)
        .unwrap_or(default)
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Expand `~`, anchor relative paths at `base` and canonicalize. Paths
/// that do not exist yet are returned joined but otherwise untouched.
pub fn absolutize(path: &str, base: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

pub fn hostname() -> Option<String> {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_globals_and_sections() {
        let text = r#"
# agent settings
server_url = ws://host:9000/ws?a=b
max_concurrent = 2

[blog]
project_dir = /srv/blog
target.prod.host = deploy@10.0.0.1

[blog]
verify_url = http://10.0.0.1/health
"#;
        let doc = parse(text);
        assert_eq!(doc.globals.get("server_url"), Some("ws://host:9000/ws?a=b"));
        assert_eq!(doc.globals.get("max_concurrent"), Some("2"));
        assert_eq!(doc.sections.len(), 1);

        let blog = doc.section("blog").unwrap();
        assert_eq!(blog.get("project_dir"), Some("/srv/blog"));
        assert_eq!(blog.get("target.prod.host"), Some("deploy@10.0.0.1"));
        assert_eq!(blog.get("verify_url"), Some("http://10.0.0.1/health"));
    }

    #[test]
    fn test_skips_noise_lines() {
        let doc = parse("no equals here\n[]\n  # comment\nkey=\nother = x = y\n");
        assert_eq!(doc.globals.get("key"), Some(""));
        assert_eq!(doc.globals.value("key"), None);
        assert_eq!(doc.globals.get("other"), Some("x = y"));
        assert!(doc.sections.is_empty());
    }

    #[test]
    fn test_later_key_wins() {
        let doc = parse("a = 1\na = 2\n");
        assert_eq!(doc.globals.get("a"), Some("2"));
    }

    #[test]
    fn test_flatten_keeps_all_pairs() {
        let doc = parse("a = 1\n[s]\nb = 2\n");
        let flat = doc.flatten();
        assert_eq!(flat.get("a"), Some("1"));
        assert_eq!(flat.get("b"), Some("2"));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_positive_or() {
        assert_eq!(positive_or(Some("5"), 3), 5);
        assert_eq!(positive_or(Some("0"), 3), 3);
        assert_eq!(positive_or(Some("-2"), 3), 3);
        assert_eq!(positive_or(Some("abc"), 3), 3);
        assert_eq!(positive_or(None, 3), 3);
    }

    #[test]
    fn test_absolutize() {
        let base = Path::new("/base");
        assert_eq!(absolutize("rel/dir", base), PathBuf::from("/base/rel/dir"));
        assert_eq!(absolutize("/abs", base), PathBuf::from("/abs"));
    }

    #[test]
    fn test_absolutize_canonicalizes_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::create_dir_all(root.join("a/b")).unwrap();

        assert_eq!(absolutize("a/b/../b/.", &root), root.join("a/b"));
        assert_eq!(absolutize("a/missing/../x", &root), root.join("a/missing/../x"));
    }
}
