//! Just enough of `ssh_config(5)` to answer "which user and which identity
//! for this jump host".
//!
//! `Host` blocks with `*`/`?` globs and `!` negation are honored, keywords are
//! case-insensitive, and the first value found for a keyword wins. `Match`
//! blocks are skipped.

use log::debug;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct HostPattern {
    regex: Regex,
    negated: bool,
}

impl HostPattern {
    fn compile(pattern: &str) -> Option<Self> {
        let (negated, glob) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let expr = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
        Regex::new(&format!("(?i)^{}$", expr))
            .ok()
            .map(|regex| HostPattern { regex, negated })
    }
}

#[derive(Debug)]
struct HostBlock {
    patterns: Vec<HostPattern>,
    // `Match` blocks never apply
    inert: bool,
    options: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, host: &str) -> bool {
        if self.inert {
            return false;
        }
        let mut matched = false;
        for pattern in &self.patterns {
            if pattern.regex.is_match(host) {
                if pattern.negated {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

#[derive(Debug, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

impl SshConfig {
    pub fn parse(text: &str) -> Self {
        let mut blocks = vec![HostBlock {
            patterns: HostPattern::compile("*").into_iter().collect(),
            inert: false,
            options: Vec::new(),
        }];

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_keyword(line) else {
                continue;
            };
            match key.as_str() {
                "host" => blocks.push(HostBlock {
                    patterns: value.split_whitespace().filter_map(HostPattern::compile).collect(),
                    inert: false,
                    options: Vec::new(),
                }),
                "match" => blocks.push(HostBlock {
                    patterns: Vec::new(),
                    inert: true,
                    options: Vec::new(),
                }),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.options.push((key, value));
                    }
                }
            }
        }
        Self { blocks }
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// `~/.ssh/config` followed by `/etc/ssh/ssh_config`. Missing files are
    /// treated as empty.
    pub fn load_default() -> Self {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".ssh").join("config"));
        }
        paths.push(PathBuf::from("/etc/ssh/ssh_config"));

        let mut config = SshConfig::default();
        for path in paths {
            match Self::from_file(&path) {
                Ok(parsed) => config.blocks.extend(parsed.blocks),
                Err(e) => debug!("Skipping ssh config {}: {}", path.display(), e),
            }
        }
        config
    }

    /// First value of `key` that applies to `host`.
    pub fn get(&self, host: &str, key: &str) -> Option<&str> {
        self.get_all(host, key).into_iter().next()
    }

    /// Every value of `key` that applies to `host`, in file order.
    /// `IdentityFile` is the one keyword where that matters.
    pub fn get_all(&self, host: &str, key: &str) -> Vec<&str> {
        let key = key.to_ascii_lowercase();
        self.blocks
            .iter()
            .filter(|block| block.matches(host))
            .flat_map(|block| block.options.iter())
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// `Keyword value`, `Keyword=value` or `Keyword = value`. The keyword comes
/// back lower-cased and surrounding quotes are removed from the value.
fn split_keyword(line: &str) -> Option<(String, String)> {
    let split_at = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let (key, rest) = line.split_at(split_at);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    if key.is_empty() || rest.is_empty() {
        return None;
    }
    let value = rest
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(rest);
    Some((key.to_ascii_lowercase(), value.to_string()))
}

/// Expands a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\"))
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
# global defaults
IdentityFile ~/.ssh/global_key

Host bastion bastion.corp.example
    User jump
    IdentityFile ~/.ssh/bastion

Host *.corp.example !secret.corp.example
    User=corp
    Port 2222

Match host other
    User never

Host *
    User fallback
"#;

    #[test]
    fn test_first_value_wins() {
        let config = SshConfig::parse(SAMPLE);
        assert_eq!(config.get("bastion", "User"), Some("jump"));
        assert_eq!(config.get("bastion.corp.example", "user"), Some("jump"));
        assert_eq!(config.get("db.corp.example", "User"), Some("corp"));
        assert_eq!(config.get("elsewhere", "User"), Some("fallback"));
    }

    #[test]
    fn test_negated_pattern() {
        let config = SshConfig::parse(SAMPLE);
        assert_eq!(config.get("secret.corp.example", "User"), Some("fallback"));
        assert_eq!(config.get("secret.corp.example", "Port"), None);
    }

    #[test]
    fn test_match_blocks_are_ignored() {
        let config = SshConfig::parse(SAMPLE);
        assert_eq!(config.get("other", "User"), Some("fallback"));
    }

    #[test]
    fn test_identity_files_accumulate() {
        let config = SshConfig::parse(SAMPLE);
        assert_eq!(
            config.get_all("bastion", "IdentityFile"),
            vec!["~/.ssh/global_key", "~/.ssh/bastion"]
        );
    }

    #[test]
    fn test_glob_question_mark_and_case() {
        let config = SshConfig::parse("Host web?\n  User www\n");
        assert_eq!(config.get("WEB1", "user"), Some("www"));
        assert_eq!(config.get("web10", "user"), None);
    }

    #[test]
    fn test_quoted_value() {
        let config = SshConfig::parse("Host h\n  IdentityFile \"/keys/my key\"\n");
        assert_eq!(config.get("h", "IdentityFile"), Some("/keys/my key"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Host jump\n  User alice").unwrap();
        let config = SshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.get("jump", "User"), Some("alice"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/abs/key"), PathBuf::from("/abs/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/.ssh/id_rsa"), home.join(".ssh/id_rsa"));
        }
    }
}
