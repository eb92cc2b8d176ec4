//! Build-context ignore rules.
//!
//! Rules are the built-in defaults followed by the lines of `.dockerignore`.
//! A leading `!` re-includes; the last matching rule wins. A pattern without
//! `/` is checked against every path component, a pattern with `/` against
//! the whole relative path (and its parent directories).

use regex::Regex;
use stagehand_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    ".venv",
    "__pycache__",
    "node_modules",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "*.pyc",
    ".env",
    ".stagehand",
];

pub const IGNORE_FILE: &str = ".dockerignore";

#[derive(Debug, Clone)]
struct Rule {
    negate: bool,
    whole_path: bool,
    regex: Regex,
}

/// Compiled ignore rules for one context directory.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    rules: Vec<Rule>,
}

/// Translate a glob into an anchored regex. `*` and `?` stay inside one
/// path component, `**` crosses components.
fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
        .map_err(|e| Error::Configuration(format!("invalid ignore pattern {:?}: {}", glob, e)))
}

impl IgnoreRules {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            let (negate, pattern) = match pattern.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            let pattern = pattern.trim_start_matches("./").trim_matches('/');
            if pattern.is_empty() {
                continue;
            }
            rules.push(Rule {
                negate,
                whole_path: pattern.contains('/'),
                regex: glob_to_regex(pattern)?,
            });
        }
        Ok(Self { rules })
    }

    /// Defaults plus the context directory's `.dockerignore`, if any.
    pub fn load(context_dir: &Path) -> Result<Self> {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect();
        let path = context_dir.join(IGNORE_FILE);
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            patterns.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
            debug!(path = %path.display(), "Loaded ignore file");
        }
        Self::new(patterns)
    }

    fn matches(rule: &Rule, path: &str) -> bool {
        if rule.whole_path {
            // The path itself or any parent directory.
            let mut end = path.len();
            loop {
                if rule.regex.is_match(&path[..end]) {
                    return true;
                }
                match path[..end].rfind('/') {
                    Some(i) => end = i,
                    None => return false,
                }
            }
        } else {
            path.split('/').any(|part| rule.regex.is_match(part))
        }
    }

    /// Whether a `/`-separated relative path belongs in the context.
    pub fn is_included(&self, path: &str) -> bool {
        let mut included = true;
        for rule in &self.rules {
            if Self::matches(rule, path) {
                included = rule.negate;
            }
        }
        included
    }

    /// Every included regular file under `context_dir`, sorted by relative path.
    pub fn collect_files(&self, context_dir: &Path) -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(context_dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(context_dir)
                .map_err(|e| Error::InvalidState(e.to_string()))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if self.is_included(&relative) {
                files.push((entry.path().to_path_buf(), relative));
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_exclude_components() {
        let rules = IgnoreRules::new(DEFAULT_EXCLUDES).unwrap();
        assert!(!rules.is_included(".git/config"));
        assert!(!rules.is_included("app/__pycache__/views.cpython-312.pyc"));
        assert!(!rules.is_included("frontend/node_modules/react/index.js"));
        assert!(!rules.is_included("app/models.pyc"));
        assert!(rules.is_included("app/models.py"));
        assert!(rules.is_included(".envrc"));
    }

    #[test]
    fn test_negation_last_match_wins() {
        let rules = IgnoreRules::new(["*.md", "!README.md"]).unwrap();
        assert!(!rules.is_included("docs/guide.md"));
        assert!(rules.is_included("README.md"));

        let rules = IgnoreRules::new(["!README.md", "*.md"]).unwrap();
        assert!(!rules.is_included("README.md"));
    }

    #[test]
    fn test_slash_patterns_match_whole_path() {
        let rules = IgnoreRules::new(["docs/*.md", "build/"]).unwrap();
        assert!(!rules.is_included("docs/guide.md"));
        assert!(rules.is_included("docs/api/guide.md"));
        assert!(rules.is_included("src/docs/guide.md"));
        assert!(!rules.is_included("build/out.js"));

        let rules = IgnoreRules::new(["frontend/dist"]).unwrap();
        assert!(!rules.is_included("frontend/dist/assets/app.js"));
        assert!(rules.is_included("frontend/src/app.ts"));
    }

    #[test]
    fn test_double_star_and_question_mark() {
        let rules = IgnoreRules::new(["**/*.log", "tmp?"]).unwrap();
        assert!(!rules.is_included("server.log"));
        assert!(!rules.is_included("var/log/server.log"));
        assert!(!rules.is_included("tmp1/file"));
        assert!(rules.is_included("tmp12/file"));
    }

    #[test]
    fn test_load_and_collect() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::write(root.join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(root.join("app/main.py"), "print(1)\n").unwrap();
        std::fs::write(root.join("app/secret.txt"), "x").unwrap();
        std::fs::write(root.join("node_modules/x/index.js"), "").unwrap();
        std::fs::write(root.join(IGNORE_FILE), "# local\n\napp/secret.txt\n").unwrap();

        let rules = IgnoreRules::load(root).unwrap();
        let files: Vec<String> = rules
            .collect_files(root)
            .unwrap()
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        assert_eq!(files, vec![".dockerignore", "Dockerfile", "app/main.py"]);
    }
}
