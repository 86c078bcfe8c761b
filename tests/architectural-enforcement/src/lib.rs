//! Architectural Enforcement
//!
//! Source scanners shared by the enforcement tests in `tests/`. Each test
//! walks the production sources of the relay crates and reports every line
//! that breaks one rule:
//! - No sleeping in production code
//! - No blocking I/O inside async functions
//! - No `unwrap()` / `expect()` outside tests
//!
//! The scanners are line based. They understand `//` comments, `#[cfg(test)]`
//! modules and the enclosing `fn` of a line, which is enough for the rules
//! above.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// Workspace root, derived from this package's location
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File, relative to the workspace root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Offending line, trimmed
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// A Rust source file split into lines
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// File, relative to the workspace root
    pub path: PathBuf,
    /// Lines without terminators
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Build from in-memory text
    #[must_use]
    pub fn from_text(path: impl Into<PathBuf>, text: &str) -> Self {
        Self {
            path: path.into(),
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    /// Whether the path ends with `suffix` (compared with `/` separators)
    #[must_use]
    pub fn path_ends_with(&self, suffix: &str) -> bool {
        self.path
            .to_string_lossy()
            .replace('\\', "/")
            .ends_with(suffix)
    }

    /// Index of the first line of the test module, if any
    ///
    /// Matches `#[cfg(test)]` as well as combined gates such as
    /// `#[cfg(all(test, unix))]` directly above a `mod`.
    #[must_use]
    pub fn test_module_start(&self) -> Option<usize> {
        self.lines.iter().enumerate().find_map(|(idx, line)| {
            let line = line.trim();
            let is_cfg_test = line.starts_with("#[cfg(") && line.contains("test");
            let next_is_mod = self
                .lines
                .get(idx + 1)
                .is_some_and(|next| next.trim_start().starts_with("mod "));
            (is_cfg_test && next_is_mod).then_some(idx)
        })
    }

    /// Lines outside test modules, with comments removed
    ///
    /// Yields `(index, code)` pairs; blank results are skipped.
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        let end = self.test_module_start().unwrap_or(self.lines.len());
        self.lines[..end]
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx, code_part(line)))
            .filter(|(_, code)| !code.trim().is_empty())
    }

    /// Whether the line at `idx` sits inside an `async fn`
    #[must_use]
    pub fn is_in_async_fn(&self, idx: usize) -> bool {
        self.enclosing_fn(idx)
            .is_some_and(|signature| signature.contains("async fn "))
    }

    /// Signature line of the function enclosing `idx`
    fn enclosing_fn(&self, idx: usize) -> Option<&str> {
        self.lines[..=idx.min(self.lines.len().saturating_sub(1))]
            .iter()
            .rev()
            .map(|line| code_part(line).trim())
            .find(|line| is_fn_signature(line))
    }
}

/// Code portion of a line, with any `//` comment stripped
#[must_use]
pub fn code_part(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") {
        return "";
    }
    match line.find(" //") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn is_fn_signature(line: &str) -> bool {
    const PREFIXES: &[&str] = &["pub ", "pub(crate) ", "pub(super) ", "async ", "const ", "unsafe "];
    let mut rest = line;
    loop {
        if rest.starts_with("fn ") {
            return true;
        }
        match PREFIXES.iter().find(|p| rest.starts_with(*p)) {
            Some(prefix) => rest = &rest[prefix.len()..],
            None => return false,
        }
    }
}

/// Load every `.rs` file under the production directories
///
/// # Panics
///
/// Panics if a production directory is missing; a renamed crate must be
/// reflected in [`PRODUCTION_DIRS`].
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut sources = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        assert!(path.is_dir(), "production directory {dir} not found");

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(text) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            sources.push(SourceFile::from_text(relative, &text));
        }
    }

    sources
}

/// Collect every production line for which `is_violation` holds
pub fn scan<F>(sources: &[SourceFile], mut is_violation: F) -> Vec<Violation>
where
    F: FnMut(&SourceFile, usize, &str) -> bool,
{
    let mut violations = Vec::new();
    for source in sources {
        for (idx, code) in source.production_lines() {
            if is_violation(source, idx, code) {
                violations.push(Violation {
                    path: source.path.clone(),
                    line: idx + 1,
                    text: source.lines[idx].trim().to_string(),
                });
            }
        }
    }
    violations
}

/// Print violations and fail the test
///
/// # Panics
///
/// Always, when `violations` is non-empty.
pub fn report(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n{rule}:");
    for violation in violations {
        eprintln!("  {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
use std::fs;

pub async fn load() {
    let text = std::fs::read_to_string(\"x\"); // blocking
}

fn helper() {
    // value.unwrap()
    let n = value.unwrap();
}

#[cfg(test)]
mod tests {
    fn t() { value.unwrap(); }
}
";

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let source = SourceFile::from_text("sample.rs", SAMPLE);
        assert_eq!(source.test_module_start(), Some(11));
        assert!(source
            .production_lines()
            .all(|(idx, _)| idx < 11));
    }

    #[test]
    fn test_combined_cfg_gate_marks_test_module() {
        let source = SourceFile::from_text(
            "gated.rs",
            "fn run() {}\n\n#[cfg(all(test, unix))]\nmod tests {\n}\n",
        );
        assert_eq!(source.test_module_start(), Some(2));
    }

    #[test]
    fn test_comments_are_stripped() {
        assert_eq!(code_part("    // value.unwrap()"), "");
        assert_eq!(code_part("let a = 1; // note"), "let a = 1;");
    }

    #[test]
    fn test_async_fn_detection() {
        let source = SourceFile::from_text("sample.rs", SAMPLE);
        assert!(source.is_in_async_fn(3));
        assert!(!source.is_in_async_fn(8));
    }

    #[test]
    fn test_scan_finds_production_unwrap_only() {
        let sources = vec![SourceFile::from_text("sample.rs", SAMPLE)];
        let found = scan(&sources, |_, _, code| code.contains(".unwrap()"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 9);
    }
}
