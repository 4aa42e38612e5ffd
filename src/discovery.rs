/// Test-name discovery: scan a directory's test source files for test functions.
///
/// A function is skipped when the comment line right before it carries the
/// ignore tag, or when it is the package entry point.
use crate::config::DiscoveryConfig;
use regex::Regex;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum DiscoveryError {
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::ReadDir { path, source } => {
                write!(f, "failed to read dir {}: {}", path.display(), source)
            }
            DiscoveryError::ReadFile { path, source } => {
                write!(f, "failed to read test file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoveryError::ReadDir { source, .. } => Some(source),
            DiscoveryError::ReadFile { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    file_suffix: String,
    entry_point: String,
    pattern: Regex,
}

impl Discovery {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(
            r"({}.*?[\n\r]+)?\s*func\s+(Test\w*)",
            regex::escape(&config.ignore_tag)
        ))?;
        Ok(Self {
            file_suffix: config.test_file_suffix.clone(),
            entry_point: config.entry_point.clone(),
            pattern,
        })
    }

    /// Test names declared in one source text, in order of appearance.
    pub fn tests_in_source(&self, source: &str) -> Vec<String> {
        self.pattern
            .captures_iter(source)
            .filter(|caps| caps.get(1).is_none())
            .filter_map(|caps| caps.get(2))
            .map(|m| m.as_str())
            .filter(|name| *name != self.entry_point)
            .map(str::to_string)
            .collect()
    }

    /// Test names from every test file directly in `dir`, files in name order.
    pub fn tests_in_dir(&self, dir: &Path) -> Result<Vec<String>, DiscoveryError> {
        let entries = std::fs::read_dir(dir).map_err(|e| DiscoveryError::ReadDir {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DiscoveryError::ReadDir {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name();
            if is_file && name.to_string_lossy().ends_with(&self.file_suffix) {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut tests = Vec::new();
        for path in files {
            let source = std::fs::read_to_string(&path)
                .map_err(|e| DiscoveryError::ReadFile { path: path.clone(), source: e })?;
            tests.extend(self.tests_in_source(&source));
        }
        tracing::debug!(dir = %dir.display(), count = tests.len(), "discovered tests");
        Ok(tests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery() -> Discovery {
        Discovery::new(&DiscoveryConfig::default()).unwrap()
    }

    const SOURCE: &str = r#"package calc

import "testing"

func TestMain(m *testing.M) {
	m.Run()
}

func TestAdd(t *testing.T) {}

// @Tester:ignore flaky on CI
func TestDivide(t *testing.T) {}

func helper() {}

func TestSub(t *testing.T) {}
"#;

    #[test]
    fn test_finds_tests_in_order() {
        let d = discovery();
        assert_eq!(d.tests_in_source(SOURCE), vec!["TestAdd", "TestSub"]);
    }

    #[test]
    fn test_ignore_tag_only_affects_next_function() {
        let d = discovery();
        let src = "// @Tester:ignore\nfunc TestA(t *testing.T) {}\nfunc TestB(t *testing.T) {}\n";
        assert_eq!(d.tests_in_source(src), vec!["TestB"]);
    }

    #[test]
    fn test_custom_tag_and_entry_point() {
        let d = Discovery::new(&DiscoveryConfig {
            test_file_suffix: "_test.go".to_string(),
            entry_point: "TestSetup".to_string(),
            ignore_tag: "skip(me)".to_string(),
        })
        .unwrap();
        let src = "func TestSetup() {}\n// skip(me)\nfunc TestX() {}\nfunc TestY() {}\n";
        assert_eq!(d.tests_in_source(src), vec!["TestY"]);
    }

    #[test]
    fn test_tests_in_dir_reads_only_test_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_test.go"), "func TestB(t *testing.T) {}\n").unwrap();
        std::fs::write(dir.path().join("a_test.go"), "func TestA(t *testing.T) {}\n").unwrap();
        std::fs::write(dir.path().join("main.go"), "func TestNope() {}\n").unwrap();
        std::fs::create_dir(dir.path().join("sub_test.go")).unwrap();

        let d = discovery();
        assert_eq!(d.tests_in_dir(dir.path()).unwrap(), vec!["TestA", "TestB"]);
    }

    #[test]
    fn test_tests_in_missing_dir_is_error() {
        let d = discovery();
        let err = d.tests_in_dir(Path::new("/nonexistent/tree")).unwrap_err();
        assert!(matches!(err, DiscoveryError::ReadDir { .. }));
    }
}
