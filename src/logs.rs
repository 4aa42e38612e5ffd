use std::path::{Path, PathBuf};

/// Maps the source tree onto the logs tree.
///
/// A test in `<root>/a/b` logs to `<logs>/a/b/<test>.log`.
#[derive(Debug, Clone)]
pub struct LogDir {
    root: PathBuf,
    logs: PathBuf,
}

#[derive(Debug)]
pub enum LogError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::CreateDir { path, source } => {
                write!(f, "can't create dir {}: {}", path.display(), source)
            }
            LogError::Write { path, source } => {
                write!(f, "write log file {} error: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::CreateDir { source, .. } => Some(source),
            LogError::Write { source, .. } => Some(source),
        }
    }
}

impl LogDir {
    pub fn new(root: impl Into<PathBuf>, logs: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            logs: logs.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The logs directory mirroring `test_dir`.
    pub fn dir_for(&self, test_dir: &Path) -> PathBuf {
        match test_dir.strip_prefix(&self.root) {
            Ok(rel) => self.logs.join(rel),
            Err(_) => self.logs.clone(),
        }
    }

    /// Path to the log of `test` from `test_dir`.
    pub fn log_file(&self, test_dir: &Path, test: &str) -> PathBuf {
        self.dir_for(test_dir).join(format!("{test}.log"))
    }

    /// Write one test's log, creating directories as needed.
    pub fn write(&self, test_dir: &Path, test: &str, payload: &[u8]) -> Result<PathBuf, LogError> {
        let path = self.log_file(test_dir, test);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| LogError::CreateDir {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&path, payload).map_err(|e| LogError::Write {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), bytes = payload.len(), "wrote test log");
        Ok(path)
    }
}

/// Log body: stdout, then stderr after a separator when there is any.
pub fn log_payload(stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    let mut payload = stdout.to_vec();
    if !stderr.is_empty() {
        payload.extend_from_slice(b"\nstderr:\n");
        payload.extend_from_slice(stderr);
    }
    payload
}
