/// Tree runner: walk the source tree, run every discovered test through the
/// supervisor, print the result tree and write one log per test.
use crate::colors::ColorScheme;
use crate::config::HarnessConfig;
use crate::discovery::{Discovery, DiscoveryError};
use crate::logs::{log_payload, LogDir, LogError};
use crate::supervisor::{InvocationError, Supervisor};
use regex::Regex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Errors that abort the whole run.
#[derive(Debug)]
pub enum RunnerError {
    Filter(regex::Error),
    Walk(walkdir::Error),
    Discovery(DiscoveryError),
    Invocation {
        test: String,
        source: InvocationError,
    },
    Log(LogError),
    Output(std::io::Error),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Filter(e) => write!(f, "invalid test filter: {e}"),
            RunnerError::Walk(e) => write!(f, "failed to walk source tree: {e}"),
            RunnerError::Discovery(e) => write!(f, "{e}"),
            RunnerError::Invocation { test, source } => write!(f, "{test}: {source}"),
            RunnerError::Log(e) => write!(f, "{e}"),
            RunnerError::Output(e) => write!(f, "failed to write output: {e}"),
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Filter(e) => Some(e),
            RunnerError::Walk(e) => Some(e),
            RunnerError::Discovery(e) => Some(e),
            RunnerError::Invocation { source, .. } => Some(source),
            RunnerError::Log(e) => Some(e),
            RunnerError::Output(e) => Some(e),
        }
    }
}

impl From<DiscoveryError> for RunnerError {
    fn from(e: DiscoveryError) -> Self {
        RunnerError::Discovery(e)
    }
}

impl From<LogError> for RunnerError {
    fn from(e: LogError) -> Self {
        RunnerError::Log(e)
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(e: std::io::Error) -> Self {
        RunnerError::Output(e)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub passed: u32,
    pub failed: u32,
    pub ignored: u32,
}

/// One discovered test and whether the filter selects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTest {
    pub dir: PathBuf,
    pub name: String,
    pub selected: bool,
}

pub struct TreeRunner<W: Write> {
    config: HarnessConfig,
    discovery: Discovery,
    filter: Regex,
    supervisor: Supervisor,
    logs: LogDir,
    scheme: ColorScheme,
    out: W,
    shown_dirs: HashSet<PathBuf>,
    totals: Totals,
}

impl<W: Write> TreeRunner<W> {
    pub fn new(config: HarnessConfig, scheme: ColorScheme, out: W) -> Result<Self, RunnerError> {
        let filter = Regex::new(&config.run.filter).map_err(RunnerError::Filter)?;
        let discovery = Discovery::new(&config.discovery).map_err(RunnerError::Filter)?;
        let supervisor = Supervisor::from_config(&config, scheme);
        let logs = LogDir::new(&config.run.root, &config.run.logs);
        Ok(Self {
            config,
            discovery,
            filter,
            supervisor,
            logs,
            scheme,
            out,
            shown_dirs: HashSet::new(),
            totals: Totals::default(),
        })
    }

    /// Directories to visit, pre-order, sorted by name, hidden ones skipped.
    fn dirs(&self) -> Result<Vec<(PathBuf, usize)>, RunnerError> {
        let walker = WalkDir::new(self.logs.root())
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

        let mut dirs = Vec::new();
        for entry in walker {
            let entry = entry.map_err(RunnerError::Walk)?;
            if entry.file_type().is_dir() {
                dirs.push((entry.path().to_path_buf(), entry.depth()));
            }
        }
        Ok(dirs)
    }

    fn full_name(dir: &Path, test: &str) -> String {
        format!("{}:{}", dir.display(), test)
    }

    /// Every discovered test in run order, without running anything.
    pub fn plan(&self) -> Result<Vec<PlannedTest>, RunnerError> {
        let mut planned = Vec::new();
        for (dir, _) in self.dirs()? {
            for name in self.discovery.tests_in_dir(&dir)? {
                let selected = self.filter.is_match(&Self::full_name(&dir, &name));
                planned.push(PlannedTest {
                    dir: dir.clone(),
                    name,
                    selected,
                });
            }
        }
        Ok(planned)
    }

    /// Run the whole tree and print the totals line.
    pub async fn run(&mut self) -> Result<Totals, RunnerError> {
        self.totals = Totals::default();
        self.shown_dirs.clear();

        for (dir, depth) in self.dirs()? {
            self.run_dir(&dir, depth).await?;
        }

        let Totals {
            passed,
            failed,
            ignored,
        } = self.totals;
        writeln!(
            self.out,
            "\n{}{}{}",
            self.scheme.pass.paint(format!("Passed: {passed}    ")),
            self.scheme.fail.paint(format!("Failed: {failed}    ")),
            self.scheme.ignore.paint(format!("Ignored: {ignored}    ")),
        )?;
        self.out.flush()?;
        Ok(self.totals)
    }

    async fn run_dir(&mut self, dir: &Path, depth: usize) -> Result<(), RunnerError> {
        let tests = self.discovery.tests_in_dir(dir)?;
        let indent = self.config.run.indent.repeat(depth);
        let runs = self.config.run.runs;

        for test in tests {
            let selected = self.filter.is_match(&Self::full_name(dir, &test));
            if !selected {
                self.totals.ignored += 1;
                if !self.config.run.show_ignored {
                    continue;
                }
            }

            self.show_dir(dir)?;
            write!(self.out, "{indent}{} ", self.scheme.test_name.paint(&test))?;
            self.out.flush()?;

            if !selected {
                writeln!(self.out, "{}", self.scheme.ignore.paint("⊝ Ignored    "))?;
                continue;
            }

            let outcome = self
                .supervisor
                .run_invocation(dir, &test, runs)
                .await
                .map_err(|e| RunnerError::Invocation {
                    test: Self::full_name(dir, &test),
                    source: e,
                })?;

            let log = self
                .logs
                .write(dir, &test, &log_payload(&outcome.stdout, &outcome.stderr))?;
            tracing::debug!(
                log = %log.display(),
                restarts = outcome.restarts,
                stderr_passes = outcome.stderr_counts.passes,
                stderr_fails = outcome.stderr_counts.fails,
                "test log saved"
            );

            if runs > 1 && !outcome.passed() && outcome.passes() > 0 {
                write!(
                    self.out,
                    "{}.{} ",
                    self.scheme.pass.paint(outcome.passes()),
                    self.scheme.fail.paint(outcome.fails())
                )?;
            }

            match &outcome.failure {
                None => {
                    self.totals.passed += 1;
                    writeln!(self.out, "{}", self.scheme.pass.paint("✔ Passed    "))?;
                }
                Some(failure) => {
                    self.totals.failed += 1;
                    tracing::debug!(test = %test, %failure, "test failed");
                    writeln!(self.out, "{}", self.scheme.fail.paint("✘ Failed    "))?;
                }
            }
        }
        Ok(())
    }

    /// Print each not-yet-shown component of `dir` (relative to the root) on its own line.
    fn show_dir(&mut self, dir: &Path) -> Result<(), RunnerError> {
        let rel = dir.strip_prefix(self.logs.root()).unwrap_or(dir);
        let mut prefix = PathBuf::new();
        for (i, part) in rel.components().enumerate() {
            prefix.push(part);
            if self.shown_dirs.insert(prefix.clone()) {
                writeln!(
                    self.out,
                    "{}{}",
                    self.config.run.indent.repeat(i),
                    self.scheme
                        .folder
                        .paint(part.as_os_str().to_string_lossy())
                )?;
            }
        }
        Ok(())
    }
}
