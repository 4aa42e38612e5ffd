/// Supervised runner invocation: start the toolchain test runner for one test,
/// scan both output streams, kill and restart on freeze, classify the outcome.
use crate::budget::{BudgetDecision, RunBudget};
use crate::colors::ColorScheme;
use crate::config::{HarnessConfig, RunnerConfig};
use crate::progress::TerminalProgress;
use crate::scanner::{freeze_line, Scanner};
use crate::watchdog::Watchdog;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::{JoinError, JoinHandle};

const READ_CHUNK: usize = 8 * 1024;

/// Why a logical test counts as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFailure {
    /// The runner went silent and the run budget ran out.
    Freeze { timeout: Duration },
    /// The runner exited unsuccessfully (`None` when killed by a signal).
    Exit { code: Option<i32> },
    /// At least one fail marker appeared on stdout.
    Markers { fails: u64 },
}

impl std::fmt::Display for TestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestFailure::Freeze { timeout } => write!(
                f,
                "test froze: no output for {}",
                humantime::format_duration(*timeout)
            ),
            TestFailure::Exit { code: Some(code) } => {
                write!(f, "test runner exited with status {code}")
            }
            TestFailure::Exit { code: None } => write!(f, "test runner was killed by a signal"),
            TestFailure::Markers { fails } => write!(f, "test failed ({fails} failing runs)"),
        }
    }
}

impl std::error::Error for TestFailure {}

/// Pass/fail marker totals of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerCounts {
    pub passes: u64,
    pub fails: u64,
}

/// Result of one logical test, across every restart.
#[derive(Debug)]
pub struct TestOutcome {
    /// Captured stdout; only the last repetition on a pass unless all logs are kept.
    pub stdout: Vec<u8>,
    /// Full captured stderr.
    pub stderr: Vec<u8>,
    /// `None` when the test passed.
    pub failure: Option<TestFailure>,
    pub stdout_counts: MarkerCounts,
    pub stderr_counts: MarkerCounts,
    /// Freeze restarts that were needed.
    pub restarts: u32,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }

    pub fn passes(&self) -> u64 {
        self.stdout_counts.passes
    }

    pub fn fails(&self) -> u64 {
        self.stdout_counts.fails
    }
}

/// Errors that abort an invocation instead of failing the test.
#[derive(Debug)]
pub enum InvocationError {
    /// Failed to start the runner subprocess.
    Spawn {
        command: String,
        dir: PathBuf,
        source: std::io::Error,
    },
    /// Failed to read from child stdout/stderr.
    Pipe { source: std::io::Error },
    /// Failed to wait for the child.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationError::Spawn {
                command,
                dir,
                source,
            } => write!(
                f,
                "failed to spawn test runner '{}' in {}: {}",
                command,
                dir.display(),
                source
            ),
            InvocationError::Pipe { source } => {
                write!(f, "I/O error reading test runner output: {}", source)
            }
            InvocationError::Wait { source } => {
                write!(f, "failed to wait for test runner: {}", source)
            }
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InvocationError::Spawn { source, .. } => Some(source),
            InvocationError::Pipe { source } => Some(source),
            InvocationError::Wait { source } => Some(source),
        }
    }
}

/// Build the command arguments for one start of the runner.
fn build_args(runner: &RunnerConfig, count: u32, test: &str) -> Vec<String> {
    let count = count.to_string();
    runner
        .args
        .iter()
        .map(|arg| arg.replace("{count}", &count).replace("{test}", test))
        .collect()
}

struct Streams {
    stdout: Scanner,
    stderr: Scanner,
}

/// A started runner and the tasks scanning its output.
struct Attempt {
    child: Child,
    /// Process group of the runner; still valid after the leader is reaped.
    pgid: Option<Pid>,
    stdout: JoinHandle<std::io::Result<Scanner>>,
    stderr: JoinHandle<std::io::Result<Scanner>>,
}

impl Attempt {
    /// Wait for both streams to close and take the scanners back.
    ///
    /// Leftover processes of the group can hold the pipes open after the
    /// runner exits, so the watchdog keeps running here. When it fires the
    /// group is killed and `froze` is reported. Whatever is left of the
    /// group is killed once both streams are closed.
    async fn settle(
        mut self,
        watchdog: &Watchdog,
        mut froze: bool,
    ) -> Result<Settled, InvocationError> {
        let mut stdout = None;
        let mut stderr = None;
        while stdout.is_none() || stderr.is_none() {
            let event = tokio::select! {
                r = &mut self.stdout, if stdout.is_none() => Drain::Stdout(r),
                r = &mut self.stderr, if stderr.is_none() => Drain::Stderr(r),
                _ = watchdog.expired(), if !froze => Drain::Froze,
            };
            match event {
                Drain::Stdout(r) => stdout = Some(joined(r)?),
                Drain::Stderr(r) => stderr = Some(joined(r)?),
                Drain::Froze => {
                    tracing::warn!(
                        pgid = ?self.pgid,
                        "runner output stayed open and went silent, killing process group"
                    );
                    froze = true;
                    kill_group(self.pgid, &mut self.child);
                }
            }
        }
        reap_orphans(self.pgid);

        match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => Ok(Settled {
                streams: Streams { stdout, stderr },
                froze,
            }),
            _ => Err(InvocationError::Pipe {
                source: std::io::Error::other("output reader ended without a result"),
            }),
        }
    }
}

type ReaderResult = Result<std::io::Result<Scanner>, JoinError>;

enum Drain {
    Stdout(ReaderResult),
    Stderr(ReaderResult),
    Froze,
}

struct Settled {
    streams: Streams,
    froze: bool,
}

/// Freeze recovery as an explicit state machine.
enum Phase {
    /// About to (re)start the runner for `remaining` repetitions.
    Restarting { remaining: u32, streams: Streams },
    Running(Attempt),
    /// The runner exited; its output may still be open.
    Exited { status: ExitStatus, attempt: Attempt },
    Frozen(Attempt),
    /// The runner group was killed for silence; the budget decides what next.
    Killed(Streams),
    Exhausted(Streams),
    Done { status: ExitStatus, streams: Streams },
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Froze,
}

/// Runs one logical test at a time, restarting it when it freezes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    runner: RunnerConfig,
    freeze_timeout: Duration,
    max_restarts: u32,
    save_all_logs: bool,
    scheme: ColorScheme,
    live_progress: bool,
}

impl Supervisor {
    pub fn new(runner: RunnerConfig, freeze_timeout: Duration) -> Self {
        Self {
            runner,
            freeze_timeout,
            max_restarts: 3,
            save_all_logs: false,
            scheme: ColorScheme::plain(),
            live_progress: false,
        }
    }

    pub fn from_config(config: &HarnessConfig, scheme: ColorScheme) -> Self {
        Self::new(config.runner.clone(), config.watchdog.freeze_timeout)
            .max_restarts(config.watchdog.max_restarts)
            .save_all_logs(config.run.save_all_logs)
            .live_progress(scheme)
    }

    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn save_all_logs(mut self, keep: bool) -> Self {
        self.save_all_logs = keep;
        self
    }

    /// Print the running marker count on stdout when more than one repetition is asked for.
    pub fn live_progress(mut self, scheme: ColorScheme) -> Self {
        self.scheme = scheme;
        self.live_progress = true;
        self
    }

    /// Run `test` in `dir` until `repetitions` runs are accounted for or the test is abandoned.
    ///
    /// Expected failures (fail markers, bad exit, exhausted freeze budget) come
    /// back as `Ok` with [`TestOutcome::failure`] set; `Err` means the runner
    /// could not be driven at all.
    pub async fn run_invocation(
        &self,
        dir: &Path,
        test: &str,
        repetitions: u32,
    ) -> Result<TestOutcome, InvocationError> {
        let repetitions = repetitions.max(1);
        let watchdog = Watchdog::new(self.freeze_timeout);
        let mut stdout = Scanner::new(watchdog.clone());
        if self.live_progress && repetitions > 1 {
            stdout = stdout.with_reporter(Box::new(TerminalProgress::stdout(self.scheme)));
        }
        let streams = Streams {
            stdout,
            stderr: Scanner::new(watchdog.clone()),
        };
        let mut budget = RunBudget::new(repetitions, self.max_restarts);

        let mut phase = Phase::Restarting {
            remaining: budget.remaining(),
            streams,
        };

        let (mut streams, failure) = loop {
            phase = match phase {
                Phase::Restarting { remaining, streams } => {
                    watchdog.rearm();
                    Phase::Running(self.start(dir, test, remaining, streams)?)
                }
                Phase::Running(mut attempt) => {
                    let event = tokio::select! {
                        status = attempt.child.wait() => Event::Exited(status),
                        _ = watchdog.expired() => Event::Froze,
                    };
                    match event {
                        Event::Exited(status) => Phase::Exited {
                            status: status.map_err(|e| InvocationError::Wait { source: e })?,
                            attempt,
                        },
                        Event::Froze => Phase::Frozen(attempt),
                    }
                }
                Phase::Exited { status, attempt } => {
                    let Settled { streams, froze } = attempt.settle(&watchdog, false).await?;
                    if froze {
                        Phase::Killed(streams)
                    } else {
                        Phase::Done { status, streams }
                    }
                }
                Phase::Frozen(mut attempt) => {
                    kill_group(attempt.pgid, &mut attempt.child);
                    if let Err(e) = attempt.child.wait().await {
                        tracing::warn!(error = %e, "failed to reap killed test runner");
                    }
                    Phase::Killed(attempt.settle(&watchdog, true).await?.streams)
                }
                Phase::Killed(mut streams) => {
                    streams.stdout.inject_line(&freeze_line(watchdog.timeout()));

                    let passes = streams.stdout.state().passes();
                    tracing::info!(
                        test,
                        timeout = %humantime::format_duration(self.freeze_timeout),
                        passes,
                        "test runner froze, killed"
                    );
                    match budget.after_freeze(passes) {
                        BudgetDecision::Restart { remaining } => {
                            Phase::Restarting { remaining, streams }
                        }
                        BudgetDecision::Exhausted => Phase::Exhausted(streams),
                    }
                }
                Phase::Exhausted(streams) => {
                    break (
                        streams,
                        Some(TestFailure::Freeze {
                            timeout: self.freeze_timeout,
                        }),
                    );
                }
                Phase::Done { status, streams } => {
                    let fails = streams.stdout.state().fails();
                    let failure = if !status.success() {
                        Some(TestFailure::Exit {
                            code: status.code(),
                        })
                    } else if fails > 0 {
                        Some(TestFailure::Markers { fails })
                    } else {
                        None
                    };
                    break (streams, failure);
                }
            };
        };

        streams.stdout.clear_progress();
        let stdout_state = streams.stdout.into_state();
        let stderr_state = streams.stderr.into_state();
        let stdout_counts = MarkerCounts {
            passes: stdout_state.passes(),
            fails: stdout_state.fails(),
        };
        let stderr_counts = MarkerCounts {
            passes: stderr_state.passes(),
            fails: stderr_state.fails(),
        };

        tracing::info!(
            test,
            passes = stdout_counts.passes,
            fails = stdout_counts.fails,
            markers = stdout_state.markers_seen(),
            restarts = budget.restarts(),
            failure = ?failure,
            "test invocation finished"
        );

        let stdout = if failure.is_none() && !self.save_all_logs {
            stdout_state.into_last_run()
        } else {
            stdout_state.into_bytes()
        };

        Ok(TestOutcome {
            stdout,
            stderr: stderr_state.into_bytes(),
            failure,
            stdout_counts,
            stderr_counts,
            restarts: budget.restarts(),
        })
    }

    /// Spawn the runner in its own process group with both streams piped to scanners.
    fn start(
        &self,
        dir: &Path,
        test: &str,
        count: u32,
        streams: Streams,
    ) -> Result<Attempt, InvocationError> {
        let args = build_args(&self.runner, count, test);
        tracing::info!(
            command = %self.runner.command,
            args = ?args,
            dir = %dir.display(),
            count,
            "spawning test runner"
        );

        let mut child = Command::new(&self.runner.command)
            .args(&args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvocationError::Spawn {
                command: self.runner.command.clone(),
                dir: dir.to_path_buf(),
                source: e,
            })?;

        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);
        tracing::debug!(pgid = ?pgid, "test runner started");

        let stdout_pipe = child.stdout.take().ok_or_else(|| InvocationError::Pipe {
            source: std::io::Error::other("stdout was not captured"),
        })?;
        let stderr_pipe = child.stderr.take().ok_or_else(|| InvocationError::Pipe {
            source: std::io::Error::other("stderr was not captured"),
        })?;

        Ok(Attempt {
            child,
            pgid,
            stdout: spawn_reader(stdout_pipe, streams.stdout),
            stderr: spawn_reader(stderr_pipe, streams.stderr),
        })
    }
}

/// Feed one pipe into its scanner until EOF, then hand the scanner back.
fn spawn_reader<R>(mut pipe: R, mut scanner: Scanner) -> JoinHandle<std::io::Result<Scanner>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = pipe.read(&mut buf).await?;
            if n == 0 {
                return Ok(scanner);
            }
            scanner.write(&buf[..n]);
        }
    })
}

fn joined(result: ReaderResult) -> Result<Scanner, InvocationError> {
    match result {
        Ok(Ok(scanner)) => Ok(scanner),
        Ok(Err(e)) => Err(InvocationError::Pipe { source: e }),
        Err(e) => Err(InvocationError::Pipe {
            source: std::io::Error::other(e),
        }),
    }
}

/// SIGKILL the runner's whole process group; fall back to the child alone.
fn kill_group(pgid: Option<Pid>, child: &mut Child) {
    if let Some(pgid) = pgid {
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => return,
            Err(Errno::ESRCH) => return,
            Err(e) => tracing::warn!(%pgid, error = %e, "killpg failed, killing runner only"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill test runner");
    }
}

/// Kill processes the runner left behind in its group.
fn reap_orphans(pgid: Option<Pid>) {
    let Some(pgid) = pgid else { return };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => tracing::debug!(%pgid, "killed leftover runner processes"),
        Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(%pgid, error = %e, "failed to kill leftover runner processes"),
    }
}
