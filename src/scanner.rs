/// Incremental line scanner over a child process output stream.
///
/// Bytes arrive in whatever chunks the pipe hands out. Every completed line is
/// classified against three fixed prefixes so pass/fail counts and the start of
/// the latest repetition are known while the process is still running.
use crate::watchdog::Watchdog;
use std::time::Duration;

const PASS_PREFIX: &[u8] = b"--- PASS:";
const FAIL_PREFIX: &[u8] = b"--- FAIL:";
const RUN_PREFIX: &[u8] = b"=== RUN";

/// Structural meaning of a completed output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Pass,
    Fail,
    RunStart,
}

/// Classify one line (without its terminator). Pass wins over fail, fail over run-start.
pub fn classify(line: &[u8]) -> Option<Marker> {
    if line.starts_with(PASS_PREFIX) {
        Some(Marker::Pass)
    } else if line.starts_with(FAIL_PREFIX) {
        Some(Marker::Fail)
    } else if line.starts_with(RUN_PREFIX) {
        Some(Marker::RunStart)
    } else {
        None
    }
}

/// The synthetic line recorded when the watchdog kills a frozen process.
pub fn freeze_line(timeout: Duration) -> String {
    format!(
        "--- FAIL: Test froze, no output for {}\n",
        humantime::format_duration(timeout)
    )
}

/// Renders cumulative marker progress while a process runs.
pub trait ProgressReporter: Send {
    /// A pass or fail marker was seen; `total` is the running marker count.
    fn marker(&mut self, kind: Marker, total: u64);

    /// Remove whatever the reporter has displayed so far.
    fn clear(&mut self) {}
}

/// Everything one Scanner has accumulated from its stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanState {
    bytes: Vec<u8>,
    line_start: usize,
    last_run_start: usize,
    passes: u64,
    fails: u64,
    markers_seen: u64,
}

impl ScanState {
    #[cfg(test)]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn fails(&self) -> u64 {
        self.fails
    }

    pub fn markers_seen(&self) -> u64 {
        self.markers_seen
    }

    /// Offset of the most recent `=== RUN` line (0 if none was seen).
    #[cfg(test)]
    pub fn last_run_start(&self) -> usize {
        self.last_run_start
    }

    /// True when the stream ended mid-line.
    pub fn in_partial_line(&self) -> bool {
        self.line_start < self.bytes.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Output of the final repetition only: everything from the last run-start line on.
    pub fn into_last_run(mut self) -> Vec<u8> {
        self.bytes.drain(..self.last_run_start);
        self.bytes
    }

    fn end_line(&mut self) -> Option<Marker> {
        let marker = classify(&self.bytes[self.line_start..]);
        match marker {
            Some(Marker::Pass) => {
                self.passes += 1;
                self.markers_seen += 1;
            }
            Some(Marker::Fail) => {
                self.fails += 1;
                self.markers_seen += 1;
            }
            Some(Marker::RunStart) => self.last_run_start = self.line_start,
            None => {}
        }
        debug_assert_eq!(self.markers_seen, self.passes + self.fails);
        marker
    }
}

/// Consumes one stream of a child process and keeps its [`ScanState`] current.
///
/// Each Scanner serves exactly one stream. It is moved into the task reading
/// that stream and handed back when the stream closes, so it is the only
/// mutator of its state.
pub struct Scanner {
    state: ScanState,
    watchdog: Watchdog,
    reporter: Option<Box<dyn ProgressReporter>>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("state", &self.state)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

impl Scanner {
    pub fn new(watchdog: Watchdog) -> Self {
        Self {
            state: ScanState::default(),
            watchdog,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn into_state(self) -> ScanState {
        self.state
    }

    /// Append a chunk in arrival order, classifying every line it completes.
    pub fn write(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.watchdog.reset();

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.state.bytes.extend_from_slice(&rest[..pos]);
            let marker = self.state.end_line();
            self.state.bytes.push(b'\n');
            self.state.line_start = self.state.bytes.len();
            if let Some(kind @ (Marker::Pass | Marker::Fail)) = marker {
                if let Some(reporter) = self.reporter.as_mut() {
                    reporter.marker(kind, self.state.markers_seen);
                }
            }
            rest = &rest[pos + 1..];
        }
        self.state.bytes.extend_from_slice(rest);
        debug_assert!(self.state.line_start <= self.state.bytes.len());
    }

    /// Write a complete line that must be classified on its own, even if the
    /// stream was cut off mid-line.
    pub fn inject_line(&mut self, line: &str) {
        if self.state.in_partial_line() {
            self.write(b"\n");
        }
        self.write(line.as_bytes());
    }

    /// Erase the live progress display, if any.
    pub fn clear_progress(&mut self) {
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn scanner() -> Scanner {
        Scanner::new(Watchdog::new(Duration::from_secs(10)))
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Marker, u64)>>>);

    impl ProgressReporter for Recorder {
        fn marker(&mut self, kind: Marker, total: u64) {
            self.0.lock().unwrap().push((kind, total));
        }

        fn clear(&mut self) {
            self.0.lock().unwrap().clear();
        }
    }

    #[test]
    fn test_classify_priority_and_anchoring() {
        assert_eq!(classify(b"--- PASS: TestX (0.00s)"), Some(Marker::Pass));
        assert_eq!(classify(b"--- FAIL: TestX (0.01s)"), Some(Marker::Fail));
        assert_eq!(classify(b"=== RUN   TestX"), Some(Marker::RunStart));
        assert_eq!(classify(b"    --- PASS: TestX/sub"), None);
        assert_eq!(classify(b"PASS"), None);
        assert_eq!(classify(b"ok  \tpkg\t0.002s"), None);
        assert_eq!(classify(b""), None);
    }

    #[test]
    fn test_two_line_pass_output() {
        let mut s = scanner();
        s.write(b"=== RUN TestX\n--- PASS: TestX (0.00s)\n");
        let state = s.into_state();
        assert_eq!(state.passes(), 1);
        assert_eq!(state.fails(), 0);
        assert_eq!(state.markers_seen(), 1);
        assert_eq!(state.last_run_start(), 0);
    }

    #[test]
    fn test_unterminated_line_is_not_classified() {
        let mut s = scanner();
        s.write(b"--- PASS: TestX");
        assert_eq!(s.state().passes(), 0);
        assert!(s.state().in_partial_line());
        s.write(b" (0.00s)\n");
        assert_eq!(s.state().passes(), 1);
        assert!(!s.state().in_partial_line());
    }

    #[test]
    fn test_last_run_start_tracks_latest_repetition() {
        let mut s = scanner();
        let first = "=== RUN TestX\n--- PASS: TestX (0.00s)\n";
        s.write(first.as_bytes());
        s.write(b"=== RUN TestX\nlog line\n--- PASS: TestX (0.00s)\nPASS\n");
        let state = s.into_state();
        assert_eq!(state.last_run_start(), first.len());
        assert_eq!(
            state.into_last_run(),
            b"=== RUN TestX\nlog line\n--- PASS: TestX (0.00s)\nPASS\n".to_vec()
        );
    }

    #[test]
    fn test_into_last_run_without_run_line_keeps_everything() {
        let mut s = scanner();
        s.write(b"hello\nworld\n");
        assert_eq!(s.into_state().into_last_run(), b"hello\nworld\n".to_vec());
    }

    #[test]
    fn test_injected_freeze_line_counts_as_fail() {
        let mut natural = scanner();
        natural.write(b"--- FAIL: TestX (0.00s)\n");

        let mut injected = scanner();
        injected.inject_line(&freeze_line(Duration::from_secs(10)));

        assert_eq!(natural.state().fails(), injected.state().fails());
        assert_eq!(injected.state().markers_seen(), 1);
        let text = String::from_utf8(injected.into_state().into_bytes()).unwrap();
        assert!(text.starts_with("--- FAIL:"));
        assert!(text.contains("10s"));
    }

    #[test]
    fn test_injected_line_after_partial_output_starts_new_line() {
        let mut s = scanner();
        s.write(b"=== RUN TestX\nhalf a li");
        s.inject_line(&freeze_line(Duration::from_millis(200)));
        assert_eq!(s.state().fails(), 1);
        let text = String::from_utf8(s.into_state().into_bytes()).unwrap();
        assert!(text.contains("half a li\n--- FAIL:"));
    }

    #[test]
    fn test_reporter_sees_running_total() {
        let rec = Recorder::default();
        let mut s = scanner().with_reporter(Box::new(rec.clone()));
        s.write(b"=== RUN T\n--- PASS: T\n=== RUN T\n--- FAIL: T\n--- PASS: T\n");
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec![(Marker::Pass, 1), (Marker::Fail, 2), (Marker::Pass, 3)]
        );
        s.clear_progress();
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_write_resets_watchdog() {
        let watchdog = Watchdog::new(Duration::from_secs(60));
        let before = watchdog.deadline_ms();
        std::thread::sleep(Duration::from_millis(5));
        let mut s = Scanner::new(watchdog.clone());
        s.write(b"x");
        assert!(watchdog.deadline_ms() > before);
    }

    #[test]
    fn test_empty_chunk_changes_nothing() {
        let watchdog = Watchdog::new(Duration::from_secs(60));
        let before = watchdog.deadline_ms();
        std::thread::sleep(Duration::from_millis(5));
        let mut s = Scanner::new(watchdog.clone());
        s.write(b"");
        assert_eq!(watchdog.deadline_ms(), before);
        assert!(s.state().bytes().is_empty());
    }

    fn sample_output(passes: usize, fails: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..passes + fails {
            out.extend_from_slice(format!("=== RUN TestX\nnoise {i}\n").as_bytes());
            if i < passes {
                out.extend_from_slice(b"--- PASS: TestX (0.00s)\n");
            } else {
                out.extend_from_slice(b"--- FAIL: TestX (0.00s)\n");
            }
        }
        out.extend_from_slice(b"FAIL\n");
        out
    }

    proptest! {
        #[test]
        fn prop_counts_do_not_depend_on_chunking(
            passes in 0usize..6,
            fails in 0usize..6,
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let output = sample_output(passes, fails);

            let mut whole = scanner();
            whole.write(&output);

            let mut points: Vec<usize> = cuts.iter().map(|c| c.index(output.len() + 1)).collect();
            points.sort_unstable();
            let mut chunked = scanner();
            let mut prev = 0;
            for p in points {
                chunked.write(&output[prev..p]);
                prev = p;
            }
            chunked.write(&output[prev..]);

            prop_assert_eq!(chunked.state().passes(), passes as u64);
            prop_assert_eq!(chunked.state().fails(), fails as u64);
            prop_assert_eq!(chunked.state(), whole.state());
        }
    }
}
