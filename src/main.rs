mod budget;
mod colors;
mod config;
mod discovery;
mod logs;
mod progress;
mod runner;
mod scanner;
mod supervisor;
mod watchdog;

use clap::Parser;
use colors::ColorScheme;
use config::HarnessConfig;
use runner::TreeRunner;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Walks a source tree and runs every discovered test as its own supervised
/// `go test` process: repeated runs, freeze detection with restart, one log per test.
#[derive(Parser, Debug)]
#[command(name = "tree-tester", version, about)]
pub struct Cli {
    /// Root of the source tree (overrides config)
    #[arg(value_name = "ROOT")]
    root: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, default_value = "tree-tester.toml")]
    config: PathBuf,

    /// Regexp filter over `<dir>:<test>`
    #[arg(long)]
    filter: Option<String>,

    /// Show ignored tests
    #[arg(long)]
    ignored: bool,

    /// Test runs count
    #[arg(long)]
    runs: Option<u32>,

    /// Always save all logs. Else last passed run or all of a failure
    #[arg(long)]
    allpassed: bool,

    /// Path for logs of test results
    #[arg(long)]
    logspath: Option<PathBuf>,

    /// Mark a test failed if it prints nothing for this long (e.g. 10s, 1m)
    #[arg(long, value_parser = humantime::parse_duration)]
    freeze_timeout: Option<Duration>,

    /// Max freeze restarts in a row without a new pass
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Print resolved settings and discovered tests, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (spawns, watchdog firings, restart decisions)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the file config.
    fn apply(&self, cfg: &mut HarnessConfig) {
        if let Some(root) = &self.root {
            cfg.run.root = root.clone();
        }
        if let Some(filter) = &self.filter {
            cfg.run.filter = filter.clone();
        }
        if self.ignored {
            cfg.run.show_ignored = true;
        }
        if let Some(runs) = self.runs {
            cfg.run.runs = runs;
        }
        if self.allpassed {
            cfg.run.save_all_logs = true;
        }
        if let Some(logs) = &self.logspath {
            cfg.run.logs = logs.clone();
        }
        if let Some(timeout) = self.freeze_timeout {
            cfg.watchdog.freeze_timeout = timeout;
        }
        if let Some(max) = self.max_restarts {
            cfg.watchdog.max_restarts = max;
        }
        cfg.normalize();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "tree_tester=debug"
    } else {
        "tree_tester=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut cfg = HarnessConfig::load(&cli.config)?;
    cli.apply(&mut cfg);
    cfg.resolve_paths(&std::env::current_dir()?);

    let scheme = ColorScheme::detect();
    let mut runner = TreeRunner::new(cfg.clone(), scheme, std::io::stdout())?;

    if cli.dry_run {
        println!("{}", toml::to_string_pretty(&cfg)?);
        for test in runner.plan()? {
            let mark = if test.selected { " " } else { "-" };
            println!("{mark} {}:{}", test.dir.display(), test.name);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let totals = runner.run().await?;
    tracing::info!(
        passed = totals.passed,
        failed = totals.failed,
        ignored = totals.ignored,
        "run complete"
    );
    if totals.failed > 0 {
        Ok(ExitCode::from(1))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
