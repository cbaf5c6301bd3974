//! TestPilot CLI
//!
//! `run` executes a suite against the configured hosts; `mock` starts the
//! embedded replay server for hermetic runs.
//!
//! Exit codes: 0 all passed, 1 any step failed, 2 configuration error,
//! 3 input error.

mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use testpilot_common::Error;
use testpilot_engine::config::Config;
use testpilot_engine::executor::RunOptions;
use testpilot_engine::failures::FailureLog;
use testpilot_engine::logging::{failure_log_path, LoggingConfig};
use testpilot_engine::{all_passed, report, suite, Orchestrator};

use output::{print_summary, CompositeSink, ConsoleSink, DisplayMode, FailureLogSink};

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_INPUT: i32 = 3;

#[derive(Parser)]
#[command(name = "testpilot", author, version, about = "Workflow-aware test orchestration for HTTP services and 5G network functions", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a test suite
    Run(RunArgs),
    /// Start the embedded mock server
    Mock(MockArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Lenient validation (default)
    Otp,
    /// Strict validation with an audit trail
    Audit,
    /// Validate configuration and suite, then exit
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExecutionMode {
    Production,
    Mock,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Suite document to execute
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Validation mode
    #[arg(short = 'm', long = "mode", value_enum, default_value = "otp")]
    mode: Mode,

    /// Host configuration file
    #[arg(short = 'c', long = "config", default_value = "config/hosts.json")]
    config: PathBuf,

    /// Comma-separated sheet selection
    #[arg(short = 's', long = "sheets", value_delimiter = ',')]
    sheets: Option<Vec<String>>,

    /// Single test name to run
    #[arg(short = 't', long = "test")]
    test_name: Option<String>,

    /// Build and display commands without executing
    #[arg(long)]
    dry_run: bool,

    #[arg(long = "execution-mode", value_enum, default_value = "production")]
    execution_mode: ExecutionMode,

    /// Mock server base URL (mock execution mode)
    #[arg(long, default_value = "http://127.0.0.1:8081")]
    mock_server_url: String,

    /// Requests-per-second override for every host
    #[arg(long = "rate-limit")]
    rate_limit: Option<f64>,

    /// Fixed pause between steps, seconds
    #[arg(long = "step-delay")]
    step_delay: Option<f64>,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL
    #[arg(long = "log-level")]
    log_level: Option<String>,

    #[arg(long = "log-dir", default_value = "logs")]
    log_dir: PathBuf,

    /// Console output only
    #[arg(long = "no-file-logging")]
    no_file_logging: bool,

    #[arg(long = "display-mode", value_enum, default_value = "full")]
    display_mode: DisplayMode,

    /// Abort a flow on its first failing step
    #[arg(long = "stop-on-failure")]
    stop_on_failure: bool,
}

#[derive(Parser, Debug)]
struct MockArgs {
    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 8081)]
    port: u16,

    /// Recorded responses file
    #[arg(short = 'd', long = "data-file")]
    data_file: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run(args) => run_command(args).await.unwrap_or_else(exit_code_for),
        Commands::Mock(args) => mock_command(args).await.unwrap_or_else(exit_code_for),
    };
    std::process::exit(code);
}

fn exit_code_for(err: anyhow::Error) -> i32 {
    error!("{err:#}");
    eprintln!("{err:#}");
    match err.downcast_ref::<Error>() {
        Some(Error::Config(_)) => EXIT_CONFIG,
        Some(Error::Input(_)) => EXIT_INPUT,
        _ => EXIT_FAILED,
    }
}

async fn run_command(args: RunArgs) -> Result<i32> {
    let logging = LoggingConfig {
        level: args.log_level.clone(),
        log_dir: args.log_dir.clone(),
        file_logging: !args.no_file_logging,
    };
    let _log_guard = logging.init()?;

    let config = Config::load(&args.config)?;
    info!(config = %args.config.display(), "host configuration loaded");

    let flows = suite::load_suite(&args.input)?;
    let flows = suite::filter_flows(
        flows,
        args.sheets.as_deref(),
        args.test_name.as_deref(),
    );
    if flows.is_empty() {
        return Err(Error::input("Selection matched no flows").into());
    }
    suite::validate_references(&flows, &config)?;

    if matches!(args.mode, Mode::Config) {
        println!("Configuration OK: {} hosts, {} flows", config.hosts.len(), flows.len());
        return Ok(EXIT_OK);
    }

    let options = RunOptions {
        dry_run: args.dry_run,
        audit: matches!(args.mode, Mode::Audit),
        rate_limit: args.rate_limit,
        step_delay: args.step_delay,
        mock_server_url: matches!(args.execution_mode, ExecutionMode::Mock)
            .then(|| args.mock_server_url.clone()),
        stop_on_failure: args.stop_on_failure,
        ..Default::default()
    };

    let console: Arc<dyn testpilot_engine::ResultSink> =
        Arc::new(ConsoleSink::new(args.display_mode));
    let mut sinks = CompositeSink::new(vec![console]);
    if !args.no_file_logging {
        std::fs::create_dir_all(&args.log_dir)?;
        let failure_log = FailureLog::create(&failure_log_path(&args.log_dir))?;
        sinks.push(Arc::new(FailureLogSink::new(failure_log)));
    }

    let orchestrator = Orchestrator::with_sink(config, options, Arc::new(sinks));
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let results = orchestrator.run(flows).await?;
    print_summary(&results, orchestrator.audit_records().as_deref());

    if !args.no_file_logging {
        let path = report::write_json_results(std::path::Path::new("test_results"), &results)?;
        info!(path = %path.display(), "results written");
    }

    Ok(if all_passed(&results) {
        EXIT_OK
    } else {
        EXIT_FAILED
    })
}

async fn mock_command(args: MockArgs) -> Result<i32> {
    let logging = LoggingConfig {
        level: None,
        log_dir: PathBuf::from("logs"),
        file_logging: false,
    };
    let _log_guard = logging.init()?;

    let data = testpilot_mock::MockData::load(&args.data_file)?;
    println!("Mock server on port {} serving {:?}", args.port, args.data_file);
    testpilot_mock::serve(args.port, data).await?;
    Ok(EXIT_OK)
}
