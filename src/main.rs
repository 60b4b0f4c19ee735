// src/main.rs
// shiftlog CLI entry point.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use shiftlog::aggregator::Aggregator;
use shiftlog::cache::CacheStore;
use shiftlog::cli::{self, CliArgs, Command};
use shiftlog::config::Config;
use shiftlog::error::DigestError;
use shiftlog::http_client::{HttpClient, RetryPolicy};
use shiftlog::llm;
use shiftlog::platform::SlackHttpClient;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = CliArgs::parse();
    if args.no_color {
        console::set_colors_enabled(false);
    }

    let config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(err) => return cli::print_fatal_error(&err),
    };

    init_logging(&config.logging.level);

    match args.command {
        Command::Configure { reset } => {
            let path = args.config.clone().unwrap_or_else(Config::default_path);
            match cli::run_configure(&path, reset) {
                Ok(()) => cli::EXIT_SUCCESS,
                Err(err) => cli::print_fatal_error(&err),
            }
        }
        Command::Cache { clear, stats } => match cli::run_cache(&config, clear, stats).await {
            Ok(()) => cli::EXIT_SUCCESS,
            Err(err) => cli::print_fatal_error(&err),
        },
        Command::Summarize { timespan, user, skip_cache } => {
            run_summarize_command(&config, &timespan, user.as_deref(), skip_cache).await
        }
    }
}

async fn run_summarize_command(config: &Config, timespan: &str, user: Option<&str>, skip_cache: bool) -> i32 {
    let platform = Arc::new(SlackHttpClient::new(config.slack.user_token.clone()));

    let timezone: chrono_tz::Tz = match config.settings.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            return cli::print_fatal_error(&DigestError::Config(format!(
                "invalid timezone {:?}",
                config.settings.timezone
            )))
        }
    };

    let db_path = if skip_cache { Path::new(":memory:") } else { Path::new(&config.database.path) };
    let cache = match CacheStore::open(db_path, timezone).await {
        Ok(c) => Arc::new(c),
        Err(err) => return cli::print_fatal_error(&err),
    };

    let http = match HttpClient::new(config.slack.rate_limit, RetryPolicy::default()) {
        Ok(h) => Arc::new(h),
        Err(err) => return cli::print_fatal_error(&DigestError::Other(err)),
    };

    let llm = match llm::provider(&config.anthropic) {
        Ok(l) => l,
        Err(err) => return cli::print_fatal_error(&err),
    };

    let aggregator = match Aggregator::from_config(platform, cache.clone(), http, llm, config) {
        Ok(a) => a,
        Err(err) => return cli::print_fatal_error(&err),
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    // §4.B cleanup hooks: a SIGINT/SIGTERM during a run aborts the pipeline
    // rather than leaving it running past process shutdown. `cache`'s pool
    // closes via `Drop` once every `Arc` clone (held here and inside
    // `aggregator`) goes out of scope at the end of this function either way.
    let result = tokio::select! {
        result = cli::run_summarize(&aggregator, timespan, user, now) => result,
        _ = wait_for_termination() => Err(DigestError::Cancelled),
    };

    match result {
        Ok(()) => cli::EXIT_SUCCESS,
        Err(err) => cli::print_fatal_error(&err),
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        info!("shiftlog starting");
    }
}
