mod blocking;
mod client;
mod config;
mod fanout;
mod serve;
mod watchdog;

use clap::Parser;
use config::AppConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use watchdog::Watchdog;

/// Async HTTP service that fans out sub-requests on a multi-threaded runtime
/// guarded by a blocking-call watchdog.
#[derive(Parser, Debug)]
#[command(name = "blockwatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "blockwatch.toml")]
    config: PathBuf,

    /// Listening port (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// Run without blocking-call detection
    #[arg(long)]
    disable_watchdog: bool,

    /// Skip the startup self-test of the watchdog
    #[arg(long)]
    skip_self_test: bool,

    /// Validate config and print resolved settings, don't serve
    #[arg(long)]
    dry_run: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "blockwatch=debug,tower_http=debug"
    } else {
        "blockwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_thread_names(true)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), serve::ServeError> {
    let config = resolve_config(&cli)?;

    if cli.dry_run {
        println!("blockwatch v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        println!("Dry run mode, config validated, not serving.");
        return Ok(());
    }

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    let thread_counter = Arc::new(AtomicUsize::new(0));
    runtime_builder.enable_all().thread_name_fn(move || {
        let n = thread_counter.fetch_add(1, Ordering::Relaxed);
        format!("parallel-{n}")
    });
    if config.runtime.worker_threads > 0 {
        runtime_builder.worker_threads(config.runtime.worker_threads);
    }

    // The watchdog hooks must be registered before any runtime thread exists.
    let watchdog = if config.watchdog.enabled {
        Some(install_watchdog(&config, &mut runtime_builder)?)
    } else {
        tracing::info!("blocking-call watchdog disabled");
        None
    };

    let runtime = runtime_builder.build()?;

    if let Some(watchdog) = &watchdog {
        if config.watchdog.self_test {
            watchdog.self_test(runtime.handle());
        }
    }

    runtime.block_on(serve::run(
        &config.server.bind,
        config.server.port,
        config.fanout.clone(),
        watchdog,
    ))
}

/// Config file, then environment, then CLI flags.
fn resolve_config(cli: &Cli) -> Result<AppConfig, config::ConfigError> {
    let mut config = AppConfig::load(&cli.config)?;
    config.apply_env()?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.disable_watchdog {
        config.watchdog.enabled = false;
    }
    if cli.skip_self_test {
        config.watchdog.self_test = false;
    }

    config.validate()?;
    Ok(config)
}

fn install_watchdog(
    config: &AppConfig,
    runtime: &mut tokio::runtime::Builder,
) -> Result<Watchdog, watchdog::WatchdogError> {
    let long_poll = match config.watchdog.long_poll_ms {
        0 => None,
        ms => Some(std::time::Duration::from_millis(ms)),
    };
    config
        .watchdog
        .allow
        .iter()
        .fold(Watchdog::builder(), |builder, site| {
            builder.allow_blocking_calls_inside(site.clone())
        })
        .long_poll_threshold(long_poll)
        .install(runtime)
}
