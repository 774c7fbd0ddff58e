//! lo Host
//!
//! Command-line front end for the native bridge: loads configuration,
//! resolves libraries and symbols, optionally runs a JSON module graph in a
//! fresh context, and prints a report.

mod json_engine;

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use lo_bridge::{Bridge, BridgeConfig, BridgeError, BridgeReport, ContextId, IsolateOptions};

use crate::json_engine::JsonEngine;

/// lo native bridge host
#[derive(Parser, Debug)]
#[command(name = "lo-host")]
#[command(about = "Probe and drive the lo native bridge", long_about = None)]
struct Args {
    /// Path to a TOML bridge configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Libraries to load, in addition to the configured preload list
    #[arg(short, long = "library")]
    libraries: Vec<String>,

    /// Symbols to resolve, as `library:symbol`
    #[arg(short, long = "symbol")]
    symbols: Vec<String>,

    /// Directory modules are read from (overrides the configuration)
    #[arg(long)]
    module_root: Option<PathBuf>,

    /// Main module to evaluate
    main: Option<String>,

    /// Arguments exposed to the context as `args`
    #[arg(last = true)]
    script_args: Vec<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct SymbolReport {
    library: String,
    symbol: String,
    address: String,
}

#[derive(Debug, Serialize)]
struct Report {
    bridge: BridgeReport,
    symbols: Vec<SymbolReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    main: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_status: Option<i32>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lo_bridge=info,lo_host=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    info!("Starting lo-host v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(root) = &args.module_root {
        config.isolate.module_root = root.clone();
    }

    let bridge = Bridge::start(config, Arc::new(JsonEngine)).context("starting bridge")?;

    for name in &args.libraries {
        let handle = bridge
            .libraries()
            .library(name)
            .with_context(|| format!("loading library {name}"))?;
        debug!(library = %name, file = ?handle.file_name(), "Library ready");
    }

    let mut symbols = Vec::with_capacity(args.symbols.len());
    for spec in &args.symbols {
        let Some((library, symbol)) = spec.split_once(':') else {
            bail!("symbol {spec:?} is not of the form library:symbol");
        };
        let handle = bridge
            .libraries()
            .library(library)
            .with_context(|| format!("loading library {library}"))?;
        let address = handle
            .dlsym(symbol)
            .with_context(|| format!("resolving {symbol} in {library}"))?;
        symbols.push(SymbolReport {
            library: library.to_string(),
            symbol: symbol.to_string(),
            address: format!("{address:#x}"),
        });
    }

    let (main, exit_status) = match &args.main {
        Some(main) => {
            let (namespace, status) = run_main(&bridge, main, &args.script_args)?;
            (Some(namespace), status)
        }
        None => (None, None),
    };

    let report = Report {
        bridge: bridge.report(),
        symbols,
        main,
        exit_status,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    bridge.shutdown();
    Ok(())
}

/// Create a context for `main`, run it to completion and return its exports.
fn run_main(bridge: &Bridge, main: &str, script_args: &[String]) -> Result<(Value, Option<i32>)> {
    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let argv = std::iter::once(main.to_string()).chain(script_args.iter().cloned());

    let mut context = bridge
        .isolates()
        .create(
            IsolateOptions::new(main, "")
                .argv(argv)
                .start_time(start_time)
                .fd(std::io::stdout().as_raw_fd())
                .on_unhandled_rejection(|context: ContextId, error: &BridgeError| {
                    error!(%context, %error, "Unhandled rejection");
                }),
        )
        .context("creating context")?;
    context.start().context("starting context")?;

    while context.pending_tasks() > 0 {
        if context.pump() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    let outcome = context.main_result();
    let status = match &outcome {
        Some(Ok(_)) => 0,
        _ => 1,
    };
    context.exit(status);
    let exit_status = context.exit_status();
    context.destroy();

    match outcome {
        Some(Ok(namespace)) => Ok((serde_json::to_value(namespace.exports())?, exit_status)),
        Some(Err(error)) => {
            warn!(main, %error, "Main module failed");
            Err(error).with_context(|| format!("evaluating {main}"))
        }
        None => bail!("main module {main} did not finish"),
    }
}
