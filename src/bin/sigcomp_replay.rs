//! Signal Composer event replay
//!
//! Loads a configuration document, feeds it a JSON-lines file of provider
//! events and prints the resulting signal values.
//!
//! Each input line is `{"channel": "<api>/<event>", "payload": {...}}`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use signal_composer::{Composer, ComposerConfig, ConfigDocument, PluginRegistry, ValueOptions};

/// Replay configuration
struct Config {
    /// Signal configuration document
    config_path: PathBuf,
    /// JSON-lines event file; stdin when absent
    events_path: Option<PathBuf>,
    /// Signals the replay subscribes to and echoes
    watch: Vec<String>,
    /// Statistics window in seconds for the final report
    window: Option<u64>,
}

fn usage() {
    println!("sigcomp-replay - replay provider events through a signal composer");
    println!();
    println!("USAGE:");
    println!("    sigcomp-replay --config <FILE> [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>       Signal configuration document");
    println!("    -e, --events <FILE>       JSON-lines event file [default: stdin]");
    println!("    -w, --watch <SIGNAL>      Print pushes for this signal (repeatable)");
    println!("        --window <SECS>       Report average/min/max over this window");
    println!("    -h, --help                Print help information");
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    args.get(i + 1).cloned().unwrap_or_else(|| {
        eprintln!("error: {flag} requires a value");
        std::process::exit(1);
    })
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut events_path = None;
    let mut watch = Vec::new();
    let mut window = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => config_path = Some(PathBuf::from(value_of(&args, i, "--config"))),
            "--events" | "-e" => events_path = Some(PathBuf::from(value_of(&args, i, "--events"))),
            "--watch" | "-w" => watch.push(value_of(&args, i, "--watch")),
            "--window" => {
                let raw = value_of(&args, i, "--window");
                window = Some(raw.parse().unwrap_or_else(|_| {
                    eprintln!("error: invalid window: {raw}");
                    std::process::exit(1);
                }));
            }
            "--help" | "-h" => {
                usage();
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
        i += 2;
    }

    let Some(config_path) = config_path else {
        eprintln!("error: --config is required");
        std::process::exit(1);
    };
    Config {
        config_path,
        events_path,
        watch,
        window,
    }
}

#[derive(Deserialize)]
struct ReplayEvent {
    channel: String,
    #[serde(default)]
    payload: serde_json::Value,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Signal Composer replay v{}", env!("CARGO_PKG_VERSION"));

    let document = ConfigDocument::from_path(&config.config_path)?;
    let composer = Composer::new(ComposerConfig::default(), Arc::new(PluginRegistry::with_builtin()));
    let report = composer.load_config(&document)?;
    info!(
        signals = report.signals_loaded,
        rejected = report.signals_rejected,
        "configuration {} loaded",
        config.config_path.display()
    );

    let (session, stream) = composer.open_session()?;
    if !config.watch.is_empty() {
        let names: Vec<&str> = config.watch.iter().map(String::as_str).collect();
        composer.subscribe(session, &names)?;
    }

    let reader: Box<dyn BufRead> = match &config.events_path {
        Some(path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut replayed = 0_u64;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ReplayEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(err) => {
                warn!(line = lineno + 1, error = %err, "skipping malformed event");
                continue;
            }
        };
        if let Err(err) = composer.dispatch_event(&event.channel, &event.payload) {
            warn!(line = lineno + 1, channel = %event.channel, error = %err, "event not applied");
        }
        replayed += 1;

        while let Ok(push) = stream.recv_timeout(Duration::ZERO) {
            println!("{}", serde_json::to_string(&push)?);
        }
    }
    info!(replayed, "replay finished");

    let options = config.window.map(|w| ValueOptions {
        average: Some(w),
        minimum: Some(w),
        maximum: Some(w),
        last: Some(w),
    });
    for reading in composer.get_signal_value("*", options.as_ref()) {
        println!("{}", serde_json::to_string(&reading)?);
    }

    composer.teardown();
    Ok(())
}
