//! `posture-cli` – interactive posture shell.
//!
//! This binary:
//!
//! 1. Loads `~/.posture/config.toml`, writing a default one on first run.
//! 2. Loads the posture library (`--postures`, or `postures_path` from the
//!    config) and merges any `--merge` files into it.
//!    With `--save <path>` the merged library is written out and the binary
//!    exits.
//! 3. Builds a [`Dispatcher`] over the simulated group transport.
//! 4. Drops the user into an **interactive REPL** (or runs a single `--run`
//!    request).
//! 5. Intercepts **Ctrl-C** to leave the REPL and any pending `/wait`.

mod cli;
mod config;
mod repl;

use clap::Parser;
use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use posture_hal::{ClientFactory, SimClientFactory};
use posture_library::{LibraryError, MergeStrategy, PostureLibrary};
use posture_runtime::{Dispatcher, init_tracing};

fn main() {
    let cli = cli::Cli::parse();

    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters (default "info"); POSTURE_LOG_FORMAT=json switches to
    // JSON lines.  User-facing output still uses println!.
    let tracing_guard = init_tracing("posture");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_default_config(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    cli.apply_to(&mut cfg);

    // ── Posture library ───────────────────────────────────────────────────
    let library = match load_library(&cfg, &cli) {
        Ok(library) => library,
        Err(e) => {
            println!("{}: {}", "Posture library error".red(), e);
            std::process::exit(1);
        }
    };
    if library.is_empty() {
        warn!("posture library is empty; every dispatch will be rejected");
    }

    // ── Merge-only mode ───────────────────────────────────────────────────
    if let Some(path) = &cli.save {
        let code = match library.save(path) {
            Ok(()) => {
                println!(
                    "  {} {} posture(s) written to {}",
                    "✓".green().bold(),
                    library.len(),
                    path.display().to_string().bold()
                );
                0
            }
            Err(e) => {
                println!("{}: {}", "Failed to save posture library".red(), e);
                1
            }
        };
        drop(tracing_guard);
        std::process::exit(code);
    }

    // ── Dispatcher ────────────────────────────────────────────────────────
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };
    let factory = SimClientFactory::new().with_speedup(cfg.sim_speedup);
    let dispatcher = {
        let _enter = rt.enter();
        Dispatcher::new(
            cfg.dispatcher_config(),
            Arc::new(library),
            Arc::new(factory) as Arc<dyn ClientFactory>,
        )
    };
    rt.spawn(repl::print_events(dispatcher.subscribe()));
    info!(
        groups = cfg.groups.len(),
        settle = %cfg.settle_posture,
        speedup = cfg.sim_speedup,
        "dispatcher ready"
    );

    println!();
    println!("  Available postures:");
    repl::print_postures(&dispatcher.list_postures(None));

    let shell = repl::Shell::new(&rt, dispatcher, cfg.wait_poll(), shutdown);

    // ── One-shot mode ─────────────────────────────────────────────────────
    if let Some(request) = &cli.run {
        let ok = shell.run_once(request);
        // exit() skips destructors; flush spans first.
        drop(shell);
        drop(rt);
        drop(tracing_guard);
        std::process::exit(if ok { 0 } else { 1 });
    }

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    shell.run();
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup helpers
// ─────────────────────────────────────────────────────────────────────────────

fn write_default_config() -> config::Config {
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn load_library(cfg: &config::Config, cli: &cli::Cli) -> Result<PostureLibrary, LibraryError> {
    let mut library = match &cfg.postures_path {
        Some(path) => PostureLibrary::load(path)?,
        None => {
            println!(
                "  {} pass {} or set postures_path in the config.",
                "No posture library configured;".yellow(),
                "--postures <path>".bold()
            );
            PostureLibrary::new()
        }
    };

    let strategy = if cli.overwrite {
        MergeStrategy::Overwrite
    } else {
        MergeStrategy::Keep
    };
    for path in &cli.merge {
        let merged = library.append(path, strategy)?;
        println!(
            "  Merged {} posture(s) from {}",
            merged,
            path.display().to_string().bold()
        );
    }
    Ok(library)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!(
        "  {} {}",
        "posture".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Posture dispatch shell");
    println!();
}
