//! `muse` – interactive front end for the memory core.
//!
//! 1. Installs tracing (see `muse_runtime::telemetry`).
//! 2. Loads `~/.muse/config.toml`, writing the defaults on first run.
//! 3. Opens the memory store, forum archive and vector index, and loads
//!    character sheets.
//! 4. Drops the user into a REPL where plain lines are said to the active
//!    character and slash-commands inspect memory.

mod app;
mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

fn main() {
    let _telemetry = muse_runtime::init_tracing("muse");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – finishing up …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start async runtime");
            std::process::exit(1);
        }
    };

    let app = match runtime.block_on(app::App::build(cfg)) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "startup failed");
            println!("{}: {}", "Cannot start muse".red().bold(), e);
            std::process::exit(1);
        }
    };

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&runtime, &app, shutdown);
}

/// Write the default config (with environment overrides applied) and use it.
fn first_run() -> config::Config {
    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);
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

fn print_banner() {
    println!();
    println!("{}", r#"   __ _  __ _____ ___ "#.bold().magenta());
    println!("{}", r#"  /  ' \/ // (_-</ -_)"#.bold().magenta());
    println!("{}", r#" /_/_/_/\_,_/___/\__/ "#.bold().magenta());
    println!();
    println!(
        "  {} {}",
        "muse".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Roleplay characters with long memories");
    println!();
}
