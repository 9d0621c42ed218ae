//! `strokegpt-cli` – manual test tool for the StrokeGPT device bridge.
//!
//! It:
//!
//! 1. Checks for `~/.strokegpt/config.toml`; runs a short **First-Run Wizard**
//!    when the file is absent.
//! 2. Starts a [`DeviceBridge`] against the configured device server, or
//!    against the in-process simulator when run with `--sim`.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/connect`, `/move`, `/stop`, `/status`, `/demo`, `/settings`, ...).
//! 4. Intercepts **Ctrl-C** to stop the device safely and exit.

mod config;
mod repl;

use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use strokegpt_middleware::{ButtplugConnector, SessionConnector, SimConnector};
use strokegpt_runtime::{DeviceBridge, ModeSupervisor, MotionSink, init_tracing};
use strokegpt_types::{ActuatorDescriptor, CommandRoute, DeviceDescriptor};

fn main() {
    // RUST_LOG filters (default "info"); STROKEGPT_LOG_FORMAT=json switches to
    // JSON lines. User-facing output still goes through println!.
    let _telemetry = init_tracing("strokegpt-cli");

    print_banner();

    let simulate = std::env::args().skip(1).any(|a| a == "--sim");

    // ── Configuration ─────────────────────────────────────────────────────
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            default_config()
        }
    };
    if let Err(e) = cfg.validate() {
        println!("{}: {}", "Config error".red(), e);
        println!("  Using default configuration.");
        cfg = default_config();
    }

    // ── Device bridge ─────────────────────────────────────────────────────
    let connector: Arc<dyn SessionConnector> = if simulate {
        println!("  {} simulated device server", "Using".yellow());
        Arc::new(simulated_server())
    } else {
        Arc::new(
            ButtplugConnector::new(cfg.client_name.clone())
                .with_request_timeout(cfg.command_timeout()),
        )
    };
    let bridge = match DeviceBridge::new(connector, cfg.bridge_config()) {
        Ok(bridge) => Arc::new(bridge),
        Err(e) => {
            error!(error = %e, "failed to start device bridge");
            println!("{}: {}", "Failed to start device bridge".red(), e);
            std::process::exit(1);
        }
    };
    let modes = Arc::new(Mutex::new(ModeSupervisor::new(
        Arc::clone(&bridge) as Arc<dyn MotionSink>,
        cfg.limits,
    )));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    // stdin stays blocked in the REPL, so the handler stops the device and
    // exits the process itself.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        let bridge = Arc::clone(&bridge);
        let modes = Arc::clone(&modes);
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – stopping device …".yellow().bold());
            shutdown.store(true, Ordering::SeqCst);
            repl::lock_modes(&modes).stop();
            bridge.stop();
            bridge.shutdown();
            println!("{}", "  ✓ Device stopped. Exiting StrokeGPT.".green());
            std::process::exit(130);
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not stop the device");
        }
    }

    println!();
    println!(
        "  Server {}. Type {} to bind a device or {} for all commands.\n",
        cfg.server_uri.cyan(),
        "/connect".bold().cyan(),
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&bridge, &modes, &mut cfg, shutdown);

    repl::lock_modes(&modes).stop();
    bridge.shutdown();
}

/// Defaults with environment overrides applied.
fn default_config() -> config::Config {
    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);
    cfg
}

/// A simulator preloaded with one stroker and one dual-motor vibrator.
fn simulated_server() -> SimConnector {
    let vibrate = CommandRoute::Scalar {
        actuator_type: "Vibrate".into(),
    };
    SimConnector::new()
        .with_device(DeviceDescriptor {
            index: 0,
            name: "Simulated Stroker".into(),
            linear: vec![ActuatorDescriptor {
                index: 0,
                description: "Linear - Position".into(),
                route: CommandRoute::Linear,
            }],
            ..Default::default()
        })
        .with_advertised_device(DeviceDescriptor {
            index: 1,
            name: "Simulated Wand".into(),
            actuators: (0..2)
                .map(|i| ActuatorDescriptor {
                    index: i,
                    description: format!("Vibrate - Level {}", i + 1),
                    route: vibrate.clone(),
                })
                .collect(),
            ..Default::default()
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().magenta());
    println!("{}", "  ║      StrokeGPT First-Run Wizard      ║".bold().magenta());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().magenta());
    println!();
    println!("  No configuration found. Let's point StrokeGPT at your device server.\n");

    let mut cfg = default_config();

    cfg.server_uri = prompt_line(
        &format!("  Device server WebSocket address [{}]: ", cfg.server_uri),
        &cfg.server_uri,
    );

    let window = prompt_line(
        &format!("  Discovery window in ms [{}]: ", cfg.discovery_window_ms),
        &cfg.discovery_window_ms.to_string(),
    );
    if let Ok(ms) = window.trim().parse::<u64>() {
        cfg.discovery_window_ms = ms;
    }

    if let Err(e) = cfg.validate() {
        println!("{}: {}", "Invalid settings".red(), e);
        println!("  Keeping defaults.");
        return default_config();
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ______           __        _______  ___________"#.bold().magenta());
    println!("{}", r#"  / __/ /________  / /_____  / ___/ _ \/_  __/"#.bold().magenta());
    println!("{}", r#" _\ \/ __/ __/ _ \/  '_/ -_)/ (_ / ___/ / /   "#.bold().magenta());
    println!("{}", r#"/___/\__/_/  \___/_/\_\\__/ \___/_/    /_/    "#.bold().magenta());
    println!();
    println!(
        "  {} {}",
        "StrokeGPT".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Device bridge manual test console");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) if !line.trim().is_empty() => line.trim().to_string(),
        _ => default.to_string(),
    }
}
