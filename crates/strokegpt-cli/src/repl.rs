//! REPL – interactive manual test shell over the device bridge.
//!
//! Supported slash-commands:
//!   /connect [uri]               – connect and bind the first compatible device
//!   /move <speed> <depth> <range> – start or update motion (percentages)
//!   /vibrate <level>             – vibrate at a level (percentage)
//!   /stop                        – stop motion and any running pattern
//!   /status                      – show the bridge status snapshot
//!   /actuators                   – list the bound device's actuators
//!   /demo                        – play the built-in demo pattern
//!   /settings                    – interactively edit `~/.strokegpt/config.toml`
//!   /disconnect                  – stop and close the server connection
//!   /quit | /exit                – stop everything and exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strokegpt_runtime::{DeviceBridge, ModeSupervisor, MotionSink, PatternStep, demo_pattern};
use strokegpt_types::Actuator;

use crate::config::{self, Config};

/// One parsed line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(Option<String>),
    Move { speed: f64, depth: f64, range: f64 },
    Vibrate(f64),
    Stop,
    Status,
    Actuators,
    Demo,
    Settings,
    Disconnect,
    Help,
    Quit,
}

/// Parse a slash-command line. The error is the message shown to the user.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Err("empty command".into());
    };
    let args: Vec<&str> = words.collect();

    let no_args = |cmd: Command| {
        if args.is_empty() {
            Ok(cmd)
        } else {
            Err(format!("{name} takes no arguments"))
        }
    };

    match name {
        "/connect" => match args.as_slice() {
            [] => Ok(Command::Connect(None)),
            [uri] => Ok(Command::Connect(Some((*uri).to_string()))),
            _ => Err("usage: /connect [uri]".into()),
        },
        "/move" => {
            let [speed, depth, range] = args.as_slice() else {
                return Err("usage: /move <speed> <depth> <range>".into());
            };
            Ok(Command::Move {
                speed: parse_percent("speed", speed)?,
                depth: parse_percent("depth", depth)?,
                range: parse_percent("range", range)?,
            })
        }
        "/vibrate" => match args.as_slice() {
            [level] => Ok(Command::Vibrate(parse_percent("level", level)?)),
            _ => Err("usage: /vibrate <0-100>".into()),
        },
        "/stop" => no_args(Command::Stop),
        "/status" => no_args(Command::Status),
        "/actuators" => no_args(Command::Actuators),
        "/demo" => no_args(Command::Demo),
        "/settings" => no_args(Command::Settings),
        "/disconnect" => no_args(Command::Disconnect),
        "/help" => no_args(Command::Help),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn parse_percent(field: &str, raw: &str) -> Result<f64, String> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(format!("{field} must be a number between 0 and 100, got '{raw}'")),
    }
}

/// Recover the supervisor even if a previous holder panicked.
pub fn lock_modes(modes: &Mutex<ModeSupervisor>) -> MutexGuard<'_, ModeSupervisor> {
    modes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(
    bridge: &Arc<DeviceBridge>,
    modes: &Mutex<ModeSupervisor>,
    cfg: &mut Config,
    shutdown: Arc<AtomicBool>,
) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "strokegpt>".bold().magenta());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Ok(Command::Connect(uri)) => cmd_connect(bridge, cfg, uri),
            Ok(Command::Move { speed, depth, range }) => {
                cmd_move(bridge, modes, cfg, speed, depth, range)
            }
            Ok(Command::Vibrate(level)) => cmd_vibrate(bridge, modes, cfg, level),
            Ok(Command::Stop) => cmd_stop(bridge, modes),
            Ok(Command::Status) => cmd_status(bridge, modes),
            Ok(Command::Actuators) => cmd_actuators(bridge),
            Ok(Command::Demo) => cmd_demo(bridge, modes),
            Ok(Command::Settings) => cmd_settings(bridge, modes, cfg),
            Ok(Command::Disconnect) => cmd_disconnect(bridge, modes),
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => {
                println!(
                    "{} {}. Type {} for available commands.",
                    "Error:".red(),
                    msg.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "StrokeGPT Commands".bold().underline());
    println!("  {}                – connect and bind a device", "/connect [uri]".bold().cyan());
    println!("  {} – start or update motion (0-100)", "/move <speed> <depth> <range>".bold().cyan());
    println!("  {}            – vibrate at a level (0-100)", "/vibrate <level>".bold().cyan());
    println!("  {}                         – stop motion", "/stop".bold().cyan());
    println!("  {}                       – show bridge status", "/status".bold().cyan());
    println!("  {}                    – list bound actuators", "/actuators".bold().cyan());
    println!("  {}                         – play the demo pattern", "/demo".bold().cyan());
    println!("  {}                     – edit ~/.strokegpt/config.toml", "/settings".bold().cyan());
    println!("  {}                   – stop and close the connection", "/disconnect".bold().cyan());
    println!("  {}                  – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_connect(bridge: &DeviceBridge, cfg: &Config, uri: Option<String>) {
    let uri = uri.unwrap_or_else(|| cfg.server_uri.clone());
    println!(
        "{} {} (scanning for {:.1}s)…",
        "Connecting to".bold(),
        uri.cyan(),
        cfg.discovery_window_ms as f64 / 1000.0
    );

    if bridge.connect(&uri) {
        let status = bridge.status();
        println!(
            "  {} {} ({} linear, {} vibrating, {} rotating)",
            "✓ Bound".green(),
            status.device.unwrap_or_default().bold(),
            status.linear,
            status.vibrating,
            status.rotating
        );
    } else {
        println!(
            "  {} no device bound: server unreachable or no compatible device found (see log)",
            "✗".red()
        );
    }
}

fn cmd_move(
    bridge: &DeviceBridge,
    modes: &Mutex<ModeSupervisor>,
    cfg: &Config,
    speed: f64,
    depth: f64,
    range: f64,
) {
    if !bridge.is_connected() {
        println!("{} no device bound – run {} first", "!".yellow(), "/connect".bold());
        return;
    }
    // A manual move takes over from any running pattern.
    lock_modes(modes).stop();

    let step = cfg.limits.apply(PatternStep::new(speed, depth, range, 0));
    bridge.move_to(step.speed, step.depth, step.range);
    println!(
        "  speed {} depth {} range {}",
        format!("{:.0}", step.speed).yellow(),
        format!("{:.0}", step.depth).yellow(),
        format!("{:.0}", step.range).yellow()
    );
}

/// Vibration level only: depth is pinned to the middle and range to zero.
fn cmd_vibrate(bridge: &DeviceBridge, modes: &Mutex<ModeSupervisor>, cfg: &Config, level: f64) {
    if !bridge.is_connected() {
        println!("{} no device bound – run {} first", "!".yellow(), "/connect".bold());
        return;
    }
    lock_modes(modes).stop();

    let step = cfg.limits.apply(PatternStep::new(level, 50.0, 0.0, 0));
    bridge.move_to(step.speed, step.depth, 0.0);
    println!("  level {}", format!("{:.0}", step.speed).yellow());
}

fn cmd_actuators(bridge: &DeviceBridge) {
    let status = bridge.status();
    let Some(device) = status.device else {
        println!("{} no device bound – run {} first", "!".yellow(), "/connect".bold());
        return;
    };
    println!("{}", format!("Actuators on {device}").bold().underline());
    for line in actuator_lines(&status.actuators) {
        println!("{line}");
    }
}

fn actuator_lines(actuators: &[Actuator]) -> Vec<String> {
    actuators
        .iter()
        .map(|a| format!("  #{:<2} {:<9} {}", a.index, a.class.to_string(), a.description))
        .collect()
}

fn cmd_stop(bridge: &DeviceBridge, modes: &Mutex<ModeSupervisor>) {
    lock_modes(modes).stop();
    bridge.stop();
    println!("  {}", "■ stopped".green());
}

fn cmd_disconnect(bridge: &DeviceBridge, modes: &Mutex<ModeSupervisor>) {
    lock_modes(modes).stop();
    bridge.disconnect();
    println!("  {}", "disconnected".green());
}

fn cmd_demo(bridge: &DeviceBridge, modes: &Mutex<ModeSupervisor>) {
    if !bridge.is_connected() {
        println!("{} no device bound – run {} first", "!".yellow(), "/connect".bold());
        return;
    }
    let steps = demo_pattern();
    let total_ms: u64 = steps.iter().map(|s| s.duration_ms).sum();
    match lock_modes(modes).start("demo", steps, false) {
        Ok(()) => println!(
            "  {} demo pattern ({:.1}s) – {} to end early",
            "▶".green(),
            total_ms as f64 / 1000.0,
            "/stop".bold()
        ),
        Err(e) => println!("{}: {}", "Error starting demo".red(), e),
    }
}

fn cmd_status(bridge: &DeviceBridge, modes: &Mutex<ModeSupervisor>) {
    let status = bridge.status();
    let none = || "-".dimmed().to_string();

    println!("{}", "Bridge Status".bold().underline());
    println!("  State      : {}", status.state.to_string().yellow());
    println!("  Server     : {}", status.server.clone().unwrap_or_else(none));
    println!("  Device     : {}", status.device.clone().unwrap_or_else(none));
    if status.device.is_some() {
        println!(
            "  Actuators  : {} linear, {} vibrating, {} rotating",
            status.linear, status.vibrating, status.rotating
        );
    }
    println!(
        "  Motion     : {}",
        if status.active { "active".green() } else { "idle".dimmed() }
    );
    println!(
        "  Last move  : speed {:.0} depth {:.0} range {:.0}",
        status.last_speed, status.last_depth, status.last_range
    );
    println!(
        "  Moved at   : {}",
        status
            .last_move_at
            .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(none)
    );
    println!(
        "  Pattern    : {}",
        lock_modes(modes).current_mode().map(str::to_string).unwrap_or_else(none)
    );
}

fn cmd_settings(bridge: &Arc<DeviceBridge>, modes: &Mutex<ModeSupervisor>, cfg: &mut Config) {
    let mut edited = cfg.clone();

    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep the current value)");
    edited.server_uri = prompt_str(&format!("  Server URI          [{}]: ", edited.server_uri), &edited.server_uri);
    edited.discovery_window_ms = prompt_u64(
        &format!("  Discovery window ms [{}]: ", edited.discovery_window_ms),
        edited.discovery_window_ms,
    );
    edited.limits.min_speed = prompt_f64(&format!("  Min speed           [{}]: ", edited.limits.min_speed), edited.limits.min_speed);
    edited.limits.max_speed = prompt_f64(&format!("  Max speed           [{}]: ", edited.limits.max_speed), edited.limits.max_speed);
    edited.limits.min_depth = prompt_f64(&format!("  Min depth           [{}]: ", edited.limits.min_depth), edited.limits.min_depth);
    edited.limits.max_depth = prompt_f64(&format!("  Max depth           [{}]: ", edited.limits.max_depth), edited.limits.max_depth);
    edited.limits = edited.limits.normalized();

    if let Err(e) = edited.validate() {
        println!("{}: {}", "Settings not saved".red(), e);
        return;
    }

    match config::save(&edited) {
        Ok(()) => println!(
            "{} {}",
            "✓ Settings saved to".green(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    if edited.limits != cfg.limits {
        // The supervisor captures limits at construction.
        *lock_modes(modes) = ModeSupervisor::new(Arc::clone(bridge) as Arc<dyn MotionSink>, edited.limits);
    }
    if edited.discovery_window_ms != cfg.discovery_window_ms {
        println!("  {}", "Discovery window changes apply after restart.".dimmed());
    }
    *cfg = edited;
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_str(prompt: &str, default: &str) -> String {
    print!("{}", prompt);
    io::stdout().flush().ok();
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok();
    let trimmed = line.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn prompt_u64(prompt: &str, default: u64) -> u64 {
    prompt_str(prompt, "").parse().unwrap_or(default)
}

fn prompt_f64(prompt: &str, default: f64) -> f64 {
    match prompt_str(prompt, "").parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => default,
    }
}
