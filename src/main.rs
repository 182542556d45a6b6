//! Command-line front-end for nrf-ota.

use std::cell::Cell;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use nrf_ota::{perform_dfu, scan_for_devices, DfuError, DfuOptions, DfuTarget, Target};

/// Flash Nordic Legacy DFU firmware to an nRF5x device over BLE.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the Nordic DFU ZIP produced by nrfutil
    zip_path: PathBuf,

    /// Device name substring or AA:BB:CC:DD:EE:FF address (skips the picker)
    #[arg(long, value_name = "NAME_OR_ADDRESS")]
    device: Option<String>,

    /// Suppress all non-error output
    #[arg(long)]
    quiet: bool,

    /// BLE scan timeout in seconds
    #[arg(long, default_value_t = 5.0, value_name = "SECONDS")]
    timeout: f64,

    /// Packets per receipt notification (default: 8 on macOS, 10 elsewhere)
    #[arg(long, value_name = "N")]
    prn: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.quiet { "error" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("DFU failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), DfuError> {
    let quiet = args.quiet;

    let mut options = DfuOptions::default();
    options.scan_timeout = Duration::from_secs_f64(args.timeout);
    if let Some(prn) = args.prn {
        options.packets_per_notification = prn;
    }

    let target: Target = match args.device {
        Some(selector) => Target::from(selector),
        None => Target::from(pick_device(args.timeout, quiet).await?),
    };

    let on_progress = progress_bar(quiet);
    let on_log = move |msg: &str| {
        if !quiet {
            println!("  {msg}");
        }
    };

    perform_dfu(&args.zip_path, target, &options, on_progress, on_log).await?;

    if !quiet {
        println!("Update complete.");
    }
    Ok(())
}

/// Scan and let the user pick a device interactively.
async fn pick_device(timeout: f64, quiet: bool) -> Result<DfuTarget, DfuError> {
    if !quiet {
        println!("Scanning for BLE devices ({timeout:.0} s)...");
    }
    let mut devices = scan_for_devices(Duration::from_secs_f64(timeout)).await?;

    if devices.is_empty() {
        return Err(DfuError::DeviceNotFound {
            detail: "no named BLE devices in range".to_string(),
        });
    }

    println!("\nFound {} device(s):", devices.len());
    for (i, device) in devices.iter().enumerate() {
        println!("  [{i}] {}", device.display_label());
    }

    let stdin = io::stdin();
    loop {
        print!("\nSelect device [0-{}]: ", devices.len() - 1);
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err(DfuError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device selection aborted",
            )));
        }

        match line.trim().parse::<usize>() {
            Ok(index) if index < devices.len() => return Ok(devices.swap_remove(index)),
            _ => println!("  Please enter a number between 0 and {}.", devices.len() - 1),
        }
    }
}

/// Single-line progress bar, redrawn in place.
fn progress_bar(quiet: bool) -> impl Fn(f32) {
    const BAR_LEN: usize = 40;
    let last_whole = Cell::new(-1i32);

    move |pct: f32| {
        if quiet {
            return;
        }
        // Only redraw on whole-percent changes to keep the terminal calm
        let whole = pct as i32;
        if whole <= last_whole.get() && pct < 100.0 {
            return;
        }
        last_whole.set(whole);

        let filled = (BAR_LEN as f32 * pct / 100.0) as usize;
        let filled = filled.min(BAR_LEN);
        print!(
            "\r  [{}{}] {pct:5.1}%",
            "#".repeat(filled),
            "-".repeat(BAR_LEN - filled)
        );
        let _ = io::stdout().flush();
        if pct >= 100.0 {
            println!();
        }
    }
}
