//! hwbridged
//!
//! Loopback HTTP daemon bridging browser wallets to USB security devices.
//! Binds 127.0.0.1:21325 and exposes the enumerate/acquire/call/release
//! API; devices are reached over libusb or, for development, over UDP
//! emulators.

use anyhow::{Context, Result};
use clap::Parser;
use server::logging::setup_logging;
use server::{http, Core};
use std::path::PathBuf;
use tracing::info;
use transport::{Backend, LibUsb, PortPair, TransportBus, UdpEmulator};

#[derive(Parser, Debug)]
#[command(name = "hwbridged", version)]
#[command(about = "Bridge between browser wallets and USB security devices")]
#[command(long_about = "
Local daemon that exposes USB security devices to browser-origin web
applications over a narrow loopback HTTP API.

EXAMPLES:
    # Run against real USB devices
    hwbridged

    # Developing against two emulators, no USB
    hwbridged -e 21324 -e 21326 -u false

    # Emulator with a debug link
    hwbridged --ed 21324:21325 -u false
")]
struct Args {
    /// Log into a file instead of stderr
    #[arg(short = 'l', long = "logfile", value_name = "PATH")]
    logfile: Option<PathBuf>,

    /// Use UDP port for an emulator. Can be repeated for more ports.
    #[arg(short = 'e', long = "emulator", value_name = "PORT")]
    emulator: Vec<u16>,

    /// Use UDP port pair for an emulator with a debug link. Can be repeated.
    #[arg(long = "ed", value_name = "NORMAL:DEBUG", value_parser = parse_port_pair)]
    emulator_debug: Vec<PortPair>,

    /// Use USB devices. Can be disabled for testing environments.
    #[arg(
        short = 'u',
        long = "usb",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    usb: bool,

    /// Write verbose logs
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Reset the USB device on session acquiring. Disable if you plan to
    /// connect to the debug link outside of the bridge.
    #[arg(
        short = 'r',
        long = "reset",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    reset: bool,
}

fn parse_port_pair(value: &str) -> Result<PortPair, String> {
    let (normal, debug) = value
        .split_once(':')
        .ok_or_else(|| "expected NORMAL:DEBUG ports".to_string())?;
    Ok(PortPair {
        normal: normal.parse().map_err(|err| format!("normal port: {err}"))?,
        debug: debug.parse().map_err(|err| format!("debug port: {err}"))?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose, args.logfile.as_deref()).context("setting up logging")?;

    info!("hwbridged v{} is starting", env!("CARGO_PKG_VERSION"));

    let bus = init_backends(&args).context("initializing transports")?;
    let core = Core::new(bus, allow_stealing(), args.reset);

    let result = http::serve(core.clone(), env!("CARGO_PKG_VERSION").to_string())
        .await
        .context("http server");
    core.close();
    result
}

fn init_backends(args: &Args) -> Result<TransportBus> {
    let mut backends: Vec<Box<dyn Backend>> = Vec::new();

    if args.usb {
        info!("initializing libusb");
        backends.push(Box::new(LibUsb::new(detach_kernel_driver())?));
    }

    let mut pairs = args.emulator_debug.clone();
    pairs.extend(args.emulator.iter().map(|&normal| PortPair { normal, debug: 0 }));
    if !pairs.is_empty() {
        info!(count = pairs.len(), "emulator ports configured");
        backends.push(Box::new(UdpEmulator::new(pairs)));
    }

    Ok(TransportBus::new(backends)?)
}

/// Can the transports interrupt an in-flight transfer? Session stealing is
/// only safe where they can.
fn allow_stealing() -> bool {
    !cfg!(any(target_os = "freebsd", target_os = "openbsd"))
}

/// Does libusb need the kernel driver detached first?
fn detach_kernel_driver() -> bool {
    cfg!(target_os = "linux")
}
