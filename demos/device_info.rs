//! Device Information Example
//!
//! Scans for logic analyzers running the fx2lafw firmware and prints what
//! each one reports at open:
//!
//! 1. GET_FW_VERSION (0xB0) - Firmware major/minor version
//! 2. GET_REVID_VERSION (0xB2) - FX2 silicon revision
//! 3. Profile data - channels, capabilities and sample rates

use fx2lafw::{Fx2lafw, RenumerationRegistry, SampleWidth, StartAcquisition, KHZ, MHZ};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn format_rate(rate: u64) -> String {
    if rate >= MHZ && rate % MHZ == 0 {
        format!("{} MHz", rate / MHZ)
    } else if rate >= KHZ && rate % KHZ == 0 {
        format!("{} kHz", rate / KHZ)
    } else {
        format!("{} Hz", rate)
    }
}

fn print_device(dev: &Fx2lafw) {
    let profile = dev.profile();
    println!("=== {} ===", dev);
    println!("Firmware version: {}", dev.firmware_version());
    println!(
        "Chip: {} (REVID {})",
        fx2lafw::constants::revid_name(dev.revid()),
        dev.revid()
    );
    println!("Firmware image: {}", profile.firmware);
    println!("Logic channels: {}", profile.logic_channel_count());
    println!("Analog channels: {}", profile.analog_channel_count());
    if let Some(fpga) = profile.variant.fpga_firmware() {
        println!("FPGA bitstream: {}", fpga);
    }

    println!("Sample rates:");
    for &rate in dev.context().samplerates() {
        match StartAcquisition::new(SampleWidth::Bits8, rate) {
            Ok(cmd) => println!(
                "  {:>8}  clock {} MHz, delay {}",
                format_rate(rate),
                cmd.clock_source().frequency() / MHZ,
                cmd.sample_delay
            ),
            Err(_) => println!("  {:>8}", format_rate(rate)),
        }
    }
    println!();
}

fn run() -> fx2lafw::Result<()> {
    println!("Scanning for fx2lafw devices...");
    let registry = RenumerationRegistry::new();
    let devices = Fx2lafw::scan(&registry)?;
    if devices.is_empty() {
        println!("Can not find fx2lafw device");
        return Ok(());
    }

    println!("Found {} device(s)", devices.len());
    println!();
    for dev in &devices {
        print_device(dev);
    }

    Ok(())
}
