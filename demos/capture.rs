//! Capture Example
//!
//! Captures a fixed number of 8-bit samples from the first fx2lafw device
//! and prints them as hex, 32 samples per line.
//!
//! Usage: capture [samplerate_hz] [samples] [trigger_mask trigger_value]

use std::io::Write;

use fx2lafw::{
    AbortHandle, Fx2lafw, Fx2lafwError, Packet, RenumerationRegistry, TriggerConfig,
    TriggerStage, MHZ,
};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn parse_arg(args: &[String], index: usize, default: u64) -> u64 {
    args.get(index)
        .and_then(|s| {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        })
        .unwrap_or(default)
}

fn run() -> fx2lafw::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let samplerate = parse_arg(&args, 1, MHZ);
    let samples = parse_arg(&args, 2, 1024);

    let registry = RenumerationRegistry::new();
    let mut dev = match Fx2lafw::scan(&registry)?.into_iter().next() {
        Some(dev) => dev,
        None => return Err(Fx2lafwError::DeviceNotFound),
    };
    println!("Found device: {}", dev);

    let context = dev.context_mut();
    context.set_samplerate(samplerate)?;
    context.set_limit_samples(Some(samples));
    if args.len() > 4 {
        let mask = parse_arg(&args, 3, 0) as u16;
        let value = parse_arg(&args, 4, 0) as u16;
        context.set_trigger(Some(TriggerConfig::new(&[TriggerStage::new(mask, value)])?))?;
        context.set_capture_ratio(10)?;
        println!("Trigger: mask 0x{:02x} value 0x{:02x}", mask, value);
    }
    println!("Capturing {} samples at {} Hz", samples, samplerate);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut column = 0;
    let sink = |packet: Packet<'_>| match packet {
        Packet::Logic(logic) => {
            for sample in logic.samples() {
                let _ = write!(out, "{:02x} ", sample);
                column += 1;
                if column == 32 {
                    let _ = writeln!(out);
                    column = 0;
                }
            }
        }
        Packet::Trigger => {
            let _ = writeln!(out, "\n--- trigger ---");
            column = 0;
        }
        Packet::Error(e) => eprintln!("\nAcquisition error: {}", e),
        Packet::End(_) => {
            let _ = writeln!(out);
        }
        _ => {}
    };

    let summary = dev.acquire(sink, &AbortHandle::new())?;
    println!(
        "Captured {} samples ({:?}, trigger {})",
        summary.sent_samples,
        summary.outcome,
        if summary.trigger_fired { "fired" } else { "not fired" }
    );

    Ok(())
}
