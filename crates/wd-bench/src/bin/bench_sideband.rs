// SPDX-License-Identifier: AGPL-3.0-only

//! Sideband round-trip latency.
//!
//! Times single-byte transactions and full 64-bit assembled reads. Each
//! byte costs one command write plus at least one status poll; a 64-bit
//! value is eight of those under one session.
//!
//! Usage:
//!   cargo run --bin bench_sideband                       # simulated shell
//!   cargo run --bin bench_sideband -- --latency 8        # 8 stale polls per echo
//!   cargo run --bin bench_sideband -- --pci 0000:00:1d.0 # real slot
//!   cargo run --bin bench_sideband -- --iterations 5000

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use wd_bench::{parse_arg, Latencies};
use wd_chip::sideband::{Command, Function};
use wd_driver::{ChannelConfig, F1Device, SidebandChannel, SidebandPort, SimulatedShell};

const DEFAULT_ITERATIONS: usize = 1000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let latency = parse_arg(&args, "--latency", 2u32);
    let pci = parse_arg(&args, "--pci", String::new());

    let (port, source): (Box<dyn SidebandPort>, String) = if pci.is_empty() {
        let shell = SimulatedShell::new().with_echo_latency(latency);
        (Box::new(shell.sideband_port()), format!("simulated (echo after {latency} polls)"))
    } else {
        let dev = F1Device::open(&pci, wd_chip::regs::OCL_BAR)?;
        (Box::new(dev.sideband_port()), format!("FPGA {pci}"))
    };
    let config = ChannelConfig::from_env();
    let channel = SidebandChannel::with_config(port, config);

    println!("Sideband round-trip benchmark");
    println!("=============================");
    println!("Shell          : {source}");
    println!("Iterations     : {iterations}");
    println!(
        "Poll budget    : {} x {:?} ({:?} worst case per byte)",
        config.max_attempts,
        config.poll_interval,
        config.worst_case()
    );
    println!();

    let Some(status0) = Command::new(Function::STATUS_PAGE, 0) else {
        anyhow::bail!("status page command not encodable");
    };

    // Warmup
    for _ in 0..20 {
        let _ = channel.read_byte(status0);
    }

    let mut byte_samples = Vec::with_capacity(iterations);
    let mut unanswered = 0usize;
    for _ in 0..iterations {
        let t0 = Instant::now();
        let reply = channel.transact(status0);
        byte_samples.push(t0.elapsed());
        if !reply.is_answered() {
            unanswered += 1;
        }
    }

    let mut wide_samples: Vec<Duration> = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let t0 = Instant::now();
        let _ = channel.read_field64(Function::AW_ADDRESS)?;
        wide_samples.push(t0.elapsed());
    }

    if let Some(l) = Latencies::new(&byte_samples) {
        l.print("Single byte (write + poll + read)");
    }
    if let Some(l) = Latencies::new(&wide_samples) {
        l.print("64-bit assembled read (8 bytes, one session)");
    }
    if unanswered > 0 {
        println!("{unanswered} of {iterations} byte reads got no echo");
    }

    Ok(())
}
