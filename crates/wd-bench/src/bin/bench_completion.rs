// SPDX-License-Identifier: AGPL-3.0-only

//! Submission-to-observation latency of result writes.
//!
//! Submits verify requests to the simulated shell with a fixed device-side
//! completion delay and measures how long the host takes to see each slot
//! turn non-zero. The difference to the configured delay is the cost of
//! the invalidate-and-poll loop (interval from `WD_DMA_POLL_US`).
//!
//! Usage:
//!   cargo run --bin bench_completion
//!   cargo run --bin bench_completion -- --delay-us 100 --iterations 500
//!   cargo run --bin bench_completion -- --backing locked

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use wd_bench::{parse_arg, Latencies};
use wd_driver::prelude::*;

const DEFAULT_ITERATIONS: usize = 200;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let delay = Duration::from_micros(parse_arg(&args, "--delay-us", 200u64));
    let backing = parse_arg(&args, "--backing", Backing::Heap);

    let layout = RingLayout::default();
    let buffer = Arc::new(
        PinnedBuffer::allocate(wd_chip::ring::HUGEPAGE_SIZE, wd_driver::ring::page_size(), backing)
            .context("ring allocation failed")?,
    );
    let mut shell = SimulatedShell::new().with_completion_delay(delay);
    shell.attach_ring(Arc::clone(&buffer), layout)?;

    let poll = PollConfig::from_env();
    let detector = CompletionDetector::with_config(poll);
    let timeout = (delay * 20).max(Duration::from_millis(50));

    println!("Completion detection benchmark");
    println!("==============================");
    println!("Ring           : {} x {} bytes ({:?}, {})", layout.depth(), layout.stride(), backing, buffer.barrier_name());
    println!("Device delay   : {delay:?}");
    println!("Poll interval  : {:?}", poll.interval);
    println!("Iterations     : {iterations}");
    println!();

    let msg = [0u8; 64];
    let mut samples = Vec::with_capacity(iterations);
    let mut missed = 0usize;
    for seq in 0..iterations as u64 {
        // A wrapped slot still holds the previous lap's record.
        if seq > 0 && seq % layout.depth() as u64 == 0 {
            buffer.fill_zero();
        }
        let slot = layout.slot_range(seq);
        let t0 = Instant::now();
        shell.submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], seq))?;
        if detector.poll_for_write(&*buffer, slot, timeout)? {
            samples.push(t0.elapsed());
        } else {
            missed += 1;
        }
    }

    if let Some(l) = Latencies::new(&samples) {
        l.print("Submit to slot observed");
        #[allow(clippy::cast_precision_loss)]
        let overhead = l.percentile(50.0) - delay.as_secs_f64() * 1e6;
        println!("Host-side overhead (p50 - delay): {overhead:.1} µs");
    }
    if missed > 0 {
        println!("{missed} of {iterations} completions not seen within {timeout:?}");
    }

    Ok(())
}
