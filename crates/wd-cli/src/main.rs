// SPDX-License-Identifier: AGPL-3.0-only

//! `wd` — loop-back check and diagnostics for the Wiredancer shell.
//!
//! ```text
//! USAGE:
//!   wd [--sim | --pci <addr> | --slot N] [--bar N] <command>
//!
//!   wd probe                 Full loop-back check (ring, PCIM, submit, counters, slot)
//!   wd sideband <func> <sel> One raw sideband byte
//!   wd counters              Snapshot and print the pipeline counters
//!   wd pcim                  PCIM capture registers only
//!   wd status                Decode the raw status register
//! ```
//!
//! Timing comes from `WD_SIDEBAND_ATTEMPTS`, `WD_SIDEBAND_INTERVAL_US`,
//! `WD_DMA_POLL_US` and `WD_DMA_TIMEOUT_MS`; logging from `RUST_LOG`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wd_chip::sideband::{Command, Function};
use wd_driver::counters::CounterPort;
use wd_driver::{
    hexdump, Backing, ChannelConfig, CounterRegistry, F1Device, Loopback, PcimProbe, PollConfig,
    ProbeConfig, Reply, ResultRecord, SidebandChannel, SidebandPort, SimulatedShell,
    WorkSubmitter,
};

#[derive(Parser)]
#[command(name = "wd", about = "Wiredancer shell loop-back check and diagnostics", version)]
struct Cli {
    /// Run against the in-process simulated shell.
    #[arg(long, global = true, conflicts_with_all = ["pci", "slot"])]
    sim: bool,

    /// PCIe address of the application PF (e.g. 0000:00:1d.0).
    #[arg(long, global = true, conflicts_with = "slot")]
    pci: Option<String>,

    /// FPGA slot, resolved through sysfs.
    #[arg(long, global = true)]
    slot: Option<u8>,

    /// BAR holding the shell registers.
    #[arg(long, global = true, default_value_t = wd_chip::regs::OCL_BAR)]
    bar: usize,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Full loop-back check.
    Probe {
        /// Sequence number of the test request.
        #[arg(long, default_value_t = 1)]
        sequence: u64,
        /// Ring depth (power of two).
        #[arg(long, default_value_t = wd_chip::ring::DEFAULT_DEPTH)]
        depth: usize,
        /// Milliseconds to wait for the result write (default: WD_DMA_TIMEOUT_MS or 5).
        #[arg(long)]
        wait_ms: Option<u64>,
        /// Ring memory: hugepage, locked or heap.
        #[arg(long, default_value = "hugepage")]
        backing: Backing,
        /// List every non-zero slot in the ring afterwards.
        #[arg(long)]
        scan: bool,
        /// Exit non-zero if the result slot stays empty.
        #[arg(long)]
        strict: bool,
    },
    /// Read one sideband byte.
    Sideband {
        /// Function code (0x0..0xf).
        #[arg(value_parser = parse_nibble)]
        func: u8,
        /// Selector (0..15).
        #[arg(value_parser = parse_nibble)]
        sel: u8,
    },
    /// Snapshot and print the pipeline counters.
    Counters,
    /// Print the PCIM capture registers.
    Pcim,
    /// Decode the raw sideband status register.
    Status,
}

/// The shell the commands run against.
enum Target {
    Sim(SimulatedShell),
    Hardware(F1Device),
}

impl Target {
    fn open(cli: &Cli) -> Result<Self> {
        if cli.sim {
            let shell = SimulatedShell::new().with_completion_delay(Duration::from_micros(500));
            return Ok(Self::Sim(shell));
        }
        let device = match &cli.pci {
            Some(addr) => F1Device::open(addr, cli.bar),
            None if cli.bar == wd_chip::regs::OCL_BAR => F1Device::open_slot(cli.slot.unwrap_or(0)),
            None => {
                let addr = wd_driver::discovery::find_slot(cli.slot.unwrap_or(0))?;
                F1Device::open(&addr, cli.bar)
            }
        }
        .context("FPGA init failed (try --sim)")?;
        tracing::info!("Opened FPGA at {}", device.pcie_address());
        Ok(Self::Hardware(device))
    }

    fn channel(&self) -> SidebandChannel<Box<dyn SidebandPort>> {
        let port: Box<dyn SidebandPort> = match self {
            Self::Sim(shell) => Box::new(shell.sideband_port()),
            Self::Hardware(dev) => Box::new(dev.sideband_port()),
        };
        SidebandChannel::with_config(port, ChannelConfig::from_env())
    }

    fn counters(&self) -> CounterRegistry<Box<dyn CounterPort>> {
        let port: Box<dyn CounterPort> = match self {
            Self::Sim(shell) => Box::new(shell.counter_port()),
            Self::Hardware(dev) => Box::new(dev.counter_port()),
        };
        CounterRegistry::new(port)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let mut target = Target::open(&cli)?;

    match cli.command {
        Cmd::Probe {
            sequence,
            depth,
            wait_ms,
            backing,
            scan,
            strict,
        } => {
            let poll = PollConfig::from_env();
            let config = ProbeConfig {
                slot: cli.slot.unwrap_or(0),
                depth,
                sequence,
                dma_wait: wait_ms.map_or(poll.timeout, Duration::from_millis),
                backing,
                ..ProbeConfig::default()
            };
            cmd_probe(&mut target, &config, poll, scan, strict)?;
        }
        Cmd::Sideband { func, sel } => cmd_sideband(&target, func, sel)?,
        Cmd::Counters => cmd_counters(&target)?,
        Cmd::Pcim => cmd_pcim(&target)?,
        Cmd::Status => cmd_status(&target)?,
    }

    Ok(())
}

fn cmd_probe(
    target: &mut Target,
    config: &ProbeConfig,
    poll: PollConfig,
    scan: bool,
    strict: bool,
) -> Result<()> {
    let channel = target.channel();
    let mut counters = target.counters();

    println!(
        "allocating {:?} ring: {} x {} bytes, sequence {}",
        config.backing, config.depth, config.stride, config.sequence
    );
    let layout = wd_driver::RingLayout::new(config.depth, config.stride)?;
    let buffer = std::sync::Arc::new(
        wd_driver::PinnedBuffer::allocate(
            config.buffer_size,
            wd_driver::ring::page_size(),
            config.backing,
        )
            .context("pinned ring allocation failed")?,
    );
    layout.check_fits(&*buffer)?;
    buffer.flush();
    if let Some(phys) = buffer.physical_address() {
        println!("ring physical base   : {phys:#018x}");
    }

    let (submitter, sim_base) = match &mut *target {
        Target::Sim(shell) => {
            let base = shell.bus_base();
            let submitter: &mut dyn WorkSubmitter = shell;
            (Some(submitter), Some(base))
        }
        Target::Hardware(_) => {
            println!("note: verify submission needs the simulated shell or an external submitter");
            (None, None)
        }
    };

    println!("initializing verify request...");
    let report = Loopback {
        channel: &channel,
        counters: &mut counters,
        submitter,
        poll,
    }
    .run_with(std::sync::Arc::clone(&buffer), layout, config)?;

    print!("{}", report.pcim);
    println!();
    if report.submitted {
        println!("sent verify request seq={}", config.sequence);
    }

    println!("--- counter snapshot ---");
    for r in &report.counters {
        println!("  {:<18} : {:>10} (idx {})", r.desc.label, r.value, r.desc.index);
    }
    println!();

    println!("mcache line after DMA (offset {:#x}):", report.slot_offset);
    print!("{}", hexdump(&report.slot));
    if report.completed {
        if let Ok(record) = ResultRecord::from_slot(&report.slot) {
            if matches!(target, Target::Sim(_)) {
                println!(
                    "result: seq={} status={} lane={} len={}",
                    record.sequence, record.status, record.lane, record.message_len
                );
            }
        }
    } else {
        println!("slot still zero after {:?}", config.dma_wait);
    }

    let expected = report
        .expected_bus_address
        .or_else(|| sim_base.map(|b| b + report.slot_offset as u64));
    let captured = PcimProbe::new(&channel).captured_aw_address()?;
    match expected {
        Some(addr) => println!("expected AW-address  : {addr:#018x} (captured {captured:#018x})"),
        None => println!("expected AW-address  : unknown (needs CAP_SYS_ADMIN for pagemap)"),
    }

    if scan {
        println!("\nnon-zero slots:");
        let detector = wd_driver::CompletionDetector::with_config(poll);
        for (offset, bytes) in detector.scan_nonzero(&*buffer, layout.bytes(), config.stride)? {
            println!("  slot {:>5} @ {offset:#07x}", offset / config.stride);
            for line in hexdump(&bytes).lines() {
                println!("    {line}");
            }
        }
    }

    let s = report.final_status;
    println!(
        "vled raw {:#06x}  (func={:x} sel={} byte={:#04x})",
        s.encode(),
        s.function.code(),
        s.selector,
        s.byte
    );

    if strict && !report.completed {
        bail!("no DMA completion within {:?}", config.dma_wait);
    }
    Ok(())
}

fn cmd_sideband(target: &Target, func: u8, sel: u8) -> Result<()> {
    let function = Function::new(func).context("function code is 4 bits")?;
    let command = Command::new(function, sel).context("selector is 4 bits")?;
    match target.channel().transact(command) {
        Reply::Byte(b) => println!("{command} -> {b:#04x}"),
        Reply::NoResponse { attempts } => {
            println!("{command} -> no echo after {attempts} attempts (reads as 0x00)");
        }
        Reply::PortFailed => bail!("{command}: sideband transport failed"),
    }
    Ok(())
}

fn cmd_counters(target: &Target) -> Result<()> {
    let mut registry = target.counters();
    for r in registry.read_all()? {
        println!("  {:<18} : {:>10} (idx {})", r.desc.label, r.value, r.desc.index);
    }
    Ok(())
}

fn cmd_pcim(target: &Target) -> Result<()> {
    let channel = target.channel();
    print!("{}", PcimProbe::new(&channel).report()?);
    Ok(())
}

fn cmd_status(target: &Target) -> Result<()> {
    let s = target.channel().raw_status()?;
    println!(
        "vled raw {:#06x}  (func={:x} sel={} byte={:#04x})",
        s.encode(),
        s.function.code(),
        s.selector,
        s.byte
    );
    Ok(())
}

/// `0x`-prefixed hex or decimal, at most 15.
fn parse_nibble(s: &str) -> std::result::Result<u8, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("{s:?}: {e}"))?;
    if value > 0xF {
        return Err(format!("{s:?} does not fit in 4 bits"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn nibble_parsing() {
        assert_eq!(parse_nibble("0xE"), Ok(14));
        assert_eq!(parse_nibble("13"), Ok(13));
        assert!(parse_nibble("16").is_err());
        assert!(parse_nibble("0x1f").is_err());
        assert!(parse_nibble("e").is_err());
    }

    #[test]
    fn probe_arguments() {
        let cli = Cli::parse_from(["wd", "--sim", "probe", "--backing", "heap", "--wait-ms", "20"]);
        assert!(cli.sim);
        match cli.command {
            Cmd::Probe { backing, wait_ms, sequence, .. } => {
                assert_eq!(backing, Backing::Heap);
                assert_eq!(wait_ms, Some(20));
                assert_eq!(sequence, 1);
            }
            _ => panic!("expected probe"),
        }
    }

    #[test]
    fn sim_conflicts_with_pci() {
        assert!(Cli::try_parse_from(["wd", "--sim", "--pci", "0000:00:1d.0", "status"]).is_err());
    }
}
