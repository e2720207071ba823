// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios against the simulated shell
//!
//! Ring allocation, submission, completion write, detection and the PCIM
//! capture registers, all through the public API.

use std::sync::Arc;
use std::time::Duration;
use wd_driver::chip::counters;
use wd_driver::chip::sideband::Function;
use wd_driver::prelude::*;
use wd_driver::{Loopback, ProbeConfig, ResultRecord};

const MIB2: usize = 2 << 20;

fn heap_ring() -> (Arc<PinnedBuffer>, RingLayout) {
    let layout = RingLayout::new(1024, 32).unwrap();
    let buffer = PinnedBuffer::allocate(MIB2, 4096, Backing::Heap).unwrap();
    (Arc::new(buffer), layout)
}

fn fast_channel(shell: &SimulatedShell) -> SidebandChannel<wd_driver::backends::SimSidebandPort> {
    SidebandChannel::with_config(
        shell.sideband_port(),
        ChannelConfig::default().with_poll_interval(Duration::ZERO),
    )
}

fn detector() -> CompletionDetector {
    CompletionDetector::with_config(PollConfig::default().with_interval(Duration::from_micros(50)))
}

#[test]
fn slot_stays_zero_until_completion() {
    let mut shell = SimulatedShell::new();
    let (buffer, layout) = heap_ring();
    shell.attach_ring(Arc::clone(&buffer), layout).unwrap();

    let msg = [0u8; 64];
    shell
        .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 1))
        .unwrap();

    let slot = layout.slot_range(1);
    assert_eq!(slot, 32..64);
    let det = detector();
    assert!(!det.poll_for_write(&*buffer, slot.clone(), Duration::from_millis(2)).unwrap());

    assert_eq!(shell.complete_pending().unwrap(), 1);
    assert!(det.poll_for_write(&*buffer, slot.clone(), Duration::from_millis(5)).unwrap());

    let bytes = det.read_fresh(&*buffer, slot).unwrap();
    assert!(bytes.iter().any(|&b| b != 0));
    let record = ResultRecord::from_slot(&bytes).unwrap();
    assert_eq!(record.sequence, 1);

    // nothing else in the ring was touched
    let hits: Vec<_> = det.scan_nonzero(&*buffer, MIB2, 32).unwrap().collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, 32);
}

#[test]
fn sequence_wraps_onto_same_slot() {
    let mut shell = SimulatedShell::new();
    let (buffer, layout) = heap_ring();
    shell.attach_ring(Arc::clone(&buffer), layout).unwrap();

    let msg = [0u8; 16];
    shell
        .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 1 + 1024))
        .unwrap();
    shell.complete_pending().unwrap();

    let bytes = detector().read_fresh(&*buffer, layout.slot_range(1)).unwrap();
    let record = ResultRecord::from_slot(&bytes).unwrap();
    assert_eq!(record.sequence, 1025);
    assert_eq!(record.message_len, 16);
}

#[test]
fn background_completion_is_detected() {
    let mut shell = SimulatedShell::new().with_completion_delay(Duration::from_millis(2));
    let (buffer, layout) = heap_ring();
    shell.attach_ring(Arc::clone(&buffer), layout).unwrap();

    let msg = [0u8; 64];
    shell
        .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 7))
        .unwrap();
    assert!(detector()
        .poll_for_write(&*buffer, layout.slot_range(7), Duration::from_secs(5))
        .unwrap());
    assert_eq!(shell.pending(), 0);
}

#[test]
fn capture_registers_follow_the_write() {
    let mut shell = SimulatedShell::new();
    let (buffer, layout) = heap_ring();
    shell.attach_ring(Arc::clone(&buffer), layout).unwrap();
    let base = shell.bus_base();
    let ch = fast_channel(&shell);

    let before = PcimProbe::new(&ch).report().unwrap();
    assert_eq!(before.aw_address, 0);
    assert_eq!(before.handshakes.aw, 0);

    let msg = [0u8; 64];
    shell
        .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 3))
        .unwrap();
    shell.complete_pending().unwrap();

    let after = PcimProbe::new(&ch).report().unwrap();
    assert_eq!(after.aw_address, base + 96);
    assert_eq!(after.bresp, 0);
    assert_eq!(after.edges.awvalid, 1);
    assert_eq!(after.handshakes.w, 1);
    // slot 3 sits in the upper half of its cache line
    assert_eq!(after.write_strobe, 0xFFFF_FFFF_0000_0000);
    assert_eq!(&after.status_page[0..2], b"WD");
}

#[test]
fn counters_read_under_one_snapshot_agree() {
    let shell = SimulatedShell::new().with_counter_drift(3);
    let mut reg = CounterRegistry::new(shell.counter_port());
    reg.read_counter(counters::PAD_IN).unwrap();
    reg.read_counter(counters::PAD_IN).unwrap();
    let all = reg.read_all().unwrap();
    // Every live counter drifts by 3 per read, but the snapshot holds them.
    assert!(all.iter().all(|r| r.value == 6), "{all:?}");
    assert_eq!(all.len(), counters::SNAPSHOT_COUNTERS.len());
}

#[test]
fn loopback_against_simulated_shell() {
    let mut shell = SimulatedShell::new()
        .with_counter_drift(0)
        .with_completion_delay(Duration::from_millis(1));
    let ch = fast_channel(&shell);
    let mut counters_reg = CounterRegistry::new(shell.counter_port());
    let config = ProbeConfig {
        backing: Backing::Heap,
        dma_wait: Duration::from_secs(5),
        ..ProbeConfig::default()
    };

    let report = Loopback {
        channel: &ch,
        counters: &mut counters_reg,
        submitter: Some(&mut shell),
        poll: PollConfig::default(),
    }
    .run(&config)
    .unwrap();

    assert!(report.submitted);
    assert!(report.completed);
    assert_eq!(report.slot_offset, 32);
    assert_eq!(report.slot.len(), 32);
    assert!(report.slot.iter().any(|&b| b != 0));
    let input = report
        .counters
        .iter()
        .find(|r| r.desc.index == counters::INPUT_COUNT)
        .unwrap();
    assert_eq!(input.value, 1);
    assert_eq!(report.pcim.aw_address, 0);

    let after = PcimProbe::new(&ch).captured_aw_address().unwrap();
    assert_eq!(after, shell.bus_base() + 32);
}

#[test]
fn loopback_without_submitter_reports_zero_slot() {
    let shell = SimulatedShell::new();
    let ch = fast_channel(&shell);
    let mut counters_reg = CounterRegistry::new(shell.counter_port());
    let config = ProbeConfig {
        backing: Backing::Heap,
        dma_wait: Duration::from_millis(1),
        ..ProbeConfig::default()
    };

    let report = Loopback {
        channel: &ch,
        counters: &mut counters_reg,
        submitter: None,
        poll: PollConfig::default(),
    }
    .run(&config)
    .unwrap();

    assert!(!report.submitted);
    assert!(!report.completed);
    assert!(report.slot.iter().all(|&b| b == 0));
}

#[test]
fn concurrent_sessions_do_not_interleave() {
    let shell = SimulatedShell::new().with_echo_latency(4);
    let ch = fast_channel(&shell);
    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let page = PcimProbe::new(&ch).status_page();
                    assert_eq!(&page[0..3], &[b'W', b'D', 1]);
                }
            });
        }
    });
    let wide = ch.read_wide(Function::STATUS_PAGE, 0, 2).unwrap();
    assert_eq!(wide, u64::from(u16::from_le_bytes(*b"WD")));
}

#[test]
#[ignore] // Requires reserved hugepages
fn loopback_on_hugepage_ring() {
    let mut shell = SimulatedShell::new().with_completion_delay(Duration::from_millis(1));
    let ch = fast_channel(&shell);
    let mut counters_reg = CounterRegistry::new(shell.counter_port());
    let report = Loopback {
        channel: &ch,
        counters: &mut counters_reg,
        submitter: Some(&mut shell),
        poll: PollConfig::default(),
    }
    .run(&ProbeConfig::default())
    .unwrap();
    assert!(report.completed);
}
