// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated accelerator shell
//!
//! An in-process model of the shell's host-visible surface, close enough
//! that the loop-back check, the CLI and the benches run without an FPGA:
//!
//! - **Sideband**: answers the function map (status page, PCIM counters,
//!   handshake bits, captured AW address, write strobe) with a configurable
//!   echo latency. Until the echo lands the status register keeps showing
//!   the previous answer, exactly like the real pair.
//! - **Counters**: free-running pipeline counters that drift on every read
//!   unless latched by a snapshot.
//! - **Work submission**: accepts verify requests and, on completion, writes
//!   a 32-byte [`ResultRecord`] into the ring slot, updating the PCIM
//!   capture registers as a real AXI write would.
//!
//! Completions happen on [`SimulatedShell::complete_pending`], or on a
//! background thread after [`SimulatedShell::with_completion_delay`].
//!
//! No verification is modelled. Every request completes with
//! [`RESULT_DONE`].

// Counters and capture registers are read out a byte at a time
#![allow(clippy::cast_possible_truncation)]

use crate::channel::SidebandPort;
use crate::counters::CounterPort;
use crate::error::{Result, WdError};
use crate::ring::{PinnedBuffer, RingLayout};
use crate::submit::{VerifyRequest, WorkSubmitter};
use bytemuck::{Pod, Zeroable};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use wd_chip::counters;
use wd_chip::ring::{CACHE_LINE, SLOT_BYTES};
use wd_chip::sideband::{handshake, Command, Function, STATUS_PAGE_LEN};

/// Bus address the simulated shell pretends the ring lives at when the
/// buffer's physical address is unknown.
pub const SIM_BUS_BASE: u64 = 0x0000_0001_0000_0000;

/// `status` value of a completed record.
pub const RESULT_DONE: u32 = 1;

/// PCIM handshake bits, MSB first: ar_valid, ar_ready, r_valid, r_ready,
/// aw_valid, aw_ready, w_valid, w_ready. Idle bus: only readies high.
const PCIM_IDLE: u8 = 0b0101_0101;

/// Result slot as written by the simulated shell.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ResultRecord {
    /// Request sequence number.
    pub sequence: u64,
    /// Completion status; non-zero once written.
    pub status: u32,
    /// Queue the request arrived on.
    pub lane: u8,
    /// Low byte of the request flags.
    pub flags: u8,
    reserved0: u16,
    /// Declared message length.
    pub message_len: u32,
    reserved1: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<ResultRecord>() == SLOT_BYTES);

impl ResultRecord {
    /// View a slot's bytes as a record.
    ///
    /// # Errors
    ///
    /// Returns error unless `bytes` is exactly one slot.
    pub fn from_slot(bytes: &[u8]) -> Result<Self> {
        bytemuck::try_pod_read_unaligned(bytes).map_err(|e| {
            WdError::invalid_request(format!("slot of {} bytes is not a record: {e}", bytes.len()))
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    sequence: u64,
    queue: u8,
    flags: u32,
    message_len: u32,
}

#[derive(Debug)]
struct ShellState {
    echo_latency: u32,
    latched_command: Option<u16>,
    polls: u32,
    status: u16,

    aw_address: u64,
    write_strobe: u64,
    bresp: u8,
    pcim_bits: u8,
    edges: [u32; 4],
    handshakes: [u32; 2],

    live: [u32; counters::MAX_INDEX as usize + 1],
    latched: Option<[u32; counters::MAX_INDEX as usize + 1]>,
    drift: u32,

    ring: Option<(Arc<PinnedBuffer>, RingLayout)>,
    bus_base: u64,
    pending: VecDeque<Pending>,
    submitted: u32,
    completed: u32,
    last_sequence: u64,
}

impl ShellState {
    fn new() -> Self {
        Self {
            echo_latency: 2,
            latched_command: None,
            polls: 0,
            status: 0,
            aw_address: 0,
            write_strobe: 0,
            bresp: 0,
            pcim_bits: PCIM_IDLE,
            edges: [0; 4],
            handshakes: [0; 2],
            live: [0; counters::MAX_INDEX as usize + 1],
            latched: None,
            drift: 1,
            ring: None,
            bus_base: SIM_BUS_BASE,
            pending: VecDeque::new(),
            submitted: 0,
            completed: 0,
            last_sequence: 0,
        }
    }

    fn status_page(&self) -> [u8; STATUS_PAGE_LEN] {
        let mut page = [0u8; STATUS_PAGE_LEN];
        page[0..2].copy_from_slice(b"WD");
        page[2] = 1;
        page[3] = u8::from(self.ring.is_some());
        page[4..8].copy_from_slice(&self.submitted.to_le_bytes());
        page[8..12].copy_from_slice(&self.completed.to_le_bytes());
        // low half of the sequence only
        let seq = self.last_sequence as u32;
        page[12..16].copy_from_slice(&seq.to_le_bytes());
        page
    }

    fn sideband_byte(&self, command: Command) -> u8 {
        let sel = command.selector();
        let group = usize::from(sel >> 2);
        let shift = u32::from(sel & 0x3) * 8;
        let byte_of = |v: u64, index: u8| v.to_le_bytes().get(usize::from(index)).copied().unwrap_or(0);
        match command.function() {
            Function::STATUS_PAGE => self.status_page()[usize::from(sel)],
            Function::HANDSHAKE_COUNTERS => self.handshakes.get(group).map_or(0, |v| (v >> shift) as u8),
            Function::EDGE_COUNTERS => self.edges.get(group).map_or(0, |v| (v >> shift) as u8),
            Function::HANDSHAKE => match sel {
                handshake::BRESP => self.bresp & handshake::BRESP_MASK,
                handshake::PCIM_BITS => self.pcim_bits,
                _ => 0,
            },
            Function::AW_ADDRESS => byte_of(self.aw_address, sel),
            Function::WRITE_STROBE => byte_of(self.write_strobe, sel),
            _ => 0,
        }
    }

    fn bump(&mut self, index: u8) {
        if let Some(c) = self.live.get_mut(usize::from(index)) {
            *c = c.wrapping_add(1);
        }
    }

    fn set(&mut self, index: u8, value: u32) {
        if let Some(c) = self.live.get_mut(usize::from(index)) {
            *c = value;
        }
    }

    fn queue_fill(&self) -> u32 {
        u32::try_from(self.pending.len()).unwrap_or(u32::MAX)
    }

    fn accept(&mut self, request: &VerifyRequest<'_>) -> Result<Option<Pending>> {
        let Some(depth) = self.ring.as_ref().map(|(_, layout)| layout.depth()) else {
            return Err(WdError::invalid_state("no result ring attached"));
        };
        request.validate()?;

        self.bump(counters::INPUT_COUNT);
        if self.pending.len() >= depth {
            self.bump(counters::INPUT_DROPS);
            tracing::warn!(
                "Simulated shell dropped seq {}: {} requests in flight",
                request.sequence,
                self.pending.len()
            );
            return Ok(None);
        }

        let pending = Pending {
            sequence: request.sequence,
            queue: request.queue,
            flags: request.flags,
            message_len: u32::try_from(request.message_len).unwrap_or(u32::MAX),
        };
        self.pending.push_back(pending);
        self.submitted = self.submitted.wrapping_add(1);
        self.last_sequence = request.sequence;
        self.bump(counters::PAD_IN);
        let fill = self.queue_fill();
        self.set(counters::INPUT_FIFO_FILL, fill);
        Ok(Some(pending))
    }

    /// Forget a request that will never complete.
    fn withdraw(&mut self, sequence: u64) {
        if self.take(sequence).is_some() {
            self.submitted = self.submitted.wrapping_sub(1);
            let fill = self.queue_fill();
            self.set(counters::INPUT_FIFO_FILL, fill);
        }
    }

    fn take(&mut self, sequence: u64) -> Option<Pending> {
        let at = self.pending.iter().position(|p| p.sequence == sequence)?;
        self.pending.remove(at)
    }

    fn complete(&mut self, p: Pending) -> Result<()> {
        let Some((buffer, layout)) = &self.ring else {
            return Err(WdError::invalid_state("ring detached with requests in flight"));
        };
        let offset = layout.slot_address(p.sequence);
        let record = ResultRecord {
            sequence: p.sequence,
            status: RESULT_DONE,
            lane: p.queue,
            flags: p.flags as u8,
            reserved0: 0,
            message_len: p.message_len,
            reserved1: [0; 12],
        };
        let bytes = bytemuck::bytes_of(&record);
        let len = bytes.len().min(layout.stride());
        buffer.store(offset, &bytes[..len])?;

        // One AW handshake and one W beat per result write.
        self.aw_address = self.bus_base + offset as u64;
        let lane_bits = if len >= 64 { u64::MAX } else { (1u64 << len) - 1 };
        self.write_strobe = lane_bits << (offset % CACHE_LINE);
        self.bresp = 0;
        self.pcim_bits = PCIM_IDLE;
        for e in &mut self.edges {
            *e = e.wrapping_add(1);
        }
        for h in &mut self.handshakes {
            *h = h.wrapping_add(1);
        }

        for index in [
            counters::PAD_OUT,
            counters::SHA_OUT,
            counters::SV0_OUT,
            counters::SV2_F,
            counters::SV2_OUT,
            counters::ECC_OUT,
            counters::RESULT_COUNT,
            counters::RESULT_DMA_COUNT,
        ] {
            self.bump(index);
        }
        let fill = self.queue_fill();
        self.set(counters::INPUT_FIFO_FILL, fill);
        self.completed = self.completed.wrapping_add(1);

        tracing::debug!(
            "Simulated completion seq={} -> slot {:#x} (bus {:#x})",
            p.sequence,
            offset,
            self.aw_address
        );
        Ok(())
    }
}

/// Shared handle to one simulated shell. Clones address the same shell.
#[derive(Debug, Clone)]
pub struct SimulatedShell {
    state: Arc<Mutex<ShellState>>,
    completion_delay: Option<Duration>,
}

impl Default for SimulatedShell {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(state: &Mutex<ShellState>) -> MutexGuard<'_, ShellState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedShell {
    /// Idle shell: two-poll echo latency, counters drifting by one per read,
    /// completions on demand.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ShellState::new())),
            completion_delay: None,
        }
    }

    /// Status polls before the echo of a new command appears.
    #[must_use]
    pub fn with_echo_latency(self, polls: u32) -> Self {
        lock(&self.state).echo_latency = polls;
        self
    }

    /// How far every live counter advances per counter read.
    #[must_use]
    pub fn with_counter_drift(self, step: u32) -> Self {
        lock(&self.state).drift = step;
        self
    }

    /// Complete each request on a background thread `delay` after submit.
    #[must_use]
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = Some(delay);
        self
    }

    /// Pretend the ring starts at `base` on the bus.
    #[must_use]
    pub fn with_bus_base(self, base: u64) -> Self {
        lock(&self.state).bus_base = base;
        self
    }

    /// Bus address of the attached ring.
    pub fn bus_base(&self) -> u64 {
        lock(&self.state).bus_base
    }

    /// Sideband transport for this shell.
    pub fn sideband_port(&self) -> SimSidebandPort {
        SimSidebandPort {
            state: Arc::clone(&self.state),
        }
    }

    /// Counter transport for this shell.
    pub fn counter_port(&self) -> SimCounterPort {
        SimCounterPort {
            state: Arc::clone(&self.state),
        }
    }

    /// Requests accepted but not yet written back.
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Write back every pending request, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the ring was detached or a slot write fails.
    pub fn complete_pending(&self) -> Result<usize> {
        let mut state = lock(&self.state);
        let mut done = 0;
        while let Some(p) = state.pending.pop_front() {
            if let Err(e) = state.complete(p) {
                state.pending.push_front(p);
                return Err(e);
            }
            done += 1;
        }
        Ok(done)
    }

    fn schedule(&self, sequence: u64, delay: Duration) -> Result<()> {
        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("wd-sim-dma".into())
            .spawn(move || {
                std::thread::sleep(delay);
                let mut state = lock(&state);
                if let Some(p) = state.take(sequence) {
                    if let Err(e) = state.complete(p) {
                        tracing::warn!("Simulated completion of seq {sequence} failed: {e}");
                    }
                }
            })
            .map(|_| ())
            .map_err(WdError::from)
    }
}

impl WorkSubmitter for SimulatedShell {
    fn attach_ring(&mut self, buffer: Arc<PinnedBuffer>, layout: RingLayout) -> Result<()> {
        layout.check_fits(&*buffer)?;
        let mut state = lock(&self.state);
        if !state.pending.is_empty() {
            return Err(WdError::invalid_state(format!(
                "{} requests still in flight",
                state.pending.len()
            )));
        }
        if let Some(base) = buffer.physical_address() {
            state.bus_base = base;
        }
        tracing::info!(
            "Simulated shell: ring of {} x {} bytes at {:p} (bus {:#x})",
            layout.depth(),
            layout.stride(),
            buffer.as_ptr(),
            state.bus_base
        );
        state.ring = Some((buffer, layout));
        Ok(())
    }

    fn submit(&mut self, request: &VerifyRequest<'_>) -> Result<()> {
        let accepted = lock(&self.state).accept(request)?;
        match (accepted, self.completion_delay) {
            (Some(p), Some(delay)) => self.schedule(p.sequence, delay).inspect_err(|e| {
                tracing::warn!("Simulated shell could not schedule seq {}: {e}", p.sequence);
                lock(&self.state).withdraw(p.sequence);
            }),
            _ => Ok(()),
        }
    }
}

/// [`SidebandPort`] into a [`SimulatedShell`].
#[derive(Debug, Clone)]
pub struct SimSidebandPort {
    state: Arc<Mutex<ShellState>>,
}

impl SidebandPort for SimSidebandPort {
    fn set_command(&mut self, value: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.latched_command = Some(value);
        state.polls = 0;
        Ok(())
    }

    fn get_status(&mut self) -> Result<u16> {
        let mut state = lock(&self.state);
        let Some(raw) = state.latched_command else {
            return Ok(state.status);
        };
        if state.polls < state.echo_latency {
            state.polls += 1;
            return Ok(state.status);
        }
        // Only the low byte of the command word is echoed.
        let command = Command::decode(raw);
        let byte = state.sideband_byte(command);
        state.status = (u16::from(byte) << 8) | command.encode();
        Ok(state.status)
    }
}

/// [`CounterPort`] into a [`SimulatedShell`].
#[derive(Debug, Clone)]
pub struct SimCounterPort {
    state: Arc<Mutex<ShellState>>,
}

impl CounterPort for SimCounterPort {
    fn snapshot(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        let live = state.live;
        state.latched = Some(live);
        Ok(())
    }

    fn read_counter(&mut self, index: u8) -> Result<u32> {
        let mut state = lock(&self.state);
        let view = state.latched.unwrap_or(state.live);
        let value = *view.get(usize::from(index)).ok_or_else(|| {
            WdError::invalid_request(format!(
                "counter {index} beyond window (max {})",
                counters::MAX_INDEX
            ))
        })?;
        let drift = state.drift;
        for c in &mut state.live {
            *c = c.wrapping_add(drift);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SidebandChannel;
    use crate::completion::HostMemory;
    use crate::config::ChannelConfig;
    use crate::counters::CounterRegistry;
    use crate::ring::Backing;

    fn ring(depth: usize) -> (Arc<PinnedBuffer>, RingLayout) {
        let layout = RingLayout::new(depth, SLOT_BYTES).unwrap();
        let buf = PinnedBuffer::allocate(layout.bytes(), 4096, Backing::Heap).unwrap();
        (Arc::new(buf), layout)
    }

    fn fast_channel(shell: &SimulatedShell) -> SidebandChannel<SimSidebandPort> {
        SidebandChannel::with_config(
            shell.sideband_port(),
            ChannelConfig::default().with_poll_interval(Duration::ZERO),
        )
    }

    #[test]
    fn record_is_one_slot() {
        let rec = ResultRecord::from_slot(&[0u8; 32]).unwrap();
        assert_eq!(rec.status, 0);
        assert!(ResultRecord::from_slot(&[0u8; 31]).is_err());
    }

    #[test]
    fn submit_without_ring_is_invalid_state() {
        let mut shell = SimulatedShell::new();
        let msg = [0u8; 64];
        let err = shell
            .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 1))
            .unwrap_err();
        assert!(matches!(err, WdError::InvalidState { .. }));
    }

    #[test]
    fn completion_writes_record_and_capture_registers() {
        let mut shell = SimulatedShell::new().with_bus_base(0x8000_0000);
        let (buf, layout) = ring(16);
        shell.attach_ring(Arc::clone(&buf), layout).unwrap();
        // a heap buffer may still resolve through pagemap when run as root
        let base = shell.bus_base();

        let msg = [0u8; 64];
        shell
            .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 17).with_queue(1))
            .unwrap();
        assert_eq!(shell.pending(), 1);
        assert_eq!(shell.complete_pending().unwrap(), 1);

        let mut slot = [0u8; 32];
        buf.load(32, &mut slot).unwrap();
        let rec = ResultRecord::from_slot(&slot).unwrap();
        assert_eq!(rec.sequence, 17);
        assert_eq!(rec.status, RESULT_DONE);
        assert_eq!(rec.lane, 1);
        assert_eq!(rec.flags, 0x3);
        assert_eq!(rec.message_len, 64);

        let ch = fast_channel(&shell);
        assert_eq!(ch.read_field64(Function::AW_ADDRESS).unwrap(), base + 32);
        assert_eq!(ch.read_field64(Function::WRITE_STROBE).unwrap(), 0xFFFF_FFFF_0000_0000);
        assert_eq!(ch.read_counter32(Function::EDGE_COUNTERS, 3).unwrap(), 1);
        assert_eq!(ch.read_counter32(Function::HANDSHAKE_COUNTERS, 0).unwrap(), 1);
    }

    #[test]
    fn echo_latency_shows_previous_status() {
        let shell = SimulatedShell::new().with_echo_latency(3);
        let mut port = shell.sideband_port();
        port.set_command(0x0010).unwrap();
        for _ in 0..3 {
            assert_eq!(port.get_status().unwrap(), 0);
        }
        // status page byte 1 is 'D'
        assert_eq!(port.get_status().unwrap(), (u16::from(b'D') << 8) | 0x0010);
    }

    #[test]
    fn snapshot_freezes_drifting_counters() {
        let shell = SimulatedShell::new().with_counter_drift(5);
        let mut reg = CounterRegistry::new(shell.counter_port());
        let live_a = reg.read_counter(counters::PAD_IN).unwrap();
        let live_b = reg.read_counter(counters::PAD_IN).unwrap();
        assert_eq!(live_b, live_a + 5);

        reg.snapshot().unwrap();
        let a = reg.read_counter(counters::PAD_IN).unwrap();
        let b = reg.read_counter(counters::PAD_IN).unwrap();
        assert_eq!(a, b);
        assert!(reg.read_counter(counters::MAX_INDEX + 1).is_err());
    }

    #[test]
    fn failed_completion_keeps_request_pending() {
        let mut shell = SimulatedShell::new();
        let (buf, layout) = ring(4);
        shell.attach_ring(buf, layout).unwrap();
        let msg = [0u8; 8];
        shell
            .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 2))
            .unwrap();

        let detached = lock(&shell.state).ring.take();
        assert!(shell.complete_pending().is_err());
        assert_eq!(shell.pending(), 1);

        lock(&shell.state).ring = detached;
        assert_eq!(shell.complete_pending().unwrap(), 1);
        assert_eq!(shell.pending(), 0);
    }

    #[test]
    fn withdrawn_request_leaves_no_trace_in_queue() {
        let mut shell = SimulatedShell::new().with_counter_drift(0);
        let (buf, layout) = ring(4);
        shell.attach_ring(buf, layout).unwrap();
        let msg = [0u8; 8];
        for seq in [5, 6] {
            shell
                .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], seq))
                .unwrap();
        }

        lock(&shell.state).withdraw(5);
        assert_eq!(shell.pending(), 1);
        let mut port = shell.counter_port();
        port.snapshot().unwrap();
        assert_eq!(port.read_counter(counters::INPUT_FIFO_FILL).unwrap(), 1);
        assert_eq!(shell.complete_pending().unwrap(), 1);
    }

    #[test]
    fn overflowing_queue_counts_drops() {
        let mut shell = SimulatedShell::new().with_counter_drift(0);
        let (buf, layout) = ring(2);
        shell.attach_ring(buf, layout).unwrap();
        let msg = [0u8; 8];
        for seq in 0..3 {
            shell
                .submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], seq))
                .unwrap();
        }
        assert_eq!(shell.pending(), 2);
        let mut port = shell.counter_port();
        port.snapshot().unwrap();
        assert_eq!(port.read_counter(counters::INPUT_COUNT).unwrap(), 3);
        assert_eq!(port.read_counter(counters::INPUT_DROPS).unwrap(), 1);
        assert_eq!(port.read_counter(counters::INPUT_FIFO_FILL).unwrap(), 2);
    }
}
