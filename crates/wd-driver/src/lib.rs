// SPDX-License-Identifier: AGPL-3.0-only

//! Host driver for the Wiredancer ED25519 shell on AWS F1.
//!
//! Everything the host needs to talk to the shell and see its results:
//!
//! ```text
//! SidebandChannel ── Session ── SidebandPort   (MmioPort | SimSidebandPort)
//!       │
//!       ├─ assembler: 32/64-bit values from addressed bytes
//!       └─ PcimProbe: captured AW address, BRESP, handshake bits, counters
//!
//! CounterRegistry ── CounterPort               (MmioCounterPort | SimCounterPort)
//!
//! PinnedBuffer + RingLayout ── CompletionDetector ── VisibilityBarrier
//!
//! WorkSubmitter                                (SimulatedShell | external)
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wd_driver::prelude::*;
//!
//! # fn main() -> wd_driver::Result<()> {
//! let mut shell = SimulatedShell::new();
//! let ring = RingLayout::default();
//! let buffer = Arc::new(PinnedBuffer::allocate(ring.bytes(), 4096, Backing::Heap)?);
//! shell.attach_ring(Arc::clone(&buffer), ring)?;
//!
//! let msg = [0u8; 64];
//! shell.submit(&VerifyRequest::new(&msg, &[0; 64], &[0; 32], 1))?;
//! shell.complete_pending()?;
//!
//! let written = CompletionDetector::new().poll(&*buffer, ring.slot_range(1))?;
//! assert!(written);
//!
//! let channel = SidebandChannel::new(shell.sideband_port());
//! println!("{}", PcimProbe::new(&channel).report()?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod assembler;
pub mod backends;
pub mod barrier;
pub mod channel;
pub mod completion;
pub mod config;
pub mod counters;
pub mod discovery;
mod error;
pub mod loopback;
pub mod pcim;
pub mod ring;
pub mod submit;

pub use assembler::Wide;
pub use backends::{F1Device, MappedBar, MmioCounterPort, MmioPort, ResultRecord, SimulatedShell};
pub use barrier::{platform_barrier, CacheLineFlush, FenceOnly, VisibilityBarrier};
pub use channel::{Reply, Session, SidebandChannel, SidebandPort, StatusRead};
pub use completion::{CompletionDetector, HostMemory, NonZeroChunks};
pub use config::{ChannelConfig, PollConfig};
pub use counters::{CounterPort, CounterReading, CounterRegistry};
pub use discovery::{discover, SlotInfo};
pub use error::{Result, WdError};
pub use loopback::{Loopback, LoopbackReport, ProbeConfig};
pub use pcim::{hexdump, HandshakeBits, PcimProbe, PcimReport};
pub use ring::{Backing, PinnedBuffer, RingLayout};
pub use submit::{VerifyRequest, WorkSubmitter};

/// Silicon model (re-exported from wd-chip).
pub use wd_chip as chip;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Backing, ChannelConfig, CompletionDetector, CounterRegistry, HostMemory, PcimProbe,
        PinnedBuffer, PollConfig, Result, RingLayout, SidebandChannel, SimulatedShell,
        VerifyRequest, WdError, WorkSubmitter,
    };
}
