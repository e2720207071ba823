// SPDX-License-Identifier: AGPL-3.0-only

//! Counter registry and snapshot protocol
//!
//! The shell's counters free-run. A snapshot latches all of them in one
//! cycle; reads return the latched copy. Two readings are only comparable if
//! they were taken after the same [`CounterRegistry::snapshot`] and before
//! the next one. The registry does not police that ordering. Callers either
//! sequence it themselves or use [`CounterRegistry::read_all`], which does
//! both steps.

use crate::error::Result;
use std::fmt::Debug;
use wd_chip::counters::{CounterDesc, SNAPSHOT_COUNTERS};

/// Transport for the counter snapshot trigger and latched read-out.
pub trait CounterPort: Debug + Send {
    /// Latch every counter simultaneously.
    ///
    /// # Errors
    ///
    /// Returns error if the trigger cannot be written.
    fn snapshot(&mut self) -> Result<()>;

    /// Read the latched value of counter `index`.
    ///
    /// # Errors
    ///
    /// Returns error if the index is not decoded or the read fails.
    fn read_counter(&mut self, index: u8) -> Result<u32>;
}

impl<P: CounterPort + ?Sized> CounterPort for Box<P> {
    fn snapshot(&mut self) -> Result<()> {
        (**self).snapshot()
    }

    fn read_counter(&mut self, index: u8) -> Result<u32> {
        (**self).read_counter(index)
    }
}

/// A labelled counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    /// Table entry.
    pub desc: CounterDesc,
    /// Latched value.
    pub value: u32,
}

/// Named counters over a [`CounterPort`].
#[derive(Debug)]
pub struct CounterRegistry<P> {
    port: P,
    table: &'static [CounterDesc],
    snapshots: u64,
}

impl<P: CounterPort> CounterRegistry<P> {
    /// Registry over the standard pipeline counter table.
    pub const fn new(port: P) -> Self {
        Self::with_table(port, SNAPSHOT_COUNTERS)
    }

    /// Registry over a custom table.
    pub const fn with_table(port: P, table: &'static [CounterDesc]) -> Self {
        Self {
            port,
            table,
            snapshots: 0,
        }
    }

    /// Presentation table.
    pub const fn table(&self) -> &'static [CounterDesc] {
        self.table
    }

    /// Number of snapshots issued through this registry.
    pub const fn snapshots(&self) -> u64 {
        self.snapshots
    }

    /// Latch all counters.
    ///
    /// # Errors
    ///
    /// Returns error if the port rejects the trigger.
    pub fn snapshot(&mut self) -> Result<()> {
        self.port.snapshot()?;
        self.snapshots += 1;
        tracing::debug!("Counter snapshot #{}", self.snapshots);
        Ok(())
    }

    /// Latched value of one counter. Not consistent with other readings
    /// unless taken under the same snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the port read fails.
    pub fn read_counter(&mut self, index: u8) -> Result<u32> {
        self.port.read_counter(index)
    }

    /// Snapshot, then read every table entry.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot or any read fails.
    pub fn read_all(&mut self) -> Result<Vec<CounterReading>> {
        self.snapshot()?;
        let table = self.table;
        table
            .iter()
            .map(|&desc| {
                Ok(CounterReading {
                    desc,
                    value: self.port.read_counter(desc.index)?,
                })
            })
            .collect()
    }

    /// Borrow the port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Give back the port.
    pub fn into_inner(self) -> P {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WdError;
    use wd_chip::counters;

    /// Counters that advance on every read unless latched.
    #[derive(Debug, Default)]
    struct TickingPort {
        live: [u32; 32],
        latched: Option<[u32; 32]>,
    }

    impl TickingPort {
        fn tick(&mut self) {
            for (i, c) in self.live.iter_mut().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let step = i as u32 + 1;
                *c = c.wrapping_add(step);
            }
        }
    }

    impl CounterPort for TickingPort {
        fn snapshot(&mut self) -> Result<()> {
            self.latched = Some(self.live);
            Ok(())
        }

        fn read_counter(&mut self, index: u8) -> Result<u32> {
            let table = self.latched.unwrap_or(self.live);
            let v = *table
                .get(usize::from(index))
                .ok_or_else(|| WdError::invalid_request("index"))?;
            self.tick();
            Ok(v)
        }
    }

    #[test]
    fn readings_under_one_snapshot_share_an_instant() {
        let mut reg = CounterRegistry::new(TickingPort::default());
        for _ in 0..5 {
            let _ = reg.read_counter(1).unwrap();
        }
        reg.snapshot().unwrap();
        let a = reg.read_counter(counters::PAD_IN).unwrap();
        let b = reg.read_counter(counters::PAD_OUT).unwrap();
        // counter i advances by i+1 per tick: after 5 ticks, c1 = 10, c2 = 15
        assert_eq!(a, 10);
        assert_eq!(b, 15);
        assert_eq!(a / 2, b / 3, "both readings must reflect tick 5");
    }

    #[test]
    fn live_readings_drift() {
        let mut port = TickingPort::default();
        let a = port.read_counter(1).unwrap();
        let b = port.read_counter(1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn read_all_snapshots_first() {
        let mut reg = CounterRegistry::new(TickingPort::default());
        let _ = reg.read_counter(3).unwrap();
        let _ = reg.read_counter(3).unwrap();
        let all = reg.read_all().unwrap();
        assert_eq!(reg.snapshots(), 1);
        assert_eq!(all.len(), counters::SNAPSHOT_COUNTERS.len());
        for r in &all {
            // two ticks before the snapshot
            assert_eq!(r.value, 2 * (u32::from(r.desc.index) + 1), "{}", r.desc.label);
        }
    }

    #[test]
    fn port_errors_propagate() {
        let mut reg = CounterRegistry::new(TickingPort::default());
        assert!(reg.read_counter(40).is_err());
    }
}
