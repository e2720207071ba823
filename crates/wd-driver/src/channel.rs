// SPDX-License-Identifier: AGPL-3.0-only

//! Sideband register channel
//!
//! Addressed single-byte reads over the 16-bit command/status pair. The
//! shell holds exactly one command at a time and answers by echoing it in
//! the status word, so a read is: write command, poll status until the echo
//! matches, take the byte.
//!
//! The command/status pair is a single shared resource. [`SidebandChannel`]
//! owns the transport behind a mutex and hands out a [`Session`] that keeps
//! it locked across the whole write → poll → read sequence (and across every
//! byte of a composite value when used through the assembler).
//!
//! Timeouts are soft. [`Session::read_byte`] returns zero when the echo never
//! arrives; [`Session::transact`] returns the distinguishable [`Reply`] for
//! callers that need to tell "no answer" from a real zero.

use crate::config::ChannelConfig;
use crate::error::Result;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use wd_chip::sideband::{Command, Status};

/// Transport for the sideband command/status register pair.
///
/// Implementations address one FPGA slot; the slot is fixed at construction.
pub trait SidebandPort: Debug + Send {
    /// Write the 16-bit command register.
    ///
    /// # Errors
    ///
    /// Returns error if the register cannot be written.
    fn set_command(&mut self, value: u16) -> Result<()>;

    /// Read the 16-bit status register.
    ///
    /// # Errors
    ///
    /// Returns error if the register cannot be read.
    fn get_status(&mut self) -> Result<u16>;
}

impl<P: SidebandPort + ?Sized> SidebandPort for Box<P> {
    fn set_command(&mut self, value: u16) -> Result<()> {
        (**self).set_command(value)
    }

    fn get_status(&mut self) -> Result<u16> {
        (**self).get_status()
    }
}

/// Outcome of one addressed byte read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The shell echoed the command and returned this byte.
    Byte(u8),
    /// The echo never matched within the attempt budget.
    NoResponse {
        /// Status reads performed.
        attempts: u32,
    },
    /// The transport failed while writing or polling.
    PortFailed,
}

impl Reply {
    /// Byte value, with every failure collapsed to zero.
    #[must_use]
    pub const fn or_zero(self) -> u8 {
        match self {
            Self::Byte(b) => b,
            Self::NoResponse { .. } | Self::PortFailed => 0,
        }
    }

    /// Byte value if the shell answered.
    #[must_use]
    pub const fn byte(self) -> Option<u8> {
        match self {
            Self::Byte(b) => Some(b),
            Self::NoResponse { .. } | Self::PortFailed => None,
        }
    }

    /// Whether the shell answered.
    #[must_use]
    pub const fn is_answered(self) -> bool {
        matches!(self, Self::Byte(_))
    }
}

/// One status register sample, checked against the last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRead {
    /// Decoded status word.
    pub status: Status,
    /// Whether the status echoes the last command written in this session.
    pub ready: bool,
}

/// Exclusive owner of a sideband transport.
#[derive(Debug)]
pub struct SidebandChannel<P> {
    port: Mutex<P>,
    config: ChannelConfig,
}

impl<P: SidebandPort> SidebandChannel<P> {
    /// Wrap a transport with the default timing.
    pub fn new(port: P) -> Self {
        Self::with_config(port, ChannelConfig::default())
    }

    /// Wrap a transport with explicit timing.
    pub const fn with_config(port: P, config: ChannelConfig) -> Self {
        Self {
            port: Mutex::new(port),
            config,
        }
    }

    /// Timing in use.
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Acquire the channel. Blocks while another session is open.
    pub fn session(&self) -> Session<'_, P> {
        // A panic mid-transaction leaves at worst a stale command latched,
        // which the next echo comparison filters out.
        let port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        Session {
            port,
            config: &self.config,
            last: None,
        }
    }

    /// One-shot byte read; zero on timeout.
    pub fn read_byte(&self, command: Command) -> u8 {
        self.session().read_byte(command)
    }

    /// One-shot byte read with a distinguishable timeout.
    pub fn transact(&self, command: Command) -> Reply {
        self.session().transact(command)
    }

    /// Sample the status register without issuing a command.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be read.
    pub fn raw_status(&self) -> Result<Status> {
        self.session().raw_status()
    }

    /// Give back the transport.
    pub fn into_inner(self) -> P {
        self.port.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Locked access to the sideband pair.
///
/// Dropping the session releases the channel.
#[derive(Debug)]
pub struct Session<'a, P> {
    port: MutexGuard<'a, P>,
    config: &'a ChannelConfig,
    last: Option<Command>,
}

impl<P: SidebandPort> Session<'_, P> {
    /// Latch a command. The data byte of the command word is always zero.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be written.
    pub fn write_command(&mut self, command: Command) -> Result<()> {
        self.port.set_command(command.encode())?;
        self.last = Some(command);
        Ok(())
    }

    /// Sample the status register and compare its echo with the last command.
    ///
    /// `ready` is false until the shell has echoed the command written by
    /// [`Self::write_command`] in this session.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be read.
    pub fn read_status(&mut self) -> Result<StatusRead> {
        let status = Status::decode(self.port.get_status()?);
        let ready = self.last.is_some_and(|cmd| status.echoes(cmd));
        Ok(StatusRead { status, ready })
    }

    /// Full addressed read: write, poll for the echo, return the byte.
    pub fn transact(&mut self, command: Command) -> Reply {
        if let Err(e) = self.write_command(command) {
            tracing::warn!("Sideband write failed ({command}): {e}");
            return Reply::PortFailed;
        }

        for attempt in 0..self.config.max_attempts {
            match self.read_status() {
                Ok(StatusRead { status, ready: true }) => {
                    tracing::trace!("Sideband {command} -> {:#04x} after {} polls", status.byte, attempt + 1);
                    return Reply::Byte(status.byte);
                }
                Ok(StatusRead { ready: false, .. }) => {}
                Err(e) => {
                    tracing::warn!("Sideband status read failed ({command}): {e}");
                    return Reply::PortFailed;
                }
            }
            if !self.config.poll_interval.is_zero() {
                std::thread::sleep(self.config.poll_interval);
            }
        }

        tracing::warn!(
            "Sideband {command}: no echo after {} attempts",
            self.config.max_attempts
        );
        Reply::NoResponse {
            attempts: self.config.max_attempts,
        }
    }

    /// Addressed read with the diagnostic soft-fail policy: zero on timeout.
    pub fn read_byte(&mut self, command: Command) -> u8 {
        self.transact(command).or_zero()
    }

    /// Sample the status register without issuing a command.
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be read.
    pub fn raw_status(&mut self) -> Result<Status> {
        Ok(Status::decode(self.port.get_status()?))
    }

    /// Last command written in this session.
    pub const fn last_command(&self) -> Option<Command> {
        self.last
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::WdError;
    use std::collections::HashMap;
    use std::time::Duration;
    use wd_chip::sideband::Function;

    /// Register file double: answers `(func, sel)` from a map after
    /// `latency` stale polls.
    #[derive(Debug, Default)]
    pub(crate) struct MapPort {
        pub values: HashMap<(u8, u8), u8>,
        pub latency: u32,
        pub silent: bool,
        pub fail_status: bool,
        pub commands: Vec<u16>,
        latched: Option<u16>,
        stale: u16,
        polls: u32,
    }

    impl MapPort {
        pub(crate) fn with(values: &[((u8, u8), u8)]) -> Self {
            Self {
                values: values.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl SidebandPort for MapPort {
        fn set_command(&mut self, value: u16) -> Result<()> {
            self.commands.push(value);
            self.latched = Some(value);
            self.polls = 0;
            Ok(())
        }

        fn get_status(&mut self) -> Result<u16> {
            if self.fail_status {
                return Err(WdError::transport("status read failed"));
            }
            let Some(cmd) = self.latched else {
                return Ok(self.stale);
            };
            if self.silent || self.polls < self.latency {
                self.polls += 1;
                return Ok(self.stale);
            }
            let c = Command::decode(cmd);
            let byte = self
                .values
                .get(&(c.function().code(), c.selector()))
                .copied()
                .unwrap_or(0);
            self.stale = (u16::from(byte) << 8) | cmd;
            Ok(self.stale)
        }
    }

    fn fast() -> ChannelConfig {
        ChannelConfig::default().with_poll_interval(Duration::ZERO)
    }

    fn cmd(f: Function, s: u8) -> Command {
        Command::new(f, s).unwrap()
    }

    #[test]
    fn reads_echoed_byte() {
        let port = MapPort::with(&[((0xD, 1), 0x5A)]);
        let ch = SidebandChannel::with_config(port, fast());
        assert_eq!(ch.read_byte(cmd(Function::HANDSHAKE, 1)), 0x5A);
        assert_eq!(ch.into_inner().commands, vec![0x001D]);
    }

    #[test]
    fn stale_status_is_filtered_by_echo() {
        let mut port = MapPort::with(&[((0x0, 2), 0x22), ((0x0, 3), 0x33)]);
        port.latency = 5;
        let ch = SidebandChannel::with_config(port, fast());
        let mut s = ch.session();
        assert_eq!(s.read_byte(cmd(Function::STATUS_PAGE, 2)), 0x22);
        // The status register still shows sel 2 while sel 3 is pending.
        assert_eq!(s.read_byte(cmd(Function::STATUS_PAGE, 3)), 0x33);
    }

    #[test]
    fn ready_false_until_echo() {
        let mut port = MapPort::with(&[((0xE, 0), 0x10)]);
        port.latency = 1;
        let ch = SidebandChannel::with_config(port, fast());
        let mut s = ch.session();
        s.write_command(cmd(Function::AW_ADDRESS, 0)).unwrap();
        assert!(!s.read_status().unwrap().ready);
        let st = s.read_status().unwrap();
        assert!(st.ready);
        assert_eq!(st.status.byte, 0x10);
    }

    #[test]
    fn no_command_means_not_ready() {
        let ch = SidebandChannel::with_config(MapPort::default(), fast());
        assert!(!ch.session().read_status().unwrap().ready);
    }

    #[test]
    fn timeout_soft_fails_to_zero() {
        let mut port = MapPort::with(&[((0x0, 0), 0xFF)]);
        port.silent = true;
        let ch = SidebandChannel::with_config(port, fast().with_max_attempts(7));
        let c = cmd(Function::STATUS_PAGE, 0);
        assert_eq!(ch.transact(c), Reply::NoResponse { attempts: 7 });
        assert_eq!(ch.read_byte(c), 0);
    }

    #[test]
    fn failing_status_ends_poll() {
        let mut port = MapPort::default();
        port.fail_status = true;
        let ch = SidebandChannel::with_config(port, fast());
        let reply = ch.transact(cmd(Function::STATUS_PAGE, 0));
        assert_eq!(reply, Reply::PortFailed);
        assert_eq!(reply.or_zero(), 0);
        assert!(reply.byte().is_none());
    }

    #[test]
    fn true_zero_is_distinguishable() {
        let ch = SidebandChannel::with_config(MapPort::default(), fast());
        let reply = ch.transact(cmd(Function::WRITE_STROBE, 0));
        assert_eq!(reply, Reply::Byte(0));
        assert!(reply.is_answered());
    }
}
