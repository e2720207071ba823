// SPDX-License-Identifier: AGPL-3.0-only

//! Verify request submission
//!
//! The host hands the shell a verify request and a sequence number; the shell
//! eventually writes the 32-byte result into ring slot `sequence & (depth - 1)`.
//! How the request reaches the shell is the submitter's business. This crate
//! only defines the seam and the simulated implementation.

use crate::error::{Result, WdError};
use crate::ring::{PinnedBuffer, RingLayout};
use std::fmt::Debug;
use std::sync::Arc;

/// Flags used by the loop-back check: both lanes enabled.
pub const DEFAULT_FLAGS: u32 = 0x3;

/// Longest message the request descriptor can carry.
pub const MAX_MESSAGE_LEN: usize = 1232;

/// One verify request as seen by the submitter.
#[derive(Debug, Clone, Copy)]
pub struct VerifyRequest<'a> {
    /// Message bytes.
    pub message: &'a [u8],
    /// Signature.
    pub signature: &'a [u8; 64],
    /// Public key.
    pub public_key: &'a [u8; 32],
    /// Sequence number; selects the result slot.
    pub sequence: u64,
    /// Submission queue.
    pub queue: u8,
    /// Request flags.
    pub flags: u32,
    /// Declared message length.
    pub message_len: usize,
}

impl<'a> VerifyRequest<'a> {
    /// Request on queue 0 with [`DEFAULT_FLAGS`] and the full message length.
    pub const fn new(
        message: &'a [u8],
        signature: &'a [u8; 64],
        public_key: &'a [u8; 32],
        sequence: u64,
    ) -> Self {
        Self {
            message,
            signature,
            public_key,
            sequence,
            queue: 0,
            flags: DEFAULT_FLAGS,
            message_len: message.len(),
        }
    }

    /// Override the queue.
    #[must_use]
    pub const fn with_queue(mut self, queue: u8) -> Self {
        self.queue = queue;
        self
    }

    /// Override the flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Check the declared length against the message.
    ///
    /// # Errors
    ///
    /// Returns error if `message_len` exceeds the message or the descriptor
    /// limit.
    pub fn validate(&self) -> Result<()> {
        if self.message_len > self.message.len() {
            return Err(WdError::invalid_request(format!(
                "message_len {} exceeds message of {} bytes",
                self.message_len,
                self.message.len()
            )));
        }
        if self.message_len > MAX_MESSAGE_LEN {
            return Err(WdError::invalid_request(format!(
                "message_len {} exceeds limit {MAX_MESSAGE_LEN}",
                self.message_len
            )));
        }
        Ok(())
    }
}

/// Something that can move verify requests to the shell.
pub trait WorkSubmitter: Debug + Send {
    /// Tell the shell where results go. Must precede [`Self::submit`].
    ///
    /// # Errors
    ///
    /// Returns error if the ring does not fit the buffer or the shell
    /// rejects it.
    fn attach_ring(&mut self, buffer: Arc<PinnedBuffer>, layout: RingLayout) -> Result<()>;

    /// Queue one request.
    ///
    /// # Errors
    ///
    /// Returns error if no ring is attached or the request is malformed.
    fn submit(&mut self, request: &VerifyRequest<'_>) -> Result<()>;
}
