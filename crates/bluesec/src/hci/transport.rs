//! Outbound HCI command delivery
//!
//! The security core never owns a controller connection. Commands are handed
//! to an [`HciTransport`] supplied by the host stack.

use crate::error::HciError;
use crate::hci::packet::HciCommand;
use std::collections::VecDeque;

/// Sink for HCI commands produced by the security core
pub trait HciTransport {
    /// Queue a command for the controller
    fn send_command(&mut self, command: HciCommand) -> Result<(), HciError>;
}

/// Transport that buffers commands until the host drains them
#[derive(Debug, Default)]
pub struct RecordingTransport {
    queue: VecDeque<HciCommand>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest pending command
    pub fn pop(&mut self) -> Option<HciCommand> {
        self.queue.pop_front()
    }

    /// Take all pending commands as raw packets
    pub fn drain_packets(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).map(|c| c.to_packet()).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl HciTransport for RecordingTransport {
    fn send_command(&mut self, command: HciCommand) -> Result<(), HciError> {
        tracing::trace!(opcode = command.opcode(), "queueing HCI command");
        self.queue.push_back(command);
        Ok(())
    }
}
