//! Transport-facing traits
//!
//! These describe the minimal asynchronous CAN transport the rest of the stack is built on.
//! A concrete `CanBus` (e.g. backed by socketcan) is an external collaborator; these traits are
//! the seam it plugs into.

use std::future::Future;

use crate::messages::CanMessage;

/// An async CAN frame sender
pub trait AsyncCanSender: Send {
    /// Send a message to the bus
    fn send(&mut self, msg: CanMessage) -> impl Future<Output = Result<(), CanMessage>> + Send;
}

/// An async CAN frame receiver
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: std::fmt::Debug + Send;

    /// Receive an available message immediately, without waiting
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// Wait for the next available message
    fn recv(&mut self) -> impl Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Drop any messages currently queued for receipt
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}
