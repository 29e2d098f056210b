//! Sender and receiver data buffers.

pub mod recv;
pub mod send;

pub use recv::{InsertOutcome, Message, RecvBuffer};
pub use send::{BlockMeta, RetransRead, SendBuffer};
