//! capbus transaction core.
//!
//! A sending peer constructs a [`Transaction`] from user input, links one
//! [`Message`] instance per destination, and commits the whole set
//! atomically with respect to the bus-wide causal order maintained by
//! per-peer logical clocks. See the module documentation of
//! [`transaction`] for the staged-commit protocol.

pub mod message;
pub mod transaction;

pub use message::Message;
pub use transaction::Transaction;
