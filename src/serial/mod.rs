//! Line-oriented serial connections.
//!
//! [`ConnectionRegistry`] opens at most one [`Connection`] per address. A
//! connection turns its byte stream into newline-delimited text: outbound
//! through [`Connection::send`], inbound through [`Connection::subscribe`].
//! [`MessageInterface`] wraps both directions behind callbacks.

pub mod charset;
pub mod connection;
pub mod framing;
pub mod interface;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use charset::Charset;
pub use connection::{Connection, LineStream, SendOutcome, WeakConnection};
pub use interface::{ErrorCallback, Listeners, MessageCallback, MessageInterface};
pub use registry::ConnectionRegistry;
