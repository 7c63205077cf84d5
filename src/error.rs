//! Error types for serial connections.
//!
//! This module defines all error types that can occur while opening,
//! using and closing connections, plus configuration errors of the
//! command line client.

use smol_str::SmolStr;
use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum SerialError {
   /// The transport could not establish a stream to the address.
   #[error("Failed to connect to {address}: {source}")]
   Connect {
      address: SmolStr,
      #[source]
      source: std::io::Error,
   },

   /// An operation was attempted on a closed connection.
   #[error("Connection closed")]
   ConnectionClosed,

   /// The peer ended the stream while it was being read.
   #[error("Connection lost")]
   ConnectionLost,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid address: {0:?}")]
   InvalidAddress(String),

   #[error("Unknown charset: {0}")]
   UnknownCharset(String),

   #[error("Send task panicked: {0}")]
   TaskPanicked(JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Request timeout")]
   RequestTimeout,
}

impl SerialError {
   /// Returns `true` for errors that report use of a closed connection.
   pub const fn is_closed(&self) -> bool {
      matches!(self, Self::ConnectionClosed)
   }
}

/// Convenience type alias for Results with `SerialError`.
pub type Result<T> = std::result::Result<T, SerialError>;
