//! Transports producing duplex byte streams.
//!
//! The connection core never creates sockets itself. A [`Transport`] turns an
//! opaque address string into a connected stream; this module ships a TCP
//! dialer and, with the `bluetooth` feature, an RFCOMM dialer.

use std::{
   future::{self, Future},
   io,
};

use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncWrite};

#[cfg(feature = "bluetooth")]
pub mod rfcomm;
pub mod tcp;

/// A device the host already knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
   pub address: SmolStr,
   pub name: SmolStr,
}

/// Capability to open a duplex byte stream to an address.
pub trait Transport: Send + Sync + 'static {
   type Stream: AsyncRead + AsyncWrite + Send + 'static;

   /// Connects to `address`.
   ///
   /// The address is passed through as given. Implementations do not retry.
   fn connect(&self, address: &str) -> impl Future<Output = io::Result<Self::Stream>> + Send;

   /// Devices known to the host, not restricted to serial devices.
   fn paired_devices(&self) -> impl Future<Output = io::Result<Vec<PairedDevice>>> + Send {
      future::ready(Ok(Vec::new()))
   }
}
