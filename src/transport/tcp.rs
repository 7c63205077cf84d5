//! TCP dialer.

use std::io;

use log::debug;
use tokio::net::TcpStream;

use super::{PairedDevice, Transport};
use crate::config::KnownDevice;

/// Connects to `host:port` addresses.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
   known_devices: Vec<PairedDevice>,
}

impl TcpTransport {
   pub fn new() -> Self {
      Self::default()
   }

   /// Reports `devices` as the paired devices of this transport.
   pub fn with_known_devices<'a>(mut self, devices: impl IntoIterator<Item = &'a KnownDevice>) -> Self {
      self.known_devices = devices
         .into_iter()
         .map(|d| PairedDevice {
            address: d.address.as_str().into(),
            name: d.name.as_str().into(),
         })
         .collect();
      self
   }
}

impl Transport for TcpTransport {
   type Stream = TcpStream;

   async fn connect(&self, address: &str) -> io::Result<TcpStream> {
      debug!("Connecting to {address} over TCP");
      let stream = TcpStream::connect(address).await?;
      stream.set_nodelay(true)?;
      Ok(stream)
   }

   async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
      Ok(self.known_devices.clone())
   }
}
