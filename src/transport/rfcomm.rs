//! Bluetooth RFCOMM dialer.
//!
//! Connects to the Serial Port Profile channel of a remote device through
//! BlueZ. Addresses are Bluetooth MAC addresses such as `AA:BB:CC:DD:EE:FF`.

use std::{io, str::FromStr};

use bluer::{
   Address, Session,
   rfcomm::{SocketAddr, Stream},
};
use log::{debug, warn};

use super::{PairedDevice, Transport};

/// RFCOMM channel most SPP devices listen on.
pub const DEFAULT_CHANNEL: u8 = 1;

/// Connects to RFCOMM channels of remote Bluetooth devices.
#[derive(Clone)]
pub struct RfcommTransport {
   channel: u8,
   session: Option<Session>,
}

impl RfcommTransport {
   pub const fn new(channel: u8) -> Self {
      Self {
         channel,
         session: None,
      }
   }

   /// Uses `session` to enumerate paired devices.
   pub fn with_session(mut self, session: Session) -> Self {
      self.session = Some(session);
      self
   }

   async fn collect_paired(session: &Session) -> bluer::Result<Vec<PairedDevice>> {
      let adapter = session.default_adapter().await?;
      let mut devices = Vec::new();
      for addr in adapter.device_addresses().await? {
         let device = adapter.device(addr)?;
         if !device.is_paired().await.unwrap_or(false) {
            continue;
         }
         let name = device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| addr.to_string());
         devices.push(PairedDevice {
            address: addr.to_string().into(),
            name: name.into(),
         });
      }
      Ok(devices)
   }
}

impl Default for RfcommTransport {
   fn default() -> Self {
      Self::new(DEFAULT_CHANNEL)
   }
}

/// Returns `true` if `address` parses as a Bluetooth MAC address.
pub fn is_bluetooth_address(address: &str) -> bool {
   Address::from_str(address).is_ok()
}

impl Transport for RfcommTransport {
   type Stream = Stream;

   async fn connect(&self, address: &str) -> io::Result<Stream> {
      let addr = Address::from_str(address).map_err(|_| {
         io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid Bluetooth address: {address}"),
         )
      })?;
      debug!("Connecting to {addr} on RFCOMM channel {}", self.channel);
      Stream::connect(SocketAddr::new(addr, self.channel)).await
   }

   async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
      let Some(session) = &self.session else {
         warn!("No Bluetooth session attached, cannot list paired devices");
         return Ok(Vec::new());
      };
      Self::collect_paired(session).await.map_err(io::Error::other)
   }
}
