//! Registry owning the open connections, keyed by address.
//!
//! The registry is the only place that creates and destroys connections. It
//! guarantees at most one live connection per address: concurrent opens of
//! the same address share a single transport attempt, while opens of
//! different addresses proceed independently.

use std::{collections::HashMap, sync::Arc};

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{runtime::Handle, sync::OnceCell};

use super::{charset::Charset, connection::Connection, interface::MessageInterface};
use crate::{
   dispatch::{DispatcherRef, Inline},
   error::{Result, SerialError},
   transport::{PairedDevice, Transport},
};

/// Slot of one address; empty while the first open is still connecting.
type Slot = Arc<OnceCell<Connection>>;

/// Opens, tracks and closes connections for a transport.
pub struct ConnectionRegistry<T: Transport> {
   transport: T,
   dispatcher: DispatcherRef,
   slots: parking_lot::Mutex<HashMap<SmolStr, Slot>>,
}

impl<T: Transport> ConnectionRegistry<T> {
   /// Creates a registry whose interfaces run callbacks inline.
   pub fn new(transport: T) -> Self {
      Self::with_dispatcher(transport, Arc::new(Inline))
   }

   /// Creates a registry whose interfaces deliver callbacks through `dispatcher`.
   pub fn with_dispatcher(transport: T, dispatcher: DispatcherRef) -> Self {
      Self {
         transport,
         dispatcher,
         slots: parking_lot::Mutex::new(HashMap::new()),
      }
   }

   pub fn transport(&self) -> &T {
      &self.transport
   }

   /// Devices the transport knows about.
   pub async fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
      Ok(self.transport.paired_devices().await?)
   }

   /// Opens `address` using UTF-8.
   pub async fn open_default(&self, address: &str) -> Result<Connection> {
      self.open(address, Charset::default()).await
   }

   /// Opens a connection to `address`, or returns the live one.
   ///
   /// A connection that is already open is returned as is, even if it was
   /// opened with another charset. A failed connect leaves no trace: the next
   /// open tries the transport again.
   pub async fn open(&self, address: &str, charset: Charset) -> Result<Connection> {
      if address.is_empty() {
         return Err(SerialError::InvalidAddress(address.to_string()));
      }
      let key = SmolStr::new(address);

      loop {
         let slot = self.slots.lock().entry(key.clone()).or_default().clone();

         let res = slot
            .get_or_try_init(|| self.connect(&key, charset))
            .await
            .cloned();

         let conn = match res {
            Ok(conn) => conn,
            Err(e) => {
               self.remove_slot(&key, &slot);
               return Err(e);
            },
         };

         // Closed directly rather than through the registry.
         if conn.is_closed() {
            debug!("Discarding closed connection to {key}");
            self.remove_slot(&key, &slot);
            continue;
         }

         if !self.holds_slot(&key, &slot) {
            // Closed through the registry while we were connecting.
            conn.close().await;
            return Err(SerialError::ConnectionClosed);
         }
         return Ok(conn);
      }
   }

   async fn connect(&self, address: &SmolStr, charset: Charset) -> Result<Connection> {
      info!("Opening connection to {address} ({charset})");
      let stream = self.transport.connect(address).await.map_err(|source| {
         warn!("Failed to connect to {address}: {source}");
         SerialError::Connect {
            address: address.clone(),
            source,
         }
      })?;
      info!("Connected to {address}");
      Ok(Connection::new(
         address.clone(),
         charset,
         stream,
         Handle::current(),
         self.dispatcher.clone(),
      ))
   }

   fn holds_slot(&self, key: &SmolStr, slot: &Slot) -> bool {
      self
         .slots
         .lock()
         .get(key)
         .is_some_and(|s| Arc::ptr_eq(s, slot))
   }

   fn remove_slot(&self, key: &SmolStr, slot: &Slot) {
      let mut slots = self.slots.lock();
      if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
         slots.remove(key);
      }
   }

   /// Gets the live connection to `address`, if any.
   pub fn get(&self, address: &str) -> Option<Connection> {
      self
         .slots
         .lock()
         .get(address)
         .and_then(|slot| slot.get().cloned())
         .filter(|conn| !conn.is_closed())
   }

   /// Number of addresses with an open or opening connection.
   pub fn len(&self) -> usize {
      self.slots.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Closes the connection to `address`. Unknown addresses are ignored.
   pub async fn close(&self, address: &str) {
      let slot = self.slots.lock().remove(address);
      match slot.as_ref().and_then(|slot| slot.get()) {
         Some(conn) => conn.close().await,
         None => debug!("No open connection to {address}"),
      }
   }

   pub async fn close_connection(&self, connection: &Connection) {
      self.close(connection.address()).await;
      // Not necessarily the registered instance.
      connection.close().await;
   }

   /// Closes the connection `interface` belongs to.
   pub async fn close_interface(&self, interface: &MessageInterface) {
      self.close(interface.address()).await;
   }

   /// Closes every connection and empties the registry.
   pub async fn close_all(&self) {
      let slots: Vec<_> = self.slots.lock().drain().collect();
      info!("Closing {} connection(s)", slots.len());
      for (address, slot) in slots {
         let Some(conn) = slot.get() else {
            continue;
         };
         // A panicking teardown must not keep the others open.
         let conn = conn.clone();
         if let Err(e) = tokio::spawn(async move { conn.close().await }).await {
            warn!("Failed to close connection to {address}: {e}");
         }
      }
   }
}
