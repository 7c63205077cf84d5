//! Callback-based message interface over a connection.
//!
//! A [`MessageInterface`] consumes the line stream of its connection in the
//! background and hands every line to the registered "message received"
//! callback. Outbound messages are confirmed through the "message sent"
//! callback; failures of either direction go to the error callback. Callbacks
//! run wherever the connection's [`Dispatcher`](crate::dispatch::Dispatcher)
//! puts them.

use core::fmt;
use std::sync::{
   Arc, Weak,
   atomic::{AtomicBool, Ordering},
};

use log::{debug, info};
use smol_str::SmolStr;
use tokio::task::JoinSet;

use super::connection::{Connection, LineStream, WeakConnection};
use crate::{
   dispatch::DispatcherRef,
   error::{Result, SerialError},
};

/// Callback receiving a message.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Callback receiving an error.
pub type ErrorCallback = Arc<dyn Fn(&SerialError) + Send + Sync>;

/// The callbacks of a message interface.
///
/// Each slot holds at most one callback; `None` means events of that kind are
/// dropped silently.
#[derive(Clone, Default)]
pub struct Listeners {
   pub on_message_received: Option<MessageCallback>,
   pub on_message_sent: Option<MessageCallback>,
   pub on_error: Option<ErrorCallback>,
}

impl Listeners {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn on_message_received<F>(mut self, f: F) -> Self
   where
      F: Fn(&str) + Send + Sync + 'static,
   {
      self.on_message_received = Some(Arc::new(f));
      self
   }

   pub fn on_message_sent<F>(mut self, f: F) -> Self
   where
      F: Fn(&str) + Send + Sync + 'static,
   {
      self.on_message_sent = Some(Arc::new(f));
      self
   }

   pub fn on_error<F>(mut self, f: F) -> Self
   where
      F: Fn(&SerialError) + Send + Sync + 'static,
   {
      self.on_error = Some(Arc::new(f));
      self
   }
}

impl fmt::Debug for Listeners {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Listeners")
         .field("on_message_received", &self.on_message_received.is_some())
         .field("on_message_sent", &self.on_message_sent.is_some())
         .field("on_error", &self.on_error.is_some())
         .finish()
   }
}

struct InterfaceInner {
   address: SmolStr,
   connection: WeakConnection,
   dispatcher: DispatcherRef,
   listeners: parking_lot::Mutex<Listeners>,
   tasks: parking_lot::Mutex<JoinSet<()>>,
   closed: AtomicBool,
}

impl InterfaceInner {
   fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   /// Queues `f` on the dispatcher with the listeners current at delivery time.
   fn deliver<F>(self: &Arc<Self>, f: F)
   where
      F: FnOnce(&Listeners) + Send + 'static,
   {
      let weak = Arc::downgrade(self);
      self.dispatcher.dispatch(Box::new(move || {
         let Some(inner) = weak.upgrade() else {
            return;
         };
         if inner.is_closed() {
            return;
         }
         let listeners = inner.listeners.lock().clone();
         f(&listeners);
      }));
   }

   fn deliver_error(self: &Arc<Self>, error: SerialError) {
      self.deliver(move |l| {
         if let Some(cb) = &l.on_error {
            cb(&error);
         }
      });
   }
}

/// Message-in / message-out view of a [`Connection`].
///
/// Obtained from [`Connection::to_interface`]. This type is cheaply
/// cloneable. Closing it stops message delivery but leaves the connection
/// open; closing the connection closes the interface.
#[derive(Clone)]
pub struct MessageInterface(Arc<InterfaceInner>);

impl fmt::Debug for MessageInterface {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("MessageInterface")
         .field("address", &self.0.address)
         .field("closed", &self.is_closed())
         .field("listeners", &*self.0.listeners.lock())
         .finish()
   }
}

impl MessageInterface {
   /// Creates the interface and starts consuming the connection's lines.
   pub(crate) fn start(conn: &Connection, dispatcher: DispatcherRef) -> Result<Self> {
      let lines = conn.subscribe()?;
      let this = Self(Arc::new(InterfaceInner {
         address: conn.address().clone(),
         connection: conn.downgrade(),
         dispatcher,
         listeners: parking_lot::Mutex::new(Listeners::default()),
         tasks: parking_lot::Mutex::new(JoinSet::new()),
         closed: AtomicBool::new(false),
      }));
      this
         .0
         .tasks
         .lock()
         .spawn_on(Self::pump(Arc::downgrade(&this.0), lines), conn.runtime());
      info!("Message interface started for {}", conn.address());
      Ok(this)
   }

   async fn pump(weak: Weak<InterfaceInner>, mut lines: LineStream) {
      while let Some(item) = lines.next_line().await {
         let Some(inner) = weak.upgrade() else {
            return;
         };
         match item {
            Ok(line) => inner.deliver(move |l| {
               if let Some(cb) = &l.on_message_received {
                  cb(&line);
               }
            }),
            Err(e) => inner.deliver_error(e),
         }
      }
      if let Some(inner) = weak.upgrade() {
         debug!("Message stream of {} ended", inner.address);
      }
   }

   /// Gets the address of the underlying connection.
   pub fn address(&self) -> &SmolStr {
      &self.0.address
   }

   /// Checks if this interface has been closed.
   pub fn is_closed(&self) -> bool {
      self.0.is_closed()
   }

   pub fn ptr_eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }

   /// Gets the connection this interface reads from.
   ///
   /// Fails with [`SerialError::ConnectionClosed`] once either the interface
   /// or the connection is closed.
   pub fn connection(&self) -> Result<Connection> {
      if self.is_closed() {
         return Err(SerialError::ConnectionClosed);
      }
      let conn = self
         .0
         .connection
         .upgrade()
         .ok_or(SerialError::ConnectionClosed)?;
      conn.check_not_closed()?;
      Ok(conn)
   }

   /// Sends `message` without waiting for the write.
   ///
   /// Fails immediately if the connection is closed. Otherwise the "message
   /// sent" callback receives `message` once it was written, or the error
   /// callback receives the failure. Confirmations of concurrent sends may
   /// arrive in any order.
   pub fn send_message(&self, message: &str) -> Result<()> {
      let conn = self.connection()?;
      let outcome = conn.send(message)?;
      let weak = Arc::downgrade(&self.0);
      let message = message.to_string();

      let mut tasks = self.0.tasks.lock();
      while tasks.try_join_next().is_some() {}
      tasks.spawn_on(
         async move {
            let res = outcome.await;
            let Some(inner) = weak.upgrade() else {
               return;
            };
            match res {
               Ok(()) => inner.deliver(move |l| {
                  if let Some(cb) = &l.on_message_sent {
                     cb(&message);
                  }
               }),
               Err(e) => inner.deliver_error(e),
            }
         },
         conn.runtime(),
      );
      Ok(())
   }

   /// Replaces all three callbacks.
   ///
   /// Does nothing once the interface is closed.
   pub fn set_listeners(&self, listeners: Listeners) {
      self.update_listeners(|l| *l = listeners);
   }

   pub fn set_message_received_listener(&self, listener: Option<MessageCallback>) {
      self.update_listeners(|l| l.on_message_received = listener);
   }

   pub fn set_message_sent_listener(&self, listener: Option<MessageCallback>) {
      self.update_listeners(|l| l.on_message_sent = listener);
   }

   pub fn set_error_listener(&self, listener: Option<ErrorCallback>) {
      self.update_listeners(|l| l.on_error = listener);
   }

   fn update_listeners(&self, f: impl FnOnce(&mut Listeners)) {
      if self.is_closed() {
         debug!("Ignoring listener update on closed interface for {}", self.0.address);
         return;
      }
      f(&mut self.0.listeners.lock());
   }

   /// Stops message delivery and drops pending send confirmations.
   ///
   /// The connection stays open and keeps handing out this closed interface
   /// from [`Connection::to_interface`]; use the connection directly to go on.
   pub fn close(&self) {
      if self.0.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      self.0.tasks.lock().abort_all();
      *self.0.listeners.lock() = Listeners::default();
      debug!("Message interface for {} closed", self.0.address);
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::{
      io::{AsyncReadExt, AsyncWriteExt},
      sync::mpsc,
      time,
   };

   use super::*;
   use crate::{
      dispatch::QueuedDispatcher,
      serial::{
         charset::Charset,
         testing::{FailingReadStream, connection_pair, wrap},
      },
   };

   const WAIT: Duration = Duration::from_secs(2);

   fn channel_listeners() -> (
      Listeners,
      mpsc::UnboundedReceiver<String>,
      mpsc::UnboundedReceiver<String>,
      mpsc::UnboundedReceiver<String>,
   ) {
      let (recv_tx, recv_rx) = mpsc::unbounded_channel();
      let (sent_tx, sent_rx) = mpsc::unbounded_channel();
      let (err_tx, err_rx) = mpsc::unbounded_channel();
      let listeners = Listeners::new()
         .on_message_received(move |m| {
            let _ = recv_tx.send(m.to_string());
         })
         .on_message_sent(move |m| {
            let _ = sent_tx.send(m.to_string());
         })
         .on_error(move |e| {
            let _ = err_tx.send(e.to_string());
         });
      (listeners, recv_rx, sent_rx, err_rx)
   }

   async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
      time::timeout(WAIT, rx.recv())
         .await
         .expect("callback not invoked")
         .expect("callback dropped")
   }

   #[tokio::test]
   async fn test_received_messages_reach_listener() {
      let (conn, mut peer) = connection_pair("AA:BB:CC:DD:EE:FF");
      let iface = conn.to_interface().unwrap();
      let (listeners, mut received, _sent, _errors) = channel_listeners();
      iface.set_listeners(listeners);

      peer.write_all(b"hello\n\nworld\n").await.unwrap();
      assert_eq!(next(&mut received).await, "hello");
      assert_eq!(next(&mut received).await, "world");
   }

   #[tokio::test]
   async fn test_send_message_confirms_sent_text() {
      let (conn, mut peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();
      let (listeners, _received, mut sent, _errors) = channel_listeners();
      iface.set_listeners(listeners);

      iface.send_message("AT+VERSION\r\n").unwrap();
      assert_eq!(next(&mut sent).await, "AT+VERSION\r\n");

      let mut buf = [0u8; 12];
      peer.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"AT+VERSION\r\n");
   }

   #[tokio::test]
   async fn test_messages_without_listener_are_dropped() {
      let (conn, mut peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();

      peer.write_all(b"lost\n").await.unwrap();
      time::sleep(Duration::from_millis(50)).await;

      let (listeners, mut received, _sent, _errors) = channel_listeners();
      iface.set_listeners(listeners);
      peer.write_all(b"kept\n").await.unwrap();
      assert_eq!(next(&mut received).await, "kept");
   }

   #[tokio::test]
   async fn test_last_listener_wins() {
      let (conn, mut peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();

      let (first_tx, mut first_rx) = mpsc::unbounded_channel::<String>();
      let (second_tx, mut second_rx) = mpsc::unbounded_channel::<String>();
      iface.set_message_received_listener(Some(Arc::new(move |m: &str| {
         let _ = first_tx.send(m.to_string());
      })));
      iface.set_message_received_listener(Some(Arc::new(move |m: &str| {
         let _ = second_tx.send(m.to_string());
      })));

      peer.write_all(b"ping\n").await.unwrap();
      assert_eq!(next(&mut second_rx).await, "ping");
      assert!(first_rx.try_recv().is_err());

      iface.set_message_received_listener(None);
      peer.write_all(b"silent\n").await.unwrap();
      time::sleep(Duration::from_millis(50)).await;
      assert!(second_rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_read_failure_goes_to_error_listener() {
      let (conn, peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();
      let (listeners, _received, _sent, mut errors) = channel_listeners();
      iface.set_listeners(listeners);

      drop(peer);
      assert_eq!(next(&mut errors).await, SerialError::ConnectionLost.to_string());
   }

   #[tokio::test]
   async fn test_io_read_failure_goes_to_error_listener() {
      let conn = wrap("dev", FailingReadStream::new(std::io::ErrorKind::Other));
      let (listeners, mut received, _sent, mut errors) = channel_listeners();
      let iface = conn.to_interface().unwrap();
      iface.set_listeners(listeners);

      let message = next(&mut errors).await;
      assert!(message.starts_with("I/O error"), "{message}");
      assert!(message.contains("radio off"), "{message}");

      time::sleep(Duration::from_millis(50)).await;
      assert!(errors.try_recv().is_err());
      assert!(received.try_recv().is_err());
      assert!(!conn.is_closed());
   }

   #[tokio::test]
   async fn test_send_failure_goes_to_error_listener() {
      let (conn, peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();
      let (listeners, _received, mut sent, mut errors) = channel_listeners();
      iface.set_listeners(listeners);

      drop(peer);
      iface.send_message("into the void\n").unwrap();

      let mut saw_io = false;
      for _ in 0..2 {
         if next(&mut errors).await.starts_with("I/O error") {
            saw_io = true;
         }
      }
      assert!(saw_io);
      assert!(sent.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_closing_interface_keeps_connection_open() {
      let (conn, mut peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();
      let (listeners, mut received, _sent, _errors) = channel_listeners();
      iface.set_listeners(listeners);

      iface.close();
      assert!(iface.is_closed());
      assert!(!conn.is_closed());
      assert!(matches!(
         iface.send_message("x\n"),
         Err(SerialError::ConnectionClosed)
      ));
      // Let the aborted reader release the stream.
      time::sleep(Duration::from_millis(20)).await;

      peer.write_all(b"unheard\n").await.unwrap();
      time::sleep(Duration::from_millis(50)).await;
      assert!(received.try_recv().is_err());

      // The same closed interface is handed out until the connection closes.
      let again = conn.to_interface().unwrap();
      assert!(again.ptr_eq(&iface));
      assert!(again.is_closed());

      // The connection itself still works in both directions.
      conn.send("still here\n").unwrap().await.unwrap();
      let mut buf = [0u8; 11];
      peer.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"still here\n");

      // Bytes nobody consumed are picked up by a new subscription.
      let mut lines = conn.subscribe().unwrap();
      let line = time::timeout(WAIT, lines.next_line()).await.unwrap();
      assert_eq!(line.unwrap().unwrap(), "unheard");
   }

   #[tokio::test]
   async fn test_closing_connection_closes_interface() {
      let (conn, _peer) = connection_pair("dev");
      let iface = conn.to_interface().unwrap();
      let (listeners, _received, _sent, mut errors) = channel_listeners();
      iface.set_listeners(listeners);

      conn.close().await;
      assert!(iface.is_closed());
      assert!(matches!(
         iface.send_message("x\n"),
         Err(SerialError::ConnectionClosed)
      ));
      assert!(matches!(iface.connection(), Err(SerialError::ConnectionClosed)));

      // Listener updates after close are ignored without error.
      let (listeners, ..) = channel_listeners();
      iface.set_listeners(listeners);
      assert!(format!("{iface:?}").contains("on_message_received: false"));

      // No error surfaces for the intentional close.
      time::sleep(Duration::from_millis(50)).await;
      assert!(errors.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_queued_dispatcher_defers_callbacks() {
      let (local, mut peer) = tokio::io::duplex(1024);
      let dispatcher = QueuedDispatcher::new();
      let conn = Connection::new(
         "dev".into(),
         Charset::Utf8,
         local,
         tokio::runtime::Handle::current(),
         dispatcher.clone(),
      );
      let iface = conn.to_interface().unwrap();
      let (listeners, mut received, _sent, _errors) = channel_listeners();
      iface.set_listeners(listeners);

      peer.write_all(b"queued\n").await.unwrap();
      let job = time::timeout(WAIT, dispatcher.recv()).await.unwrap().unwrap();
      assert!(received.try_recv().is_err());

      job();
      assert_eq!(received.try_recv().unwrap(), "queued");
   }

   #[tokio::test]
   async fn test_queued_callbacks_are_dropped_after_close() {
      let (local, mut peer) = tokio::io::duplex(1024);
      let dispatcher = QueuedDispatcher::new();
      let conn = Connection::new(
         "dev".into(),
         Charset::Utf8,
         local,
         tokio::runtime::Handle::current(),
         dispatcher.clone(),
      );
      let iface = conn.to_interface().unwrap();
      let (listeners, mut received, _sent, _errors) = channel_listeners();
      iface.set_listeners(listeners);

      peer.write_all(b"late\n").await.unwrap();
      let job = time::timeout(WAIT, dispatcher.recv()).await.unwrap().unwrap();
      iface.close();

      job();
      assert!(received.try_recv().is_err());
   }
}
