//! In-memory streams and transports for tests.

use std::{
   collections::{HashMap, HashSet},
   io,
   pin::Pin,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   task::{Context, Poll},
   time::Duration,
};

use tokio::{
   io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
   runtime::Handle,
   time,
};

use super::{charset::Charset, connection::Connection};
use crate::{
   dispatch::Inline,
   transport::{PairedDevice, Transport},
};

/// Buffer size of in-memory pipes; small enough to make large writes block.
pub const PIPE_CAPACITY: usize = 4096;

/// Counters shared between a [`TrackedStream`] and the test observing it.
#[derive(Debug, Default)]
pub struct StreamStats {
   pub shutdowns: AtomicUsize,
   pub drops: AtomicUsize,
}

/// Duplex stream that records how it was torn down.
#[derive(Debug)]
pub struct TrackedStream {
   inner: DuplexStream,
   stats: Arc<StreamStats>,
}

impl TrackedStream {
   /// Creates a tracked stream and the peer end of its pipe.
   pub fn pair() -> (Self, DuplexStream, Arc<StreamStats>) {
      let (local, peer) = tokio::io::duplex(PIPE_CAPACITY);
      let stats = Arc::new(StreamStats::default());
      (
         Self {
            inner: local,
            stats: stats.clone(),
         },
         peer,
         stats,
      )
   }
}

impl Drop for TrackedStream {
   fn drop(&mut self) {
      self.stats.drops.fetch_add(1, Ordering::SeqCst);
   }
}

impl AsyncRead for TrackedStream {
   fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
      buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_read(cx, buf)
   }
}

impl AsyncWrite for TrackedStream {
   fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      Pin::new(&mut self.inner).poll_write(cx, buf)
   }

   fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Pin::new(&mut self.inner).poll_flush(cx)
   }

   fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      self.stats.shutdowns.fetch_add(1, Ordering::SeqCst);
      Pin::new(&mut self.inner).poll_shutdown(cx)
   }
}

/// Stream whose reads fail with `kind` and whose writes are discarded.
#[derive(Debug)]
pub struct FailingReadStream {
   kind: io::ErrorKind,
}

impl FailingReadStream {
   pub const fn new(kind: io::ErrorKind) -> Self {
      Self { kind }
   }
}

impl AsyncRead for FailingReadStream {
   fn poll_read(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &mut ReadBuf<'_>,
   ) -> Poll<io::Result<()>> {
      Poll::Ready(Err(io::Error::new(self.kind, "radio off")))
   }
}

impl AsyncWrite for FailingReadStream {
   fn poll_write(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      buf: &[u8],
   ) -> Poll<io::Result<usize>> {
      Poll::Ready(Ok(buf.len()))
   }

   fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Ready(Ok(()))
   }

   fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
      Poll::Ready(Ok(()))
   }
}

/// Wraps `stream` in a UTF-8 connection with inline callback delivery.
pub fn wrap<S>(address: &str, stream: S) -> Connection
where
   S: AsyncRead + AsyncWrite + Send + 'static,
{
   Connection::new(
      address.into(),
      Charset::Utf8,
      stream,
      Handle::current(),
      Arc::new(Inline),
   )
}

/// Creates a UTF-8 connection and the peer end of its stream.
pub fn connection_pair(address: &str) -> (Connection, DuplexStream) {
   connection_pair_with(address, Charset::Utf8)
}

pub fn connection_pair_with(address: &str, charset: Charset) -> (Connection, DuplexStream) {
   let (local, peer) = tokio::io::duplex(PIPE_CAPACITY);
   let conn = Connection::new(
      address.into(),
      charset,
      local,
      Handle::current(),
      Arc::new(Inline),
   );
   (conn, peer)
}

/// Transport handing out in-memory pipes.
#[derive(Debug, Default)]
pub struct MemoryTransport {
   attempts: AtomicUsize,
   delay: Option<Duration>,
   refused: parking_lot::Mutex<HashSet<String>>,
   peers: parking_lot::Mutex<HashMap<String, Vec<DuplexStream>>>,
   stats: parking_lot::Mutex<HashMap<String, Vec<Arc<StreamStats>>>>,
}

impl MemoryTransport {
   pub fn new() -> Self {
      Self::default()
   }

   /// Delays every connect, widening the window for racing opens.
   pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = Some(delay);
      self
   }

   /// Makes connects to `address` fail with `ConnectionRefused`.
   pub fn refuse(&self, address: &str) {
      self.refused.lock().insert(address.to_string());
   }

   pub fn accept(&self, address: &str) {
      self.refused.lock().remove(address);
   }

   /// Number of connect attempts so far.
   pub fn attempts(&self) -> usize {
      self.attempts.load(Ordering::SeqCst)
   }

   /// Takes the peer end of the oldest connected stream to `address`.
   pub fn take_peer(&self, address: &str) -> Option<DuplexStream> {
      let mut peers = self.peers.lock();
      let list = peers.get_mut(address)?;
      if list.is_empty() {
         None
      } else {
         Some(list.remove(0))
      }
   }

   /// Teardown counters of every stream connected to `address`.
   pub fn stats(&self, address: &str) -> Vec<Arc<StreamStats>> {
      self.stats.lock().get(address).cloned().unwrap_or_default()
   }
}

impl Transport for MemoryTransport {
   type Stream = TrackedStream;

   async fn connect(&self, address: &str) -> io::Result<TrackedStream> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      if let Some(delay) = self.delay {
         time::sleep(delay).await;
      }
      if self.refused.lock().contains(address) {
         return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("{address} refused the connection"),
         ));
      }
      let (stream, peer, stats) = TrackedStream::pair();
      self
         .peers
         .lock()
         .entry(address.to_string())
         .or_default()
         .push(peer);
      self
         .stats
         .lock()
         .entry(address.to_string())
         .or_default()
         .push(stats);
      Ok(stream)
   }

   async fn paired_devices(&self) -> io::Result<Vec<PairedDevice>> {
      Ok(vec![PairedDevice {
         address: "AA:BB:CC:DD:EE:FF".into(),
         name: "HC-05".into(),
      }])
   }
}
