//! Stream engine of a single connection.
//!
//! A [`Connection`] owns both halves of a duplex byte stream. Outbound text is
//! encoded and written on the runtime's worker pool, serialized by a writer
//! lock; inbound bytes are read by a background task per subscription, framed
//! into lines and pushed into an unbounded channel so the reader never waits
//! on a slow consumer.

use core::fmt;
use std::{
   future::Future,
   io,
   pin::Pin,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
   task::{Context, Poll},
};

use futures::Stream;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   runtime::Handle,
   select,
   sync::{Mutex, Notify, mpsc},
   task::{AbortHandle, JoinHandle, JoinSet},
};

use super::{charset::Charset, framing::LineFramer, interface::MessageInterface};
use crate::{
   dispatch::DispatcherRef,
   error::{Result, SerialError},
};

/// Size of the buffer each read lands in.
const READ_BUFFER_SIZE: usize = 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Input half together with the bytes of a partially received line.
struct ReadState {
   half: BoxedReader,
   framer: LineFramer,
}

struct ConnectionInner {
   address: SmolStr,
   charset: Charset,
   closed: AtomicBool,
   shutdown: Notify,
   runtime: Handle,
   dispatcher: DispatcherRef,
   reader: Mutex<Option<ReadState>>,
   writer: Mutex<Option<BoxedWriter>>,
   readers: parking_lot::Mutex<JoinSet<()>>,
   interface: parking_lot::Mutex<Option<MessageInterface>>,
}

impl ConnectionInner {
   fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   async fn write(&self, payload: Vec<u8>) -> Result<()> {
      let shutdown = self.shutdown.notified();
      tokio::pin!(shutdown);
      shutdown.as_mut().enable();

      // Closed after the send was accepted.
      if self.is_closed() {
         return Err(not_connected().into());
      }

      let mut writer = select! {
         guard = self.writer.lock() => guard,
         () = shutdown.as_mut() => return Err(aborted().into()),
      };
      let Some(half) = writer.as_mut() else {
         return Err(not_connected().into());
      };

      debug!("→ {}: {}", self.address, hex::encode(&payload));
      let io = async {
         half.write_all(&payload).await?;
         half.flush().await
      };
      select! {
         res = io => res.map_err(|e| {
            warn!("Failed to send data to {}: {e}", self.address);
            SerialError::Io(e)
         }),
         () = shutdown.as_mut() => Err(aborted().into()),
      }
   }

   async fn read_loop(self: Arc<Self>, tx: mpsc::UnboundedSender<Result<String>>) {
      let mut guard = self.reader.lock().await;
      let Some(state) = guard.as_mut() else {
         return;
      };
      let mut buf = [0u8; READ_BUFFER_SIZE];

      while !self.is_closed() && !tx.is_closed() {
         match state.half.read(&mut buf).await {
            Ok(0) => {
               if let Some(line) = state.framer.finish() {
                  let _ = tx.send(Ok(line));
               }
               if !self.is_closed() {
                  warn!("Connection to {} lost", self.address);
                  let _ = tx.send(Err(SerialError::ConnectionLost));
               }
               return;
            },
            Ok(n) => {
               debug!("← {}: {}", self.address, hex::encode(&buf[..n]));
               for line in state.framer.push(&buf[..n]) {
                  if tx.send(Ok(line)).is_err() {
                     return;
                  }
               }
            },
            Err(e) => {
               // Indistinguishable from the stream being torn down by close().
               if self.is_closed() || tx.is_closed() {
                  debug!("Read from {} ended during close: {e}", self.address);
               } else {
                  warn!("Failed to read from {}: {e}", self.address);
                  let _ = tx.send(Err(SerialError::Io(e)));
               }
               return;
            },
         }
      }
   }
}

fn not_connected() -> io::Error {
   io::Error::new(io::ErrorKind::NotConnected, "stream already released")
}

fn aborted() -> io::Error {
   io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed during send")
}

/// An open connection to one address.
///
/// This type is cheaply cloneable; all clones refer to the same stream.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

/// Weak reference to a [`Connection`].
#[derive(Clone)]
pub struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
   pub fn new(connection: &Connection) -> Self {
      Self(Arc::downgrade(&connection.0))
   }

   pub fn upgrade(&self) -> Option<Connection> {
      self.0.upgrade().map(Connection)
   }
}

impl fmt::Debug for WeakConnection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("WeakConnection")
   }
}

impl fmt::Debug for Connection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Connection")
         .field("address", &self.0.address)
         .field("charset", &self.0.charset)
         .field("closed", &self.is_closed())
         .finish_non_exhaustive()
   }
}

impl PartialEq for Connection {
   fn eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }
}

impl Eq for Connection {}

impl Connection {
   /// Wraps a connected stream.
   ///
   /// Background work of the connection runs on `runtime`; interface
   /// callbacks are delivered through `dispatcher`.
   pub(crate) fn new<S>(
      address: SmolStr,
      charset: Charset,
      stream: S,
      runtime: Handle,
      dispatcher: DispatcherRef,
   ) -> Self
   where
      S: AsyncRead + AsyncWrite + Send + 'static,
   {
      let (read_half, write_half) = tokio::io::split(stream);
      Self(Arc::new(ConnectionInner {
         address,
         charset,
         closed: AtomicBool::new(false),
         shutdown: Notify::new(),
         runtime,
         dispatcher,
         reader: Mutex::new(Some(ReadState {
            half: Box::new(read_half),
            framer: LineFramer::new(charset),
         })),
         writer: Mutex::new(Some(Box::new(write_half))),
         readers: parking_lot::Mutex::new(JoinSet::new()),
         interface: parking_lot::Mutex::new(None),
      }))
   }

   /// Gets the address this connection was opened for.
   pub fn address(&self) -> &SmolStr {
      &self.0.address
   }

   /// Gets the charset used for framing.
   pub fn charset(&self) -> Charset {
      self.0.charset
   }

   /// Checks if the connection has been closed.
   pub fn is_closed(&self) -> bool {
      self.0.is_closed()
   }

   pub fn downgrade(&self) -> WeakConnection {
      WeakConnection::new(self)
   }

   pub(crate) fn runtime(&self) -> &Handle {
      &self.0.runtime
   }

   /// Fails with [`SerialError::ConnectionClosed`] once the connection is closed.
   pub fn check_not_closed(&self) -> Result<()> {
      if self.is_closed() {
         Err(SerialError::ConnectionClosed)
      } else {
         Ok(())
      }
   }

   /// Sends `text` to the peer.
   ///
   /// Fails immediately if the connection is closed. Otherwise the write is
   /// scheduled right away and the returned [`SendOutcome`] resolves once the
   /// whole payload was handed to the transport. Writes of concurrent sends
   /// never interleave. The text is sent as is; no delimiter is appended.
   pub fn send(&self, text: &str) -> Result<SendOutcome> {
      self.check_not_closed()?;
      let payload = self.0.charset.encode(text).into_owned();
      let inner = self.0.clone();
      let handle = self.0.runtime.spawn(async move { inner.write(payload).await });
      Ok(SendOutcome { handle })
   }

   /// Opens the stream of lines received from the peer.
   ///
   /// Every line is delivered once. The stream ends when the connection is
   /// closed or the [`LineStream`] is dropped; a read failure ends it with one
   /// error. A line that never receives its `\n` is buffered forever.
   /// Only one subscription reads at a time; another one waits until the
   /// active subscription ends and continues with the remaining bytes.
   pub fn subscribe(&self) -> Result<LineStream> {
      self.check_not_closed()?;
      let (tx, rx) = mpsc::unbounded_channel();
      let task = {
         let mut readers = self.0.readers.lock();
         while readers.try_join_next().is_some() {}
         readers.spawn_on(self.0.clone().read_loop(tx), &self.0.runtime)
      };
      debug!("Opened message stream for {}", self.0.address);
      Ok(LineStream {
         rx,
         task,
         conn: self.downgrade(),
      })
   }

   /// Gets the message interface of this connection, creating it on first use.
   ///
   /// The interface is created once and every call returns that same
   /// instance until the connection closes, even after the interface itself
   /// was closed.
   pub fn to_interface(&self) -> Result<MessageInterface> {
      let mut slot = self.0.interface.lock();
      self.check_not_closed()?;
      if let Some(iface) = slot.as_ref() {
         return Ok(iface.clone());
      }
      let iface = MessageInterface::start(self, self.0.dispatcher.clone())?;
      *slot = Some(iface.clone());
      Ok(iface)
   }

   /// Closes the connection.
   ///
   /// The first call stops all readers, releases both halves of the stream and
   /// closes the message interface; later calls do nothing. Failures while
   /// releasing one half do not keep the other from being released.
   pub async fn close(&self) {
      if self.0.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      info!("Closing connection to {}", self.0.address);

      self.0.shutdown.notify_waiters();
      self.0.readers.lock().abort_all();

      let _ = self.0.reader.lock().await.take();

      let writer = self.0.writer.lock().await.take();
      if let Some(mut half) = writer
         && let Err(e) = half.shutdown().await
      {
         debug!("Failed to shut down output of {}: {e}", self.0.address);
      }

      let iface = self.0.interface.lock().take();
      if let Some(iface) = iface {
         iface.close();
      }
   }
}

/// Pending result of [`Connection::send`].
///
/// The write proceeds whether or not this future is awaited.
#[derive(Debug)]
pub struct SendOutcome {
   handle: JoinHandle<Result<()>>,
}

impl Future for SendOutcome {
   type Output = Result<()>;

   fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
      match Pin::new(&mut self.handle).poll(cx) {
         Poll::Ready(Ok(res)) => Poll::Ready(res),
         Poll::Ready(Err(e)) => Poll::Ready(Err(SerialError::TaskPanicked(e))),
         Poll::Pending => Poll::Pending,
      }
   }
}

/// Lines received on a connection.
///
/// Dropping the stream cancels the subscription without closing the
/// connection.
#[derive(Debug)]
pub struct LineStream {
   rx: mpsc::UnboundedReceiver<Result<String>>,
   task: AbortHandle,
   conn: WeakConnection,
}

impl LineStream {
   /// Receives the next line, `None` once the stream has ended.
   pub async fn next_line(&mut self) -> Option<Result<String>> {
      std::future::poll_fn(|cx| self.poll_line(cx)).await
   }

   fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<String>>> {
      let open = self.conn.upgrade().is_some_and(|c| !c.is_closed());
      if !open {
         self.rx.close();
         return Poll::Ready(None);
      }
      self.rx.poll_recv(cx)
   }
}

impl Stream for LineStream {
   type Item = Result<String>;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      self.get_mut().poll_line(cx)
   }
}

impl Drop for LineStream {
   fn drop(&mut self) {
      self.task.abort();
   }
}
