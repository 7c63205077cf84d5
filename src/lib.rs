//! Address-keyed, line-oriented serial connections over duplex byte streams.
//!
//! A [`Transport`](transport::Transport) dials an address (a Bluetooth MAC for
//! RFCOMM, `host:port` for TCP) and the [`ConnectionRegistry`] keeps one live
//! [`Connection`] per address on top of it.
//!
//! ```no_run
//! use btserial::{ConnectionRegistry, Listeners, transport::tcp::TcpTransport};
//!
//! # async fn demo() -> btserial::error::Result<()> {
//! let registry = ConnectionRegistry::new(TcpTransport::new());
//! let conn = registry.open_default("127.0.0.1:7000").await?;
//! let iface = conn.to_interface()?;
//! iface.set_listeners(Listeners::new().on_message_received(|m| println!("{m}")));
//! iface.send_message("PING")?;
//! registry.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod serial;
pub mod transport;

pub use error::{Result, SerialError};
pub use serial::{
   Charset, Connection, ConnectionRegistry, LineStream, Listeners, MessageInterface,
};
