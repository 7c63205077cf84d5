//! Line-based serial terminal.
//!
//! `btserial <address>` connects to a device, prints every line it sends and
//! forwards stdin lines to it. `btserial --list` prints the known devices.

use std::{env, process::ExitCode, sync::Arc, time::Duration};

use btserial::{
   ConnectionRegistry, Listeners, SerialError,
   config::Config,
   dispatch::QueuedDispatcher,
   error::Result,
   transport::{Transport, tcp::TcpTransport},
};
use log::{error, info, warn};
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   signal,
   sync::Notify,
   time,
};

const USAGE: &str = "usage: btserial <address> | btserial --list";

#[tokio::main]
async fn main() -> ExitCode {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let args: Vec<String> = env::args().skip(1).collect();
   let res = match args.as_slice() {
      [flag] if flag == "--list" => list().await,
      [flag] if flag == "-h" || flag == "--help" => {
         println!("{USAGE}");
         Ok(())
      },
      [address] => connect(address).await,
      _ => {
         eprintln!("{USAGE}");
         return ExitCode::from(2);
      },
   };

   match res {
      Ok(()) => ExitCode::SUCCESS,
      Err(e) => {
         error!("{e}");
         ExitCode::FAILURE
      },
   }
}

fn load_config() -> Result<Config> {
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );
   Ok(config)
}

async fn list() -> Result<()> {
   let config = load_config()?;
   let mut devices = TcpTransport::new()
      .with_known_devices(&config.known_devices)
      .paired_devices()
      .await?;

   #[cfg(feature = "bluetooth")]
   {
      let transport = rfcomm_transport(&config).await?;
      for device in transport.paired_devices().await? {
         if !devices.iter().any(|d| d.address == device.address) {
            devices.push(device);
         }
      }
   }

   if devices.is_empty() {
      println!("No known devices");
   }
   for device in devices {
      println!("{}\t{}", device.address, device.name);
   }
   Ok(())
}

async fn connect(address: &str) -> Result<()> {
   let config = load_config()?;

   #[cfg(feature = "bluetooth")]
   {
      if btserial::transport::rfcomm::is_bluetooth_address(address) {
         let transport = rfcomm_transport(&config).await?;
         return chat(transport, &config, address).await;
      }
   }

   let transport = TcpTransport::new().with_known_devices(&config.known_devices);
   chat(transport, &config, address).await
}

#[cfg(feature = "bluetooth")]
async fn rfcomm_transport(config: &Config) -> Result<btserial::transport::rfcomm::RfcommTransport> {
   use btserial::transport::rfcomm::RfcommTransport;

   let session = bluer::Session::new().await.map_err(std::io::Error::other)?;
   Ok(RfcommTransport::new(config.bluetooth_channel).with_session(session))
}

async fn chat<T: Transport>(transport: T, config: &Config, address: &str) -> Result<()> {
   let charset = config.charset()?;
   let name = config.is_known_device(address).unwrap_or(address).to_string();

   // Callbacks run on their own task, never on the reader.
   let dispatcher = QueuedDispatcher::new();
   tokio::spawn(dispatcher.clone().run());
   let registry = ConnectionRegistry::with_dispatcher(transport, dispatcher);

   info!("Connecting to {name}...");
   let timeout = Duration::from_secs(config.connect_timeout_sec);
   let conn = time::timeout(timeout, registry.open(address, charset))
      .await
      .map_err(|_| SerialError::RequestTimeout)??;
   info!("Connected to {name}, type a message and press enter");

   let lost = Arc::new(Notify::new());
   let iface = conn.to_interface()?;
   iface.set_listeners(
      Listeners::new()
         .on_message_received(move |message| println!("{name}: {message}"))
         .on_message_sent(|message| println!("You sent: {}", message.trim_end()))
         .on_error({
            let lost = lost.clone();
            move |e| {
               warn!("{e}");
               if matches!(e, SerialError::ConnectionLost) {
                  lost.notify_one();
               }
            }
         }),
   );

   let mut stdin = BufReader::new(tokio::io::stdin()).lines();
   loop {
      tokio::select! {
         line = stdin.next_line() => match line? {
            Some(line) => {
               let line = line.trim();
               if line.is_empty() {
                  continue;
               }
               // Messages are sent as is; the device expects whole lines.
               if let Err(e) = iface.send_message(&format!("{line}\n")) {
                  warn!("Failed to send: {e}");
                  break;
               }
            },
            None => break,
         },
         () = lost.notified() => {
            info!("Device hung up");
            break;
         },
         res = signal::ctrl_c() => {
            res?;
            break;
         },
      }
   }

   info!("Closing connections...");
   registry.close_all().await;
   Ok(())
}
