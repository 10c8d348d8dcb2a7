//! BLE OTA tool
//!
//! Connects to a device advertising the OTA service and streams a firmware
//! image to it, or runs the same session against a simulated device.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bleota_controller::error::GATT_SUCCESS;
use bleota_controller::mock::{MockBehavior, MockDevice};
use bleota_controller::{
    BtleplugEndpoint, FirmwareImage, GattEndpoint, OtaClient, Outcome, SessionEvent,
    TransferConfig, WriteMode, ble,
};
use bleota_proto::ble::DEFAULT_ATT_MTU;
use bleota_proto::{AckStatus, Message};
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "bleota")]
#[command(about = "Firmware update over BLE")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware image to a device
    Flash {
        /// Firmware image to send
        #[arg(short, long)]
        firmware: PathBuf,
        /// Device name or address; defaults to any device advertising the OTA service
        #[arg(short, long)]
        device: Option<String>,
        /// Transfer configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// ATT MTU to request
        #[arg(long)]
        mtu: Option<u16>,
        /// Write firmware chunks without response
        #[arg(long)]
        without_response: bool,
        /// MTU the host stack settles on for this link; chunks are sized from it
        #[arg(long, default_value_t = DEFAULT_ATT_MTU)]
        link_mtu: u16,
        /// Scan duration in seconds
        #[arg(long, default_value = "5")]
        scan_secs: u64,
    },
    /// Run a transfer against a simulated device
    Simulate {
        /// Firmware image to send; a generated image is used otherwise
        #[arg(short, long)]
        firmware: Option<PathBuf>,
        /// Size of the generated image in bytes
        #[arg(short, long, default_value = "4096")]
        size: usize,
        /// Largest MTU the simulated device grants
        #[arg(long, default_value = "185")]
        mtu: u16,
        /// Device refuses the start command
        #[arg(long)]
        refuse_start: bool,
        /// Device refuses the end command
        #[arg(long)]
        refuse_end: bool,
        /// Latency of each write in milliseconds
        #[arg(long, default_value = "0")]
        write_delay_ms: u64,
        /// Drop the link during this write (0 is the start command)
        #[arg(long)]
        drop_at: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Flash {
            firmware,
            device,
            config,
            mtu,
            without_response,
            link_mtu,
            scan_secs,
        } => {
            let mut config = match config {
                Some(path) => TransferConfig::load(&path)?,
                None => TransferConfig::default(),
            };
            if let Some(mtu) = mtu {
                config.requested_mtu = mtu;
            }
            if without_response {
                config.data_write_mode = WriteMode::WithoutResponse;
            }
            let image = read_image(&firmware)?;

            let adapter = ble::get_adapter().await?;
            println!("Scanning for OTA devices ({scan_secs} seconds)...");
            let peripheral = ble::find_device(
                &adapter,
                device.as_deref(),
                config.layout.service,
                Duration::from_secs(scan_secs),
            )
            .await?;
            let endpoint =
                BtleplugEndpoint::new(adapter, peripheral, config.layout).with_link_mtu(link_mtu);
            run_session(Arc::new(endpoint), config, image).await
        }
        Commands::Simulate {
            firmware,
            size,
            mtu,
            refuse_start,
            refuse_end,
            write_delay_ms,
            drop_at,
        } => {
            let image = match firmware {
                Some(path) => read_image(&path)?,
                None => FirmwareImage::new((0..size).map(|i| i as u8).collect::<Vec<_>>())?,
            };
            let behavior = MockBehavior {
                max_mtu: Some(mtu),
                start_ack: Some(ack(refuse_start)),
                end_ack: Some(ack(refuse_end)),
                write_delay: Duration::from_millis(write_delay_ms),
                drop_link_on_write: drop_at,
                ..Default::default()
            };
            let device = Arc::new(MockDevice::new(behavior));
            let result = run_session(device.clone(), TransferConfig::default(), image).await;
            info!(
                "simulated device received {} bytes",
                device.received_firmware().len()
            );
            result
        }
    }
}

fn ack(refuse: bool) -> AckStatus {
    if refuse {
        AckStatus::Refuse
    } else {
        AckStatus::Accept
    }
}

fn read_image(path: &Path) -> Result<FirmwareImage, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    println!("Firmware {} ({} bytes)", path.display(), bytes.len());
    Ok(FirmwareImage::new(bytes)?)
}

/// Drives one session to its outcome, starting the transfer once ready
async fn run_session<E: GattEndpoint>(
    endpoint: Arc<E>,
    config: TransferConfig,
    image: FirmwareImage,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = OtaClient::new(endpoint, config);
    let (tx, mut rx) = mpsc::unbounded_channel();

    client
        .connect(image, move |event: SessionEvent| {
            println!("{}", status_line(&event));
            let _ = tx.send(event);
        })
        .await;

    let outcome = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(SessionEvent::Ready) => client.ota()?,
                Some(SessionEvent::Finished(outcome)) => break outcome,
                Some(_) => {}
                None => break Outcome::Disconnected { status: GATT_SUCCESS },
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, closing session");
                client.close().await;
                return Err("interrupted".into());
            }
        }
    };

    client.close().await;
    match outcome {
        Outcome::Completed => Ok(()),
        Outcome::Refused(command) => Err(format!("device refused {command}").into()),
        Outcome::Failed(e) => Err(e.into()),
        Outcome::Disconnected { status } => Err(format!("link lost, status={status}").into()),
    }
}

/// One status line per session event
fn status_line(event: &SessionEvent) -> String {
    match event {
        SessionEvent::ConnectionState {
            connected: true, ..
        } => "Connected".to_string(),
        SessionEvent::ConnectionState { status, .. } if *status == GATT_SUCCESS => {
            "Disconnected".to_string()
        }
        SessionEvent::ConnectionState { status, .. } => format!("Status error: {status}"),
        SessionEvent::MtuNegotiated { mtu, status } if *status == GATT_SUCCESS => {
            format!("Request MTU {mtu} success")
        }
        SessionEvent::MtuNegotiated { mtu, status } => {
            format!("Request MTU {mtu} failed, status={status}")
        }
        SessionEvent::Discovery(Ok(_)) => "Discover service and char completed".to_string(),
        SessionEvent::Discovery(Err(e)) => format!("Discover services failed: {e}"),
        SessionEvent::Ready => "Notifications enabled, ready for OTA".to_string(),
        SessionEvent::WriteFailed {
            characteristic,
            status,
        } => format!("CharacteristicWrite failed on {characteristic}, status={status}"),
        SessionEvent::Message(Message::StartAck(AckStatus::Accept)) => "Start OTA ...".to_string(),
        SessionEvent::Message(Message::StartAck(AckStatus::Refuse)) => {
            "Device refuse OTA start request".to_string()
        }
        SessionEvent::Message(Message::EndAck(AckStatus::Accept)) => "OTA Complete!!".to_string(),
        SessionEvent::Message(Message::EndAck(AckStatus::Refuse)) => {
            "Device refuse OTA end request".to_string()
        }
        SessionEvent::Message(message) => format!("Received {message}"),
        SessionEvent::Progress(percent) => format!("Progress {percent}%"),
        SessionEvent::Finished(Outcome::Completed) => "Done".to_string(),
        SessionEvent::Finished(Outcome::Refused(command)) => format!("OTA {command} refused"),
        SessionEvent::Finished(Outcome::Failed(e)) => format!("Error: code {}: {e}", e.code()),
        SessionEvent::Finished(Outcome::Disconnected { status }) => {
            format!("Link lost, status={status}")
        }
    }
}
