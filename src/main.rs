//! # Inkline CLI
//!
//! ```bash
//! # Find devices on both transports for five seconds
//! inkline list --timeout 5
//!
//! # Encode two rows into the cache and report sizes
//! inkline encode logo.png text.png --compress
//!
//! # Encode and print over a serial port
//! inkline print label.png --port /dev/ttyUSB0 --baud 115200
//!
//! # Send a firmware image over USB
//! inkline ota firmware.bin --usb 1a86:e010 --frame-kind stx-d
//! ```

use clap::{Args, Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use inkline::{
    ConnectionManager, DeviceError, DeviceInfo, DiscoveryEvent, EncodeOptions, Encoder, Error,
    FrameKind, LayoutDirection, LinkConfig, OtaData, PayloadStore, RowImage, SerialSettings,
    TransferConfig, TransferData, TransferEvent, TransportKind,
};

/// Inkline - handheld printhead utility
#[derive(Parser, Debug)]
#[command(name = "inkline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Payload cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover devices
    List {
        /// Scan duration in seconds
        #[arg(long, default_value = "3")]
        timeout: u64,

        /// Only scan USB
        #[arg(long, conflicts_with = "serial")]
        usb: bool,

        /// Only scan serial ports
        #[arg(long)]
        serial: bool,
    },

    /// Encode images into printhead rows without sending them
    Encode {
        /// One image per printable row
        #[arg(required = true)]
        images: Vec<PathBuf>,

        #[command(flatten)]
        encode: EncodeArgs,
    },

    /// Encode images and send them to a device
    Print {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        #[command(flatten)]
        encode: EncodeArgs,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Send a firmware image
    Ota {
        firmware: PathBuf,

        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Black/white cut-off
    #[arg(long, default_value = "128")]
    threshold: u8,

    /// Plain thresholding instead of Floyd-Steinberg
    #[arg(long)]
    no_dither: bool,

    /// PackBits-compress every row
    #[arg(long)]
    compress: bool,

    /// Mirror rows horizontally
    #[arg(long)]
    flip: bool,

    /// Images are laid out horizontally and rotated before encoding
    #[arg(long)]
    horizontal: bool,

    /// Images are consecutive crops of one picture
    #[arg(long)]
    contiguous: bool,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Serial port path
    #[arg(long, conflicts_with = "usb", required_unless_present = "usb")]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value = "115200")]
    baud: u32,

    /// USB device as VID:PID or VID:PID@SERIAL (hex ids)
    #[arg(long)]
    usb: Option<String>,

    /// Frame kind (soh, stx, stx-a .. stx-e)
    #[arg(long, default_value = "stx-a")]
    frame_kind: FrameKind,

    /// Seconds to wait for the device before giving up
    #[arg(long, default_value = "10")]
    ack_timeout: u64,
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logger(verbose: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(
            buf,
            "[{}:{}] {} - {}",
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.level(),
            record.args()
        )
    });
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    builder.init();
}

fn run(cli: Cli) -> Result<(), Error> {
    let store = match &cli.cache_dir {
        Some(dir) => PayloadStore::new(dir)?,
        None => PayloadStore::in_temp_dir()?,
    };

    match cli.command {
        Commands::List {
            timeout,
            usb,
            serial,
        } => {
            let kinds = match (usb, serial) {
                (true, _) => vec![TransportKind::Usb],
                (_, true) => vec![TransportKind::Serial],
                _ => vec![TransportKind::Usb, TransportKind::Serial],
            };
            list(&kinds, Duration::from_secs(timeout))
        }
        Commands::Encode { images, encode } => {
            let data = encode_images(store, &images, &encode)?;
            for (index, row) in data.rows().iter().enumerate() {
                println!(
                    "row {}: {} bytes, {} STX_A packets, {}",
                    index,
                    row.data_length(),
                    row.packet_count(FrameKind::StxA.payload_size()),
                    row.path().display()
                );
            }
            println!("total: {} bytes", data.total_len());
            Ok(())
        }
        Commands::Print {
            images,
            encode,
            target,
        } => {
            let data = encode_images(store, &images, &encode)?;
            let result = send(Arc::new(data.clone()), &target);
            data.remove_files()?;
            result
        }
        Commands::Ota { firmware, target } => {
            let data = OtaData::from_file(&store, &firmware)?;
            let path = data.path().to_path_buf();
            let result = send(Arc::new(data), &target);
            PayloadStore::remove(&path)?;
            result
        }
    }
}

fn list(kinds: &[TransportKind], timeout: Duration) -> Result<(), Error> {
    let mut manager = ConnectionManager::new(LinkConfig::default());
    let events = manager.discover(kinds, timeout)?;
    let mut pending = kinds.len();

    while pending > 0 {
        match events.recv() {
            Ok(DiscoveryEvent::Found(device)) => println!(
                "{:?}\t{}\t{}\t{}",
                device.kind(),
                device.id(),
                device,
                device.name().unwrap_or("")
            ),
            Ok(DiscoveryEvent::Finished(_)) => pending -= 1,
            Ok(DiscoveryEvent::Failed { kind, message, .. }) => {
                eprintln!("{:?} discovery failed: {}", kind, message);
                pending -= 1;
            }
            Err(_) => break,
        }
    }
    Ok(())
}

fn encode_images(
    store: PayloadStore,
    images: &[PathBuf],
    args: &EncodeArgs,
) -> Result<inkline::MultiRowData, Error> {
    let direction = if args.horizontal {
        LayoutDirection::Horizontal
    } else {
        LayoutDirection::Vertical
    };
    let options = EncodeOptions::new(args.threshold)
        .dithering(!args.no_dither)
        .compress(args.compress)
        .flip(args.flip)
        .direction(direction)
        .contiguous_cropped_images(args.contiguous);

    let rows = images
        .iter()
        .map(RowImage::open)
        .collect::<Result<Vec<_>, _>>()?;
    info!("encoding {} row(s)", rows.len());
    inkline::join(Encoder::new(store, options).spawn(rows))
}

fn target_device(target: &TargetArgs) -> Result<DeviceInfo, Error> {
    if let Some(port) = &target.port {
        return Ok(DeviceInfo::serial(port.as_str(), None, None, None)
            .with_serial_settings(SerialSettings::new(target.baud)));
    }
    let wanted = target.usb.as_deref().unwrap_or_default();
    let (ids, serial) = match wanted.split_once('@') {
        Some((ids, serial)) => (ids, Some(serial.to_string())),
        None => (wanted, None),
    };
    let parse = |s: &str| u16::from_str_radix(s, 16).ok();
    match ids.split_once(':').map(|(v, p)| (parse(v), parse(p))) {
        Some((Some(vid), Some(pid))) => Ok(DeviceInfo::usb(vid, pid, serial, 0, 0, None)),
        _ => Err(DeviceError::NotFound(wanted.to_string()).into()),
    }
}

fn send(data: Arc<dyn TransferData>, target: &TargetArgs) -> Result<(), Error> {
    let device = target_device(target)?;
    let mut manager = ConnectionManager::new(LinkConfig::default());
    manager.connect(device)?;

    let config = TransferConfig::new(target.frame_kind)
        .ack_timeout(Duration::from_secs(target.ack_timeout));
    let transfer = manager.submit_transfer(data, config)?;

    for event in transfer.events().iter() {
        match event {
            TransferEvent::Started {
                total_bytes,
                total_packets,
            } => println!("sending {} bytes in {} packets", total_bytes, total_packets),
            TransferEvent::Progress { percent, bytes } => {
                println!("{:>6.2}% ({} bytes)", percent, bytes)
            }
            TransferEvent::Success => println!("done"),
            TransferEvent::Error { code, message } => eprintln!("{:?}: {}", code, message),
        }
    }

    let state = transfer.join();
    manager.disconnect()?;
    info!("transfer ended in {:?}", state?);
    Ok(())
}
