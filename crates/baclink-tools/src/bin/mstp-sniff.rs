use baclink_datalink::PhysicalSerial;
use baclink_mstp::{MstpConfig, MstpTransport};
use clap::Parser;
use std::time::Duration;

/// Passive MS/TP bus sniffer: decodes every frame on the line without
/// taking a station address, so it never disturbs the token ring.
#[derive(Parser, Debug)]
#[command(name = "mstp-sniff")]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0.
    #[arg(long)]
    device: String,
    #[arg(long, default_value_t = 38400)]
    baud: u32,
    /// Stop after this many seconds and print a summary.
    #[arg(long)]
    seconds: Option<u64>,
    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let serial = PhysicalSerial::open(&args.device, args.baud)?;
    let transport = MstpTransport::start(
        serial,
        MstpConfig {
            station: None,
            ..MstpConfig::default()
        },
    );
    let mut observer = transport
        .take_observer()
        .expect("observer taken exactly once");

    let deadline = args
        .seconds
        .map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    loop {
        let frame = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, observer.recv()).await {
                    Ok(frame) => frame,
                    Err(_) => break,
                }
            }
            None => observer.recv().await,
        };
        let Some(frame) = frame else { break };
        println!(
            "{:?} {} -> {} ({} bytes)",
            frame.frame_type, frame.source, frame.destination, frame.data_len
        );
    }

    let stats = transport.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "frames: {}  crc errors: {}  stations: {:?}",
            stats.frames_in,
            stats.crc_errors,
            stats.stations()
        );
    }
    Ok(())
}
