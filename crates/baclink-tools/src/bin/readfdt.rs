use baclink_datalink::{BacnetIpTransport, BipConfig};
use clap::Parser;
use std::net::SocketAddrV4;

/// Register with a BBMD as a foreign device and dump its foreign device
/// table.
#[derive(Parser, Debug)]
#[command(name = "readfdt")]
struct Args {
    #[arg(long)]
    bbmd: SocketAddrV4,
    #[arg(long, default_value_t = 60)]
    foreign_ttl: u16,
    /// Local UDP port (0 = ephemeral).
    #[arg(long, default_value_t = 0)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let transport = BacnetIpTransport::bind_foreign(
        BipConfig {
            port: args.port,
            ..BipConfig::default()
        },
        args.bbmd,
    )?;
    transport.register_foreign_device(args.foreign_ttl).await?;

    let entries = transport.read_foreign_device_table().await?;
    if entries.is_empty() {
        println!("fdt is empty");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  ttl {}s  remaining {}s",
            entry.address, entry.ttl_seconds, entry.remaining_seconds
        );
    }
    Ok(())
}
