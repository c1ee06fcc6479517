use baclink_datalink::{Bbmd6, Bbmd6Config, Vmac};
use baclink_tools::parse_vmac;
use clap::Parser;
use std::net::SocketAddrV6;

/// Run a BACnet/IPv6 broadcast management device.
#[derive(Parser, Debug)]
#[command(name = "bbmd6")]
struct Args {
    #[arg(long, default_value_t = 47808)]
    port: u16,
    /// Fixed virtual MAC (aa:bb:cc); omitted means randomly assigned.
    #[arg(long, value_parser = parse_vmac)]
    vmac: Option<Vmac>,
    /// Interface index for the multicast join (0 = any).
    #[arg(long, default_value_t = 0)]
    interface: u32,
    /// Peer BBMD endpoint; may be repeated.
    #[arg(long = "peer")]
    peers: Vec<SocketAddrV6>,
    /// Also relay forwarded broadcasts onto the local multicast group.
    #[arg(long)]
    multicast_relay: bool,
    /// Share the UDP port with other processes on this host.
    #[arg(long)]
    shared: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let bbmd = Bbmd6::bind(Bbmd6Config {
        port: args.port,
        vmac: args.vmac,
        interface: args.interface,
        peers: args.peers,
        relay_to_multicast: args.multicast_relay,
        shared_socket: args.shared,
    })?;
    println!("bbmd6 on {} as {}", bbmd.local_addr()?, bbmd.vmac());
    bbmd.run().await?;
    Ok(())
}
