use sdfs::{NodeConfig, NodeOptions};
use slog::Drain;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

const USAGE: &str = "usage: sdfs <ip> <gossip_port> <storage_port> <data_dir> [introducer_ip:port]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    }

    let ip_addr: IpAddr = args[0].parse()?;
    let gossip_port: u16 = args[1].parse()?;
    let storage_port: u16 = args[2].parse()?;
    let data_root = PathBuf::from(&args[3]);
    let introducer: Option<SocketAddr> = args.get(4).map(|addr| addr.parse()).transpose()?;

    let node = sdfs::try_create_node(NodeConfig {
        ip_addr,
        gossip_port,
        storage_port,
        introducer,
        data_directory: data_root.join("blocks"),
        download_directory: data_root.join("downloads"),
        info_logger: create_root_logger(),
        options: NodeOptions::default(),
    })
    .await?;

    println!("Node {} is up. Ctrl-C leaves the cluster.", node.id());
    tokio::signal::ctrl_c().await?;
    node.leave().await;

    Ok(())
}

fn create_root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
