use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use log::LevelFilter;
use watchalong_fabric::{logging, Fabric, FabricConfig, FabricEvent};

enum Mode {
    Share(PathBuf),
    Join(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    if logging::init(LevelFilter::Info).is_err() {
        eprintln!("logger already installed");
    }
    let args: Vec<String> = std::env::args().collect();
    let mode = match (args.get(1).map(String::as_str), args.get(2)) {
        (Some("share"), Some(path)) => Mode::Share(PathBuf::from(path)),
        (Some("join"), Some(magnet)) => Mode::Join(magnet.clone()),
        _ => {
            eprintln!("usage: watchalong-fabric share <file> | join <magnet>");
            return ExitCode::from(2);
        }
    };
    match run(mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(mode: Mode) -> Result<(), watchalong_fabric::FabricError> {
    let fabric = Fabric::start(FabricConfig::default()).await?;
    let mut events = fabric.subscribe();

    match mode {
        Mode::Share(path) => {
            let magnet = fabric.share(&path).await?;
            println!("share this link:\n{magnet}");
        }
        Mode::Join(magnet) => fabric.join(&magnet).await?,
    }

    let gateway = fabric
        .serve_gateway(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await?;
    println!("local stream: http://{gateway}/stream");

    while let Some(event) = events.recv().await {
        match event {
            FabricEvent::Ready { name, length } => {
                log::info!("unit ready: {name} ({length} bytes)")
            }
            FabricEvent::Progress(p) if p.done => log::info!("replication complete"),
            FabricEvent::PeerConnected { peer } => log::info!("peer joined: {peer}"),
            FabricEvent::PeerDisconnected { peer } => log::info!("peer left: {peer}"),
            FabricEvent::SessionUp { peer } => log::info!("direct session up with {peer}"),
            FabricEvent::Command { peer, command } => {
                log::info!("command from {peer}: {:?}", command.kind)
            }
            _ => {}
        }
    }
    Ok(())
}
