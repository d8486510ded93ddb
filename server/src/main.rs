use clap::Parser;
use log::info;
use server::concurrency::ConcurrencyController;
use server::game::GameStore;
use server::hub::{handle_connection, Hub};
use shared::{Position, GRID_HEIGHT, GRID_WIDTH};
use std::sync::Arc;
use tokio::net::TcpListener;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// WebSocket port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let store = Arc::new(GameStore::new(Position {
        x: GRID_WIDTH,
        y: GRID_HEIGHT,
    }));
    let controller = Arc::new(ConcurrencyController::new(Arc::clone(&store)));
    let (hub, hub_task) = Hub::new(store, controller);

    // The hub event loop owns the session set for the life of the process
    tokio::spawn(hub_task.run());

    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on {}", addr);
    info!("Grid {}x{}, waiting for players", GRID_WIDTH, GRID_HEIGHT);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let hub = Arc::clone(&hub);
        tokio::spawn(async move {
            handle_connection(hub, stream, peer_addr).await;
        });
    }

    Ok(())
}
