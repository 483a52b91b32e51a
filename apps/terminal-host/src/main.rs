mod ws;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use terminal_protocol::hub::{serve_host, HostHub};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::ws::{health_check, websocket_handler, HostState};

#[derive(Parser, Debug)]
#[command(name = "terminal-host", about = "Relay host for the terminal protocol")]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "HOST_PORT", default_value_t = 8888)]
    port: u16,

    /// Optional bearer token terminals must present as `?token=`.
    #[arg(long, env = "HOST_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let hub = HostHub::new();

    // host-side terminal: serves the directory and sweeps phantoms
    let host_terminal = match serve_host(&hub).await {
        Ok(t) => t,
        Err(e) => {
            error!("failed to start host terminal: {e}");
            std::process::exit(1);
        }
    };
    info!(terminal_id = host_terminal.terminal_id(), "host terminal ready");

    let state = HostState::new(hub, cli.token);
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws/:terminal_id", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");
    info!("terminal host listening on {addr}");

    axum::serve(listener, app)
        .await
        .expect("server failed");
}
