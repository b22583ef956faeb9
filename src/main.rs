use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use stratum::generator::default_generator;
use stratum::net::{tcp, ws};
use stratum::rules::default_rules;
use stratum::server::Server;

/// Authoritative game server: raw TCP always, WebSocket when a port is
/// given.
#[derive(Debug, Parser)]
#[command(name = "stratum", version)]
struct Args {
    /// Address to listen on.
    host: String,
    /// TCP port for the framed binary protocol.
    port: u16,
    /// Optional port for the WebSocket JSON protocol.
    #[arg(long)]
    ws_port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let rules = default_rules();
    let generator = default_generator(&rules);
    let server = Server::new(rules, generator);

    let tcp_listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding tcp listener on {}:{}", args.host, args.port))?;
    log::info!("tcp server listening on {}:{}", args.host, args.port);

    if let Some(ws_port) = args.ws_port {
        let ws_listener = TcpListener::bind((args.host.as_str(), ws_port))
            .await
            .with_context(|| format!("binding websocket listener on {}:{ws_port}", args.host))?;
        log::info!("websocket server listening on {}:{ws_port}", args.host);
        tokio::spawn(ws::serve(Arc::clone(&server), ws_listener));
    }

    tcp::serve(server, tcp_listener).await;
    Ok(())
}
