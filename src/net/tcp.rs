use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::api::message::{ClientToServer, ServerToClient};
use crate::api::schema::{Binary, Schema};
use crate::net::{NetError, framing};
use crate::server::Server;

/// Accept raw TCP connections and run one client per connection, exchanging
/// binary-encoded wrappers in length-prefixed frames.
pub async fn serve(server: Arc<Server>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    run_client(server, stream, addr).await;
                });
            }
            Err(err) => log::warn!("tcp accept failed: {err}"),
        }
    }
}

async fn run_client(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    let (mut reader, writer) = stream.into_split();
    let (client, outbox, shutdown) = server.add_client();
    log::info!("tcp client connected: {addr}");

    let send_task = tokio::spawn(run_send(writer, outbox, shutdown.clone()));

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            frame = framing::read_frame(&mut reader) => {
                match frame {
                    Ok(payload) => match Binary::decode::<ClientToServer>(&payload) {
                        Ok(message) => server.handle(&client, message).await,
                        Err(err) => {
                            log::warn!("closing {addr}: undecodable frame: {err}");
                            break;
                        }
                    },
                    Err(NetError::Disconnected) => break,
                    Err(err) => {
                        log::warn!("closing {addr}: {err}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    send_task.abort();
    server.remove_client(&client).await;
    log::info!("tcp client disconnected: {addr}");
}

/// Drain the outbound queue in submission order. The biased select finishes
/// writing everything already queued before honoring a shutdown.
async fn run_send(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbox: UnboundedReceiver<ServerToClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            message = outbox.recv() => {
                let Some(message) = message else { break };
                let payload = match Binary::encode(&message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::error!("dropping unencodable message: {err}");
                        continue;
                    }
                };
                if framing::write_frame(&mut writer, &payload).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}
