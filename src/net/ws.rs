use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{WebSocketStream, accept_async};

use crate::api::message::{ClientToServer, ServerToClient};
use crate::api::schema::{Json, Schema};
use crate::server::Server;

/// Accept WebSocket connections and run one client per connection. Outbound
/// wrappers travel as text frames carrying the JSON projection; inbound
/// text and binary frames are both accepted.
pub async fn serve(server: Arc<Server>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    run_client(server, stream, addr).await;
                });
            }
            Err(err) => log::warn!("websocket accept failed: {err}"),
        }
    }
}

async fn run_client(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(err) => {
            log::warn!("websocket handshake with {addr} failed: {err}");
            return;
        }
    };
    let (write, mut read) = ws_stream.split();
    let (client, outbox, shutdown) = server.add_client();
    log::info!("websocket client connected: {addr}");

    let send_task = tokio::spawn(run_send(write, outbox, shutdown.clone()));

    let mut shutdown = shutdown;
    loop {
        tokio::select! {
            frame = read.next() => {
                let payload: Vec<u8> = match frame {
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.into(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        log::warn!("closing {addr}: {err}");
                        break;
                    }
                };
                match Json::decode::<ClientToServer>(&payload) {
                    Ok(message) => server.handle(&client, message).await,
                    Err(err) => {
                        log::warn!("closing {addr}: undecodable message: {err}");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    send_task.abort();
    server.remove_client(&client).await;
    log::info!("websocket client disconnected: {addr}");
}

async fn run_send(
    mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbox: UnboundedReceiver<ServerToClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            message = outbox.recv() => {
                let Some(message) = message else { break };
                let payload = match Json::encode(&message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        log::error!("dropping unencodable message: {err}");
                        continue;
                    }
                };
                let text = match Utf8Bytes::try_from(payload) {
                    Ok(text) => text,
                    Err(err) => {
                        log::error!("dropping non-utf8 json payload: {err}");
                        continue;
                    }
                };
                if write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    let _ = write.send(Message::Close(None)).await;
}
