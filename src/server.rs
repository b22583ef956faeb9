//! The server core: the set of connected clients, the active protocol phase
//! and its background task, and the broadcast primitive. Transports register
//! clients here and feed decoded messages into [`Server::handle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::message::{ClientToServer, ServerToClient};
use crate::game::Player;
use crate::generator::Generator;
use crate::rules::Rules;
use crate::server::protocol::{PreGame, Protocol};
use crate::util::{TaskGroup, lock};

pub mod protocol;

/// One connected client, transport-agnostic. The outbound queue preserves
/// submission order; the shutdown signal lets the server close a connection
/// from its side.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: u64,
    outbox: UnboundedSender<ServerToClient>,
    shutdown: watch::Sender<bool>,
    player: Mutex<Option<Arc<Player>>>,
    watchers: Mutex<TaskGroup>,
}

impl ClientHandle {
    pub fn send(&self, message: ServerToClient) {
        let _ = self.outbox.send(message);
    }

    /// A clone of the outbound queue, used as the player's non-owning
    /// back-reference to this client.
    pub fn outbox(&self) -> UnboundedSender<ServerToClient> {
        self.outbox.clone()
    }

    /// Ask the transport tasks to wind the connection down.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn player(&self) -> Option<Arc<Player>> {
        lock(&self.player).clone()
    }

    pub(crate) fn set_player(&self, player: Option<Arc<Player>>) {
        *lock(&self.player) = player;
    }

    /// Attach a background task to this client; it is cancelled when the
    /// client disconnects.
    pub(crate) fn watch(&self, future: impl Future<Output = ()> + Send + 'static) {
        lock(&self.watchers).spawn(future);
    }
}

pub struct Server {
    pub rules: Arc<Rules>,
    clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
    protocol: tokio::sync::Mutex<Protocol>,
    protocol_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(rules: Arc<Rules>, generator: Generator) -> Arc<Self> {
        Arc::new(Self {
            rules,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            protocol: tokio::sync::Mutex::new(Protocol::PreGame(PreGame::new(generator))),
            protocol_task: Mutex::new(None),
        })
    }

    /// Register a connection. Returns the handle plus the receiving ends the
    /// transport drives: the outbound queue and the shutdown signal.
    pub fn add_client(
        &self,
    ) -> (
        Arc<ClientHandle>,
        UnboundedReceiver<ServerToClient>,
        watch::Receiver<bool>,
    ) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = Arc::new(ClientHandle {
            id,
            outbox,
            shutdown,
            player: Mutex::new(None),
            watchers: Mutex::new(TaskGroup::new()),
        });
        lock(&self.clients).insert(id, Arc::clone(&client));
        (client, outbox_rx, shutdown_rx)
    }

    /// Drop a connection and let the active protocol clean up after it.
    pub async fn remove_client(self: &Arc<Self>, client: &Arc<ClientHandle>) {
        lock(&self.clients).remove(&client.id);
        lock(&client.watchers).cancel_all();
        let mut protocol = self.protocol.lock().await;
        protocol.on_disconnect(self, client);
    }

    pub fn clients(&self) -> Vec<Arc<ClientHandle>> {
        lock(&self.clients).values().cloned().collect()
    }

    /// Enqueue a message to every connected client.
    pub fn broadcast(&self, message: ServerToClient) {
        for client in lock(&self.clients).values() {
            client.send(message.clone());
        }
    }

    /// Dispatch one inbound message through the active protocol. A
    /// `GameError` is reported to the sender only; a phase transition
    /// returned by the handler is installed before the next message runs.
    pub async fn handle(self: &Arc<Self>, client: &Arc<ClientHandle>, message: ClientToServer) {
        let mut protocol = self.protocol.lock().await;
        match protocol.handle(self, client, message).await {
            Ok(Some(next)) => self.install(&mut protocol, next),
            Ok(None) => {}
            Err(err) => client.send(ServerToClient::Error {
                error: err.to_string(),
            }),
        }
    }

    /// Replace the active protocol, cancelling the previous phase's
    /// background task before the new one spawns.
    fn install(self: &Arc<Self>, slot: &mut Protocol, next: Protocol) {
        if let Some(task) = lock(&self.protocol_task).take() {
            task.abort();
        }
        *slot = next;
        *lock(&self.protocol_task) = slot.spawn_run(self);
    }
}
