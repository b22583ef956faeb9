//! The two protocol phases. PreGame runs the lobby; CmdGameStart builds the
//! world and swaps in InGame, whose background task translates the map's
//! domain events into wire messages.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::api::message::{ClientToServer, ServerToClient};
use crate::game::map::{Map, MapEvent};
use crate::game::{GameError, Player};
use crate::generator::Generator;
use crate::rules::{ActionMode, ActionTargetType, Rules};
use crate::server::{ClientHandle, Server};
use crate::util::{IdRegistry, lock};

pub enum Protocol {
    PreGame(PreGame),
    InGame(InGame),
}

impl Protocol {
    /// Dispatch one message to the handler the active phase has for its
    /// type; unknown types land in `on_unhandled`.
    pub async fn handle(
        &mut self,
        server: &Arc<Server>,
        client: &Arc<ClientHandle>,
        message: ClientToServer,
    ) -> Result<Option<Protocol>, GameError> {
        match self {
            Protocol::PreGame(phase) => phase.handle(server, client, message),
            Protocol::InGame(phase) => phase.handle(server, client, message),
        }
    }

    pub fn on_disconnect(&mut self, server: &Server, client: &Arc<ClientHandle>) {
        match self {
            Protocol::PreGame(phase) => phase.on_disconnect(server, client),
            Protocol::InGame(phase) => phase.on_disconnect(server, client),
        }
    }

    /// Spawn the phase's background task, if it has one.
    pub fn spawn_run(&mut self, server: &Arc<Server>) -> Option<JoinHandle<()>> {
        match self {
            Protocol::PreGame(_) => None,
            Protocol::InGame(phase) => phase.spawn_run(server),
        }
    }
}

fn on_unhandled(message: &ClientToServer) {
    log::debug!("no handler for {message:?} in this phase");
}

/// The lobby. Players join and leave; CmdGameStart publishes the rules,
/// generates the map and hands over to [`InGame`].
pub struct PreGame {
    generator: Generator,
    players: Arc<Mutex<IdRegistry<Arc<Player>>>>,
}

impl PreGame {
    pub fn new(generator: Generator) -> Self {
        Self {
            generator,
            players: Arc::new(Mutex::new(IdRegistry::new())),
        }
    }

    fn handle(
        &mut self,
        server: &Arc<Server>,
        client: &Arc<ClientHandle>,
        message: ClientToServer,
    ) -> Result<Option<Protocol>, GameError> {
        match message {
            ClientToServer::CmdJoin { name } => {
                self.join(server, client, name);
                Ok(None)
            }
            ClientToServer::CmdLeave => {
                self.leave(server, client);
                Ok(None)
            }
            ClientToServer::CmdGameStart => self.start(server).map(Some),
            other => {
                on_unhandled(&other);
                Ok(None)
            }
        }
    }

    fn join(&mut self, server: &Arc<Server>, client: &Arc<ClientHandle>, name: String) {
        if client.player().is_some() {
            client.send(ServerToClient::Error {
                error: "You already joined; I'm ignoring this second CmdJoin.".to_string(),
            });
            return;
        }
        let player = {
            let mut players = lock(&self.players);
            Arc::clone(players.insert_with(|id| {
                Arc::new(Player::new(id, name.clone(), client.outbox(), &server.rules))
            }))
        };
        client.set_player(Some(Arc::clone(&player)));
        server.broadcast(ServerToClient::EventPlayerJoin {
            player_id: player.id,
            name: player.name.clone(),
        });
        log::info!("player joined: {:?}", player.name);
    }

    fn leave(&mut self, server: &Arc<Server>, client: &Arc<ClientHandle>) {
        let Some(player) = client.player() else {
            client.send(ServerToClient::Error {
                error: "You haven't joined; I'm ignoring this CmdLeave.".to_string(),
            });
            return;
        };
        lock(&self.players).remove(player.id);
        client.set_player(None);
        server.broadcast(ServerToClient::EventPlayerLeave {
            player_id: player.id,
        });
        log::info!("player left: {:?}", player.name);
    }

    fn start(&mut self, server: &Arc<Server>) -> Result<Protocol, GameError> {
        self.send_rules(server);
        let (map, events) = self.generator.generate(Arc::clone(&self.players))?;
        let mut phase = InGame::new(Arc::clone(&server.rules), map, events);
        // The generation backlog is translated before anyone hears the game
        // started, so every client sees the world before EventGameStart.
        phase.pump(server);
        for client in server.clients() {
            if let Some(player) = client.player() {
                spawn_resource_watchers(client.as_ref(), &player);
            }
        }
        log::info!("starting game");
        server.broadcast(ServerToClient::EventGameStart);
        Ok(Protocol::InGame(phase))
    }

    fn send_rules(&self, server: &Server) {
        let rules = &server.rules;
        for terrain_type in &rules.terrain_types {
            server.broadcast(ServerToClient::InfoTerrainType {
                terrain_type_id: terrain_type.id,
                name: terrain_type.name.clone(),
                description: terrain_type.description.clone(),
                tags: terrain_type.tags.iter().cloned().collect(),
            });
        }
        for resource_type in &rules.resource_types {
            server.broadcast(ServerToClient::InfoResourceType {
                resource_type_id: resource_type.id,
                name: resource_type.name.clone(),
                description: resource_type.description.clone(),
                start_amount: resource_type.start_amount,
            });
        }
        for unit_type in &rules.unit_types {
            server.broadcast(ServerToClient::InfoUnitType {
                unit_type_id: unit_type.id,
                name: unit_type.name.clone(),
                description: unit_type.description.clone(),
                tags: unit_type.tags.iter().cloned().collect(),
                default_action_type_id: unit_type.default_action_type,
            });
        }
        for action_type in &rules.action_types {
            server.broadcast(ServerToClient::InfoActionType {
                action_type_id: action_type.id,
                name: action_type.name.clone(),
                description: action_type.description.clone(),
                unit_type_id: action_type.unit_type.id,
                cost: action_type
                    .cost
                    .iter()
                    .map(|entry| crate::api::message::ResourceAmount {
                        resource_type_id: entry.resource.id,
                        amount: entry.amount,
                    })
                    .collect(),
                duration: action_type.duration,
                default_mode: action_type.default_mode,
                target_type: action_type.target_type,
                target_tags: action_type.target_tags.iter().cloned().collect(),
            });
        }
    }

    fn on_disconnect(&mut self, server: &Server, client: &Arc<ClientHandle>) {
        if let Some(player) = client.player() {
            lock(&self.players).remove(player.id);
            client.set_player(None);
            server.broadcast(ServerToClient::EventPlayerLeave {
                player_id: player.id,
            });
            log::info!("player disconnected from lobby: {:?}", player.name);
        }
    }
}

/// Forward every resource change to the owning player's client, one watcher
/// per resource, owned by the client so a disconnect cancels them.
fn spawn_resource_watchers(client: &ClientHandle, player: &Arc<Player>) {
    for (&resource_type_id, cell) in &player.resources {
        let cell = Arc::clone(cell);
        let player = Arc::clone(player);
        client.watch(async move {
            loop {
                cell.wait_change().await;
                player.send(ServerToClient::EventPlayerResource {
                    resource_type_id,
                    amount: cell.get(),
                });
            }
        });
    }
}

/// The running game. Consumes the map's event queue and validates inbound
/// unit commands.
pub struct InGame {
    rules: Arc<Rules>,
    map: Arc<Map>,
    events: Option<UnboundedReceiver<MapEvent>>,
}

impl InGame {
    pub fn new(rules: Arc<Rules>, map: Arc<Map>, events: UnboundedReceiver<MapEvent>) -> Self {
        Self {
            rules,
            map,
            events: Some(events),
        }
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Synchronously translate whatever the queue already holds.
    fn pump(&mut self, server: &Server) {
        if let Some(events) = self.events.as_mut() {
            while let Ok(event) = events.try_recv() {
                Self::dispatch(server, &event);
            }
        }
    }

    fn spawn_run(&mut self, server: &Arc<Server>) -> Option<JoinHandle<()>> {
        let mut events = self.events.take()?;
        let server = Arc::clone(server);
        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                Self::dispatch(&server, &event);
            }
        }))
    }

    /// The domain-event to wire-message table. World changes broadcast;
    /// action lifecycle and economy updates go to the owner alone. Events
    /// for units that fell back to the neutral owner have no recipient.
    fn dispatch(server: &Server, event: &MapEvent) {
        match event {
            MapEvent::Generated { width, height } => {
                server.broadcast(ServerToClient::EventMapGenerate {
                    width: *width,
                    height: *height,
                });
            }
            MapEvent::CellTerrain {
                position,
                terrain_type,
            } => {
                server.broadcast(ServerToClient::EventMapGenerateCell {
                    position: (*position).into(),
                    terrain_type_id: terrain_type.id,
                });
            }
            MapEvent::UnitCreated { position, unit } => {
                server.broadcast(ServerToClient::EventUnitCreate {
                    unit_id: unit.id,
                    player_id: unit.player().map(|player| player.id).unwrap_or(0),
                    unit_type_id: unit.unit_type.id,
                    position: (*position).into(),
                });
            }
            MapEvent::UnitMoved { unit, position } => {
                server.broadcast(ServerToClient::EventUnitMove {
                    unit_id: unit.id,
                    position: (*position).into(),
                });
            }
            MapEvent::ActionUpdate {
                action,
                state,
                message,
            } => {
                if let Some(player) = action.unit.player() {
                    player.send(ServerToClient::EventActionUpdate {
                        action_id: action.id,
                        state: *state,
                        message: message.clone(),
                    });
                }
            }
            MapEvent::ActionDequeued { action } => {
                if let Some(player) = action.unit.player() {
                    player.send(ServerToClient::EventActionDequeued {
                        action_id: action.id,
                    });
                }
            }
        }
    }

    fn handle(
        &mut self,
        server: &Arc<Server>,
        client: &Arc<ClientHandle>,
        message: ClientToServer,
    ) -> Result<Option<Protocol>, GameError> {
        match message {
            ClientToServer::CmdActionQueue {
                action_type_id,
                unit_id,
                target_unit_id,
                target_cell,
                mode,
            } => {
                self.action_queue(
                    client,
                    action_type_id,
                    unit_id,
                    target_unit_id,
                    target_cell.map(|cell| (cell.x, cell.y)),
                    mode,
                )?;
            }
            ClientToServer::CmdActionCancel { action_id } => {
                self.action_cancel(client, action_id)?;
            }
            ClientToServer::CmdLeave => {
                self.leave(server, client)?;
            }
            other => on_unhandled(&other),
        }
        Ok(None)
    }

    fn action_queue(
        &mut self,
        client: &Arc<ClientHandle>,
        action_type_id: u32,
        unit_id: u32,
        target_unit_id: Option<u32>,
        target_cell: Option<(u32, u32)>,
        mode: ActionMode,
    ) -> Result<(), GameError> {
        let player = client
            .player()
            .ok_or_else(|| GameError::rule("You haven't joined this game"))?;
        let action_type = Arc::clone(
            self.rules
                .action_type(action_type_id)
                .ok_or_else(|| GameError::rule("Unknown action type"))?,
        );
        let unit = self
            .map
            .unit(unit_id)
            .ok_or_else(|| GameError::rule("Unknown unit"))?;

        if unit.player().map(|owner| owner.id) != Some(player.id) {
            return Err(GameError::Owner { unit_id: unit.id });
        }
        if action_type.unit_type.id != unit.unit_type.id {
            return Err(GameError::rule(
                "This action type cannot be performed by this unit.",
            ));
        }

        let target_unit = match target_unit_id {
            Some(id) => Some(
                self.map
                    .unit(id)
                    .ok_or_else(|| GameError::rule("Unknown target unit"))?,
            ),
            None => None,
        };
        if let Some(target) = &target_unit {
            if action_type.target_type != ActionTargetType::Unit {
                return Err(GameError::rule("This action does not work on units"));
            }
            if !action_type.target_tags.is_subset(&target.unit_type.tags) {
                return Err(GameError::rule(
                    "Target unit does not have the necessary tags",
                ));
            }
        }
        if let Some(cell) = target_cell {
            if action_type.target_type != ActionTargetType::Cell {
                return Err(GameError::rule("This action does not work on cells"));
            }
            if !self.map.contains(cell) {
                return Err(GameError::rule("Target cell is not inside the map"));
            }
            let tags_ok = match self.map.terrain_at(cell)? {
                Some(terrain) => action_type.target_tags.is_subset(&terrain.tags),
                None => action_type.target_tags.is_empty(),
            };
            if !tags_ok {
                return Err(GameError::rule(
                    "Target cell does not have the necessary tags",
                ));
            }
        }
        if action_type.target_type == ActionTargetType::Unit && target_unit.is_none() {
            return Err(GameError::rule("This action requires a unit target"));
        }
        if action_type.target_type == ActionTargetType::Cell && target_cell.is_none() {
            return Err(GameError::rule("This action requires a cell target"));
        }

        let action = self
            .map
            .action_queue(&action_type, &unit, mode, target_unit, target_cell);
        client.send(ServerToClient::EventActionQueued {
            action_id: action.id,
            unit_id: unit.id,
        });
        Ok(())
    }

    fn action_cancel(&mut self, client: &Arc<ClientHandle>, action_id: u32) -> Result<(), GameError> {
        let player = client
            .player()
            .ok_or_else(|| GameError::rule("You haven't joined this game"))?;
        let action = self
            .map
            .action(action_id)
            .ok_or_else(|| GameError::rule("Unknown action"))?;
        if action.unit.player().map(|owner| owner.id) != Some(player.id) {
            return Err(GameError::Owner {
                unit_id: action.unit.id,
            });
        }
        action.unit.cancel_action(action_id)
    }

    fn leave(&mut self, server: &Arc<Server>, client: &Arc<ClientHandle>) -> Result<(), GameError> {
        let player = client
            .player()
            .ok_or_else(|| GameError::rule("You haven't joined; I'm ignoring this CmdLeave."))?;
        self.map.remove_player(player.id);
        client.set_player(None);
        self.map.repossess(player.id);
        server.broadcast(ServerToClient::EventPlayerLeave {
            player_id: player.id,
        });
        log::info!("player left: {:?}", player.name);
        client.close();
        Ok(())
    }

    fn on_disconnect(&mut self, server: &Server, client: &Arc<ClientHandle>) {
        if let Some(player) = client.player() {
            self.map.remove_player(player.id);
            client.set_player(None);
            self.map.repossess(player.id);
            server.broadcast(ServerToClient::EventPlayerLeave {
                player_id: player.id,
            });
            log::info!("player disconnected: {:?}", player.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::message::CellPos;
    use crate::generator::default_generator;
    use crate::rules::{ActionMode, default_rules};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_server() -> Arc<Server> {
        let rules = default_rules();
        let generator = default_generator(&rules);
        Server::new(rules, generator)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerToClient>) -> Vec<ServerToClient> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn join(server: &Arc<Server>, client: &Arc<ClientHandle>, name: &str) {
        server
            .handle(client, ClientToServer::CmdJoin { name: name.into() })
            .await;
    }

    #[tokio::test]
    async fn double_join_creates_one_player_and_one_error() {
        let server = test_server();
        let (client, mut rx, _) = server.add_client();

        join(&server, &client, "A").await;
        join(&server, &client, "A").await;

        let messages = drain(&mut rx);
        assert_eq!(
            messages,
            vec![
                ServerToClient::EventPlayerJoin {
                    player_id: 1,
                    name: "A".into()
                },
                ServerToClient::Error {
                    error: "You already joined; I'm ignoring this second CmdJoin.".into()
                },
            ]
        );
        assert_eq!(client.player().map(|p| p.id), Some(1));
    }

    #[tokio::test]
    async fn leave_without_join_is_an_error() {
        let server = test_server();
        let (client, mut rx, _) = server.add_client();

        server.handle(&client, ClientToServer::CmdLeave).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerToClient::Error {
                error: "You haven't joined; I'm ignoring this CmdLeave.".into()
            }]
        );
    }

    #[tokio::test]
    async fn lobby_join_and_leave_broadcast_to_everyone() {
        let server = test_server();
        let (a, mut rx_a, _) = server.add_client();
        let (_b, mut rx_b, _) = server.add_client();

        join(&server, &a, "A").await;
        server.handle(&a, ClientToServer::CmdLeave).await;

        let expected = vec![
            ServerToClient::EventPlayerJoin {
                player_id: 1,
                name: "A".into(),
            },
            ServerToClient::EventPlayerLeave { player_id: 1 },
        ];
        assert_eq!(drain(&mut rx_a), expected);
        assert_eq!(drain(&mut rx_b), expected);
    }

    #[tokio::test]
    async fn game_start_publishes_rules_world_then_start() {
        let server = test_server();
        let (a, mut rx_a, _) = server.add_client();
        let (b, mut rx_b, _) = server.add_client();

        join(&server, &a, "A").await;
        join(&server, &b, "B").await;
        server.handle(&a, ClientToServer::CmdGameStart).await;

        let messages = drain(&mut rx_a);
        // Two joins first.
        assert!(matches!(
            messages[0],
            ServerToClient::EventPlayerJoin { player_id: 1, .. }
        ));
        assert!(matches!(
            messages[1],
            ServerToClient::EventPlayerJoin { player_id: 2, .. }
        ));
        // The full catalog: 3 terrains, 3 resources, 4 units, 3 actions.
        let infos = &messages[2..15];
        assert!(infos.iter().all(|message| matches!(
            message,
            ServerToClient::InfoTerrainType { .. }
                | ServerToClient::InfoResourceType { .. }
                | ServerToClient::InfoUnitType { .. }
                | ServerToClient::InfoActionType { .. }
        )));
        // Two players on 399 cells each: 29x29.
        assert_eq!(
            messages[15],
            ServerToClient::EventMapGenerate {
                width: 29,
                height: 29
            }
        );
        let cells = messages
            .iter()
            .filter(|message| matches!(message, ServerToClient::EventMapGenerateCell { .. }))
            .count();
        assert_eq!(cells, 29 * 29);
        // Exactly one city per player, created after the terrain.
        let bases: Vec<_> = messages
            .iter()
            .filter(|message| {
                matches!(
                    message,
                    ServerToClient::EventUnitCreate { player_id, .. } if *player_id != 0
                )
            })
            .collect();
        assert_eq!(bases.len(), 2);
        // The world is complete before anyone hears the game started.
        assert_eq!(messages.last(), Some(&ServerToClient::EventGameStart));

        // The other client saw the same world.
        let other = drain(&mut rx_b);
        assert_eq!(other.len(), messages.len());
        assert_eq!(other.last(), Some(&ServerToClient::EventGameStart));
    }

    async fn started_game(
        server: &Arc<Server>,
    ) -> (
        Arc<ClientHandle>,
        UnboundedReceiver<ServerToClient>,
        Arc<Map>,
    ) {
        let (client, mut rx, _) = server.add_client();
        join(server, &client, "A").await;
        server.handle(&client, ClientToServer::CmdGameStart).await;
        drain(&mut rx);
        let map = {
            let protocol = server.protocol.lock().await;
            match &*protocol {
                Protocol::InGame(phase) => Arc::clone(phase.map()),
                Protocol::PreGame(_) => panic!("game did not start"),
            }
        };
        (client, rx, map)
    }

    #[tokio::test]
    async fn queueing_on_someone_elses_unit_is_rejected() {
        let server = test_server();
        let (client, mut rx, map) = started_game(&server).await;
        let (intruder, mut intruder_rx, _) = server.add_client();

        let city = map
            .units()
            .into_iter()
            .find(|unit| unit.player().is_some())
            .expect("player city");

        // The intruder never joined, the owner uses the wrong action type.
        server
            .handle(
                &intruder,
                ClientToServer::CmdActionQueue {
                    action_type_id: 2,
                    unit_id: city.id,
                    target_unit_id: None,
                    target_cell: None,
                    mode: ActionMode::Once,
                },
            )
            .await;
        assert_eq!(
            drain(&mut intruder_rx),
            vec![ServerToClient::Error {
                error: "You haven't joined this game".into()
            }]
        );

        server
            .handle(
                &client,
                ClientToServer::CmdActionQueue {
                    action_type_id: 1,
                    unit_id: city.id,
                    target_unit_id: None,
                    target_cell: None,
                    mode: ActionMode::Once,
                },
            )
            .await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerToClient::Error {
                error: "This action type cannot be performed by this unit.".into()
            }]
        );
    }

    #[tokio::test]
    async fn targeted_actions_validate_their_targets() {
        let server = test_server();
        let (client, mut rx, map) = started_game(&server).await;

        let city = map
            .units()
            .into_iter()
            .find(|unit| unit.player().is_some())
            .expect("player city");
        let player = city.player().expect("owner");
        let citizen_type = server
            .rules
            .unit_type_named("citizen")
            .expect("citizen")
            .clone();
        let citizen = map
            .create_unit_near(&city, &citizen_type, Some(&player))
            .expect("space for a citizen");

        // Farming requires a unit target...
        server
            .handle(
                &client,
                ClientToServer::CmdActionQueue {
                    action_type_id: 1,
                    unit_id: citizen.id,
                    target_unit_id: None,
                    target_cell: None,
                    mode: ActionMode::Once,
                },
            )
            .await;
        // ...with the right tags.
        server
            .handle(
                &client,
                ClientToServer::CmdActionQueue {
                    action_type_id: 1,
                    unit_id: citizen.id,
                    target_unit_id: Some(city.id),
                    target_cell: None,
                    mode: ActionMode::Once,
                },
            )
            .await;
        // Cell targets must be inside the map.
        server
            .handle(
                &client,
                ClientToServer::CmdActionQueue {
                    action_type_id: 3,
                    unit_id: citizen.id,
                    target_unit_id: None,
                    target_cell: Some(CellPos { x: 999, y: 999 }),
                    mode: ActionMode::Once,
                },
            )
            .await;

        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|message| match message {
                ServerToClient::Error { error } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![
                "This action requires a unit target".to_string(),
                "Target unit does not have the necessary tags".to_string(),
                "Target cell is not inside the map".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn queue_and_cancel_round_trip() {
        let server = test_server();
        let (client, mut rx, map) = started_game(&server).await;
        let city = map
            .units()
            .into_iter()
            .find(|unit| unit.player().is_some())
            .expect("player city");

        server
            .handle(
                &client,
                ClientToServer::CmdActionQueue {
                    action_type_id: 2,
                    unit_id: city.id,
                    target_unit_id: None,
                    target_cell: None,
                    mode: ActionMode::Once,
                },
            )
            .await;
        let queued = rx.recv().await.expect("queued event");
        let action_id = match queued {
            ServerToClient::EventActionQueued { action_id, unit_id } => {
                assert_eq!(unit_id, city.id);
                action_id
            }
            other => panic!("expected EventActionQueued, got {other:?}"),
        };

        // Cancelling an unknown action is an error the sender sees.
        server
            .handle(&client, ClientToServer::CmdActionCancel { action_id: 999 })
            .await;
        let mut saw_error = false;
        for _ in 0..6 {
            match rx.recv().await {
                Some(ServerToClient::Error { error }) => {
                    assert_eq!(error, "Unknown action");
                    saw_error = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_error);

        server
            .handle(&client, ClientToServer::CmdActionCancel { action_id })
            .await;
        // The pipeline winds down with CANCELLED and the dequeue.
        let mut saw_dequeue = false;
        for _ in 0..8 {
            match rx.recv().await {
                Some(ServerToClient::EventActionDequeued { action_id: id }) => {
                    assert_eq!(id, action_id);
                    saw_dequeue = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_dequeue);
        assert!(map.action(action_id).is_none());
    }

    #[tokio::test]
    async fn disconnect_repossesses_units_and_cancels_their_actions() {
        let server = test_server();
        let (client, _rx, map) = started_game(&server).await;
        let city = map
            .units()
            .into_iter()
            .find(|unit| unit.player().is_some())
            .expect("player city");

        server
            .handle(
                &client,
                ClientToServer::CmdActionQueue {
                    action_type_id: 2,
                    unit_id: city.id,
                    target_unit_id: None,
                    target_cell: None,
                    mode: ActionMode::Once,
                },
            )
            .await;

        server.remove_client(&client).await;

        assert!(city.player().is_none(), "city fell back to neutral");
        assert!(map.players().is_empty());
        // The queued action's task was aborted and dequeued itself.
        for _ in 0..16 {
            if map.action(1).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(map.action(1).is_none());
    }
}
