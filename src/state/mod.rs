mod game;
mod room;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::ServerMessage;
use crate::types::*;

/// Outbound channel for a single connection.
pub type ConnectionSender = mpsc::UnboundedSender<ServerMessage>;

/// Shared application state: the room registry plus the connection registry.
///
/// Each room acts as a broadcast topic — its subscriber set is exactly its
/// current player list, resolved through `connections` at send time.
pub struct AppState {
    pub rooms: Arc<RwLock<HashMap<RoomCode, Room>>>,
    pub connections: Arc<RwLock<HashMap<ClientId, ConnectionSender>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_connection(&self, client_id: &str, tx: ConnectionSender) {
        self.connections
            .write()
            .await
            .insert(client_id.to_string(), tx);
    }

    pub async fn unregister_connection(&self, client_id: &str) {
        self.connections.write().await.remove(client_id);
    }

    /// Send a message to a single connection. Gone connections are fine —
    /// the socket loop cleans them up on its own.
    pub async fn send_to(&self, client_id: &str, msg: ServerMessage) {
        if let Some(tx) = self.connections.read().await.get(client_id) {
            let _ = tx.send(msg);
        }
    }

    /// Broadcast a message to every player currently in the room.
    pub async fn broadcast_room(&self, room: &Room, msg: ServerMessage) {
        let connections = self.connections.read().await;
        for player in &room.players {
            if let Some(tx) = connections.get(&player.id) {
                let _ = tx.send(msg.clone());
            }
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
