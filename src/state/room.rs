use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;

use super::AppState;
use crate::error::RoomError;
use crate::protocol::{RoomSnapshot, ServerMessage, SettingsInput};
use crate::types::*;

const CODE_BYTES: usize = 2; // 4 hex characters

// Upper bounds keep the downstream round-count and millisecond math in
// range (`cycles * players.len()` and `timer_minutes * 60_000`).
const MAX_CYCLES: u32 = 100;
const MAX_TIMER_MINUTES: u64 = 60;
const MAX_ROOM_CAPACITY: usize = 16;

/// Generate a room code that is not already in use.
fn generate_room_code(rooms: &HashMap<RoomCode, Room>) -> RoomCode {
    loop {
        let mut bytes = [0u8; CODE_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let code = hex::encode_upper(bytes);
        if !rooms.contains_key(&code) {
            break code;
        }
        // Collision - try again (rare until the registry saturates)
    }
}

/// Apply defaults and bounds to host-submitted settings.
fn normalize_settings(input: SettingsInput) -> Result<RoomSettings, RoomError> {
    let defaults = RoomSettings::default();

    let cycles = input.cycles.unwrap_or(defaults.cycles);
    if cycles < 1 || cycles > MAX_CYCLES {
        return Err(RoomError::InvalidSettings(format!(
            "cycles must be between 1 and {}",
            MAX_CYCLES
        )));
    }

    let timer_millis = match input.timer_minutes {
        Some(minutes) => {
            if minutes < 1 || minutes > MAX_TIMER_MINUTES {
                return Err(RoomError::InvalidSettings(format!(
                    "round timer must be between 1 and {} minutes",
                    MAX_TIMER_MINUTES
                )));
            }
            minutes * 60_000
        }
        None => defaults.timer_millis,
    };

    let max_players = input.max_players.unwrap_or(defaults.max_players);
    if max_players < 1 || max_players > MAX_ROOM_CAPACITY {
        return Err(RoomError::InvalidSettings(format!(
            "room capacity must be between 1 and {}",
            MAX_ROOM_CAPACITY
        )));
    }

    Ok(RoomSettings {
        cycles,
        timer_millis,
        max_players,
    })
}

impl AppState {
    /// Found a new room with the caller as its only player and host.
    pub async fn create_room(&self, client_id: &str, name: String) -> RoomSnapshot {
        let mut rooms = self.rooms.write().await;
        let code = generate_room_code(&rooms);
        let founder = Player {
            id: client_id.to_string(),
            name,
        };
        let room = Room::new(code.clone(), founder);
        let snapshot = RoomSnapshot::from(&room);
        rooms.insert(code.clone(), room);
        tracing::info!(%code, "room created");
        snapshot
    }

    /// Add a player to an existing lobby.
    pub async fn join_room(
        &self,
        client_id: &str,
        code: &str,
        name: String,
    ) -> Result<RoomSnapshot, RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| RoomError::NotFound(code.to_string()))?;

        if room.started {
            return Err(RoomError::AlreadyStarted);
        }
        if room.players.iter().any(|p| p.name == name) {
            return Err(RoomError::NameConflict(name));
        }
        if room.players.len() >= room.settings.max_players {
            return Err(RoomError::RoomFull(code.to_string()));
        }

        room.players.push(Player {
            id: client_id.to_string(),
            name,
        });
        tracing::info!(%code, players = room.players.len(), "player joined");

        let snapshot = RoomSnapshot::from(&*room);
        self.broadcast_room(
            room,
            ServerMessage::PlayerList {
                players: room.player_names(),
            },
        )
        .await;
        Ok(snapshot)
    }

    /// Host-only: confirm the room's settings before start.
    ///
    /// A non-host caller is a silent no-op toward the room.
    pub async fn set_settings(
        &self,
        client_id: &str,
        code: &str,
        input: SettingsInput,
    ) -> Result<(), RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| RoomError::NotFound(code.to_string()))?;

        if !room.is_host(client_id) {
            tracing::debug!(%code, %client_id, "ignoring settings from non-host");
            return Ok(());
        }
        if room.started {
            return Err(RoomError::AlreadyStarted);
        }

        room.settings = normalize_settings(input)?;
        room.settings_confirmed = true;
        tracing::info!(%code, settings = ?room.settings, "settings confirmed");

        self.broadcast_room(
            room,
            ServerMessage::SettingsUpdated {
                settings: room.settings.clone(),
                players: room.player_names(),
            },
        )
        .await;
        Ok(())
    }

    /// Remove a departed connection from every room it occupies.
    ///
    /// Mid-game, the departed player's slot is compacted out of all four
    /// index-aligned sequences together, so the alignment invariant holds
    /// for the remaining players. The artifact the player was holding
    /// leaves the game with them.
    pub async fn disconnect(self: &Arc<Self>, client_id: &str) {
        let mut rooms = self.rooms.write().await;
        let codes: Vec<RoomCode> = rooms
            .iter()
            .filter(|(_, room)| room.player_index(client_id).is_some())
            .map(|(code, _)| code.clone())
            .collect();

        for code in codes {
            // Take the room out while we rework it; the registry lock is
            // held throughout, so no other transition can observe the gap.
            let mut room = match rooms.remove(&code) {
                Some(room) => room,
                None => continue,
            };
            let idx = match room.player_index(client_id) {
                Some(idx) => idx,
                None => {
                    rooms.insert(code, room);
                    continue;
                }
            };

            // A running grace window is never cancelled; rotation is
            // guaranteed once it starts.
            if room.round_phase != RoundPhase::Ending {
                room.cancel_timer();
            }

            room.players.remove(idx);
            room.agreements.remove(client_id);
            if room.started && !room.ended && idx < room.projects.len() {
                room.projects.remove(idx);
                room.owners.remove(idx);
                room.uploaded.remove(idx);
            }

            if room.players.is_empty() {
                room.cancel_timer();
                tracing::info!(%code, "room deleted (empty)");
                continue;
            }

            if room.host_id == client_id {
                room.host_id = room.players[0].id.clone();
                tracing::info!(%code, new_host = %room.players[0].name, "host reassigned");
            }

            self.broadcast_room(
                &room,
                ServerMessage::PlayerList {
                    players: room.player_names(),
                },
            )
            .await;

            if room.started && !room.ended {
                if room.current_round > room.max_rounds() {
                    // The round bound shrank below the current round.
                    self.end_room(&mut room).await;
                } else if room.round_phase == RoundPhase::Running {
                    if room.agreements.len() == room.players.len() {
                        // The departure satisfied unanimity.
                        self.begin_round_ending(&mut room).await;
                    } else {
                        // The live deadline was cancelled above; re-arm a
                        // fresh one so the round does not stall.
                        self.start_round_timer(&mut room);
                        self.broadcast_room(
                            &room,
                            ServerMessage::GameState {
                                state: (&room).into(),
                            },
                        )
                        .await;
                    }
                }
            }

            rooms.insert(code, room);
        }
    }

    /// Remove a room that ended and lingered past its retention window.
    pub async fn delete_ended_room(&self, code: &str) {
        let mut rooms = self.rooms.write().await;
        let ended = rooms.get(code).map(|room| room.ended).unwrap_or(false);
        if ended {
            if let Some(mut room) = rooms.remove(code) {
                room.cancel_timer();
            }
            tracing::info!(%code, "room deleted (ended)");
        }
    }
}
