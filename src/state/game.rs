use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use super::AppState;
use crate::error::RoomError;
use crate::protocol::{ProjectSummary, ServerMessage};
use crate::timer;
use crate::types::*;

/// Where the grace window ends, as a client-facing countdown target.
fn grace_expiry() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(timer::GRACE.as_secs() as i64)
}

impl AppState {
    /// Host-only: leave the lobby and begin round 1.
    ///
    /// A non-host caller is a silent no-op toward the room.
    pub async fn start_game(self: &Arc<Self>, client_id: &str, code: &str) -> Result<(), RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| RoomError::NotFound(code.to_string()))?;

        if !room.is_host(client_id) {
            tracing::debug!(%code, %client_id, "ignoring start from non-host");
            return Ok(());
        }
        if room.started {
            return Err(RoomError::AlreadyStarted);
        }
        if room.players.len() < 2 || !room.settings_confirmed {
            return Err(RoomError::CannotStart);
        }

        room.started = true;
        room.current_round = 1;
        room.projects = room.players.iter().map(|_| Artifact::blank()).collect();
        room.owners = room.player_names();
        room.uploaded = vec![false; room.players.len()];
        room.agreements.clear();
        self.start_round_timer(room);
        tracing::info!(%code, players = room.players.len(), "game started");

        self.broadcast_room(
            room,
            ServerMessage::GameStarted {
                state: (&*room).into(),
            },
        )
        .await;
        Ok(())
    }

    /// Store a player's save for the current round.
    pub async fn upload_file(
        &self,
        client_id: &str,
        code: &str,
        filename: String,
        data: String,
    ) -> Result<ServerMessage, RoomError> {
        let buffer = BASE64
            .decode(data.as_bytes())
            .map_err(|e| RoomError::InvalidArtifactData(e.to_string()))?;

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| RoomError::NotFound(code.to_string()))?;

        if !room.started || room.ended || !room.round_active {
            return Err(RoomError::RoundNotActive);
        }
        let idx = room
            .player_index(client_id)
            .ok_or(RoomError::PlayerNotFound)?;
        if room.agreements.contains(client_id) {
            // Agreement locks further saves for the round.
            return Err(RoomError::AlreadyAgreed);
        }

        room.projects[idx] = Artifact {
            buffer,
            filename: filename.clone(),
        };
        room.uploaded[idx] = true;
        let player = room.players[idx].name.clone();
        tracing::debug!(%code, %player, %filename, "project uploaded");

        self.broadcast_room(
            room,
            ServerMessage::UploadNotice {
                player,
                filename: filename.clone(),
            },
        )
        .await;
        self.broadcast_room(
            room,
            ServerMessage::GameState {
                state: (&*room).into(),
            },
        )
        .await;

        Ok(ServerMessage::UploadAck { filename })
    }

    /// Signal readiness to advance. When everyone has agreed the deadline
    /// timer is cancelled and the grace window begins immediately.
    pub async fn agree_next(self: &Arc<Self>, client_id: &str, code: &str) -> Result<(), RoomError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| RoomError::NotFound(code.to_string()))?;

        if !room.started || room.ended || !room.round_active {
            return Err(RoomError::RoundNotActive);
        }
        let idx = room
            .player_index(client_id)
            .ok_or(RoomError::PlayerNotFound)?;
        if room.agreements.contains(client_id) {
            return Err(RoomError::AlreadyAgreed);
        }
        if !room.uploaded[idx] {
            return Err(RoomError::MustUploadFirst);
        }

        room.agreements.insert(client_id.to_string());
        self.broadcast_agreements(room).await;

        if room.agreements.len() == room.players.len() && room.round_phase == RoundPhase::Running {
            self.begin_round_ending(room).await;
        }
        Ok(())
    }

    /// Entry point for the round deadline firing.
    ///
    /// Returns false if the fire is stale (room gone, round already rotated,
    /// or the grace window already entered some other way), in which case
    /// the caller must not chain into the grace expiry.
    pub async fn round_deadline(&self, code: &str, round: u32) -> bool {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get_mut(code) {
            Some(room) => room,
            None => return false,
        };
        if !room.started
            || room.ended
            || room.current_round != round
            || room.round_phase != RoundPhase::Running
        {
            return false;
        }

        tracing::info!(%code, round, "round deadline fired");
        room.round_phase = RoundPhase::Ending;
        room.round_deadline = Some(grace_expiry());

        self.broadcast_room(room, ServerMessage::RoundTimeout).await;
        let laggards: Vec<ClientId> = room
            .players
            .iter()
            .enumerate()
            .filter(|(i, _)| !room.uploaded[*i])
            .map(|(_, p)| p.id.clone())
            .collect();
        for id in laggards {
            self.send_to(&id, ServerMessage::SaveNow).await;
        }
        self.broadcast_room(
            room,
            ServerMessage::RoundEnding {
                grace_seconds: timer::GRACE.as_secs(),
            },
        )
        .await;
        true
    }

    /// Entry point for the grace window expiring: close the round and rotate.
    ///
    /// Every slot still missing a save (or holding an empty buffer) is
    /// force-filled with the blank project.
    pub async fn finalize_round(self: &Arc<Self>, code: &str, round: u32) {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get_mut(code) {
            Some(room) => room,
            None => return,
        };
        if !room.started
            || room.ended
            || room.current_round != round
            || room.round_phase != RoundPhase::Ending
        {
            return;
        }

        room.round_active = false;

        // Force-filling only belongs to the timeout path; a unanimous round
        // keeps every save exactly as uploaded, empty buffers included.
        let everyone_had_agreed = room.agreements.len() == room.players.len();
        if !everyone_had_agreed {
            for i in 0..room.players.len() {
                if !room.uploaded[i] || room.projects[i].buffer.is_empty() {
                    room.projects[i] = Artifact::blank();
                    room.uploaded[i] = true;
                }
            }
            room.agreements = room.players.iter().map(|p| p.id.clone()).collect();
            self.broadcast_agreements(room).await;
        }

        self.advance_round(room).await;
    }

    /// Rotate every artifact (and its provenance label) to the next player,
    /// then either start the next round or end the game.
    async fn advance_round(self: &Arc<Self>, room: &mut Room) {
        // This is only ever reached from the room's own timer task, so the
        // handle is dropped rather than aborted.
        room.detach_timer();

        if let Some(last) = room.projects.pop() {
            room.projects.insert(0, last);
        }
        if let Some(last) = room.owners.pop() {
            room.owners.insert(0, last);
        }
        room.uploaded.iter_mut().for_each(|u| *u = false);
        room.agreements.clear();
        room.current_round += 1;

        if room.current_round > room.max_rounds() {
            self.end_room(room).await;
        } else {
            tracing::info!(code = %room.code, round = room.current_round, "round rotated");
            self.start_round_timer(room);
            self.broadcast_room(
                room,
                ServerMessage::GameState {
                    state: (&*room).into(),
                },
            )
            .await;
        }
    }

    /// Begin the grace window: cancel the deadline timer, announce the
    /// ending, and schedule rotation at grace expiry.
    pub(crate) async fn begin_round_ending(self: &Arc<Self>, room: &mut Room) {
        room.round_phase = RoundPhase::Ending;
        // Client countdowns now track the grace window, not the cancelled
        // deadline.
        room.round_deadline = Some(grace_expiry());
        self.broadcast_room(
            room,
            ServerMessage::RoundEnding {
                grace_seconds: timer::GRACE.as_secs(),
            },
        )
        .await;
        let handle = timer::spawn_grace(self.clone(), room.code.clone(), room.current_round);
        room.arm_timer(handle);
    }

    /// Mark the room ended, announce the final snapshot, and schedule
    /// deletion after the retention window.
    pub(crate) async fn end_room(self: &Arc<Self>, room: &mut Room) {
        room.ended = true;
        room.round_active = false;
        room.round_deadline = None;
        room.cancel_timer();
        tracing::info!(code = %room.code, rounds = room.current_round - 1, "game ended");

        self.broadcast_room(
            room,
            ServerMessage::GameEnded {
                projects: ProjectSummary::from_room(room),
            },
        )
        .await;
        timer::spawn_room_cleanup(self.clone(), room.code.clone());
    }

    /// Open a round and arm its deadline timer.
    pub(crate) fn start_round_timer(self: &Arc<Self>, room: &mut Room) {
        let deadline = Duration::from_millis(room.settings.timer_millis);
        room.round_active = true;
        room.round_phase = RoundPhase::Running;
        room.round_deadline =
            Some(Utc::now() + chrono::Duration::milliseconds(room.settings.timer_millis as i64));
        let handle = timer::spawn_round_deadline(
            self.clone(),
            room.code.clone(),
            room.current_round,
            deadline,
        );
        room.arm_timer(handle);
    }

    async fn broadcast_agreements(&self, room: &Room) {
        let agreed = room
            .players
            .iter()
            .filter(|p| room.agreements.contains(&p.id))
            .map(|p| p.name.clone())
            .collect();
        self.broadcast_room(
            room,
            ServerMessage::Agreements {
                agreed,
                total: room.players.len(),
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SettingsInput;
    use base64::Engine as _;

    fn settings(cycles: u32, minutes: u64) -> SettingsInput {
        SettingsInput {
            cycles: Some(cycles),
            timer_minutes: Some(minutes),
            max_players: Some(4),
        }
    }

    /// Create a started room with the given players (client ids c0, c1, ...).
    async fn started_room(state: &Arc<AppState>, names: &[&str], cycles: u32) -> RoomCode {
        let snap = state.create_room("c0", names[0].to_string()).await;
        for (i, name) in names.iter().enumerate().skip(1) {
            state
                .join_room(&format!("c{}", i), &snap.code, name.to_string())
                .await
                .unwrap();
        }
        state
            .set_settings("c0", &snap.code, settings(cycles, 1))
            .await
            .unwrap();
        state.start_game("c0", &snap.code).await.unwrap();
        snap.code
    }

    async fn upload(state: &Arc<AppState>, client: &str, code: &str, filename: &str) {
        state
            .upload_file(
                client,
                code,
                filename.to_string(),
                BASE64.encode(filename.as_bytes()),
            )
            .await
            .unwrap();
    }

    async fn assert_aligned(state: &Arc<AppState>, code: &str) {
        let rooms = state.rooms.read().await;
        let room = rooms.get(code).unwrap();
        assert_eq!(room.players.len(), room.projects.len());
        assert_eq!(room.players.len(), room.owners.len());
        assert_eq!(room.players.len(), room.uploaded.len());
    }

    #[tokio::test]
    async fn test_start_requires_players_and_settings() {
        let state = Arc::new(AppState::new());
        let snap = state.create_room("c0", "Alice".to_string()).await;

        // One player, nothing confirmed
        let err = state.start_game("c0", &snap.code).await.unwrap_err();
        assert!(matches!(err, RoomError::CannotStart));

        state
            .join_room("c1", &snap.code, "Bob".to_string())
            .await
            .unwrap();
        let err = state.start_game("c0", &snap.code).await.unwrap_err();
        assert!(matches!(err, RoomError::CannotStart));

        state
            .set_settings("c0", &snap.code, settings(1, 1))
            .await
            .unwrap();
        state.start_game("c0", &snap.code).await.unwrap();

        let rooms = state.rooms.read().await;
        let room = rooms.get(&snap.code).unwrap();
        assert!(room.started);
        assert_eq!(room.current_round, 1);
        assert!(room.round_active);
        assert_eq!(room.owners, vec!["Alice", "Bob"]);
        assert!(room.uploaded.iter().all(|u| !u));
        assert!(room.timer.is_some());
    }

    #[tokio::test]
    async fn test_start_from_non_host_is_a_no_op() {
        let state = Arc::new(AppState::new());
        let snap = state.create_room("c0", "Alice".to_string()).await;
        state
            .join_room("c1", &snap.code, "Bob".to_string())
            .await
            .unwrap();
        state
            .set_settings("c0", &snap.code, settings(1, 1))
            .await
            .unwrap();

        state.start_game("c1", &snap.code).await.unwrap();
        assert!(!state.rooms.read().await.get(&snap.code).unwrap().started);
    }

    #[tokio::test]
    async fn test_upload_gates() {
        let state = Arc::new(AppState::new());
        let snap = state.create_room("c0", "Alice".to_string()).await;
        state
            .join_room("c1", &snap.code, "Bob".to_string())
            .await
            .unwrap();

        // Before start
        let err = state
            .upload_file("c0", &snap.code, "a.proj".into(), BASE64.encode(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoundNotActive));

        state
            .set_settings("c0", &snap.code, settings(1, 1))
            .await
            .unwrap();
        state.start_game("c0", &snap.code).await.unwrap();

        // Stranger
        let err = state
            .upload_file("cx", &snap.code, "a.proj".into(), BASE64.encode(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::PlayerNotFound));

        // Malformed payload
        let err = state
            .upload_file("c0", &snap.code, "a.proj".into(), "%%%not-base64%%%".into())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidArtifactData(_)));

        // Good upload
        let ack = state
            .upload_file("c0", &snap.code, "a.proj".into(), BASE64.encode(b"x"))
            .await
            .unwrap();
        assert!(matches!(ack, ServerMessage::UploadAck { .. }));
        {
            let rooms = state.rooms.read().await;
            let room = rooms.get(&snap.code).unwrap();
            assert!(room.uploaded[0]);
            assert_eq!(room.projects[0].filename, "a.proj");
            assert_eq!(room.projects[0].buffer, b"x");
        }

        // Agreement locks further saves
        state.agree_next("c0", &snap.code).await.unwrap();
        let err = state
            .upload_file("c0", &snap.code, "b.proj".into(), BASE64.encode(b"y"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AlreadyAgreed));
    }

    #[tokio::test]
    async fn test_agree_requires_upload_first() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 1).await;

        let err = state.agree_next("c0", &code).await.unwrap_err();
        assert!(matches!(err, RoomError::MustUploadFirst));

        upload(&state, "c0", &code, "a.proj").await;
        state.agree_next("c0", &code).await.unwrap();

        let err = state.agree_next("c0", &code).await.unwrap_err();
        assert!(matches!(err, RoomError::AlreadyAgreed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_agreed_rotates_after_grace() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 2).await;

        let initial_deadline = {
            let rooms = state.rooms.read().await;
            rooms.get(&code).unwrap().round_deadline.unwrap()
        };

        upload(&state, "c0", &code, "alice.proj").await;
        upload(&state, "c1", &code, "bob.proj").await;
        state.agree_next("c0", &code).await.unwrap();
        state.agree_next("c1", &code).await.unwrap();

        {
            let rooms = state.rooms.read().await;
            let room = rooms.get(&code).unwrap();
            assert_eq!(room.round_phase, RoundPhase::Ending);
            assert_eq!(room.current_round, 1);
            // The countdown was pulled in to the grace expiry.
            let deadline = room.round_deadline.unwrap();
            assert!(deadline < initial_deadline);
            assert!((deadline - Utc::now()).num_seconds() <= timer::GRACE.as_secs() as i64);
        }

        // Grace window expires well before the 1-minute deadline would have.
        tokio::time::sleep(timer::GRACE + Duration::from_secs(1)).await;

        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        assert_eq!(room.current_round, 2);
        assert!(room.round_active);
        assert_eq!(room.round_phase, RoundPhase::Running);
        assert!(room.agreements.is_empty());
        assert!(room.uploaded.iter().all(|u| !u));
        // Bob now holds Alice's file and vice versa.
        assert_eq!(room.projects[0].filename, "bob.proj");
        assert_eq!(room.projects[1].filename, "alice.proj");
        assert_eq!(room.owners, vec!["Bob", "Alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agreed_empty_save_is_kept() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 1).await;

        upload(&state, "c0", &code, "alice.proj").await;
        state
            .upload_file("c1", &code, "empty.proj".into(), BASE64.encode(b""))
            .await
            .unwrap();
        state.agree_next("c0", &code).await.unwrap();
        state.agree_next("c1", &code).await.unwrap();

        tokio::time::sleep(timer::GRACE + Duration::from_secs(1)).await;

        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        assert_eq!(room.current_round, 2);
        // Bob's deliberately empty save rotated through untouched.
        assert_eq!(room.projects[0].filename, "empty.proj");
        assert!(room.projects[0].buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_is_cyclic_permutation() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob", "Carol"], 2).await;

        let files = ["alice.proj", "bob.proj", "carol.proj"];
        for round in 0..3 {
            for (i, file) in files.iter().enumerate() {
                // Re-upload each round so every slot keeps its filename.
                let rooms = state.rooms.read().await;
                let current = rooms.get(&code).unwrap().projects[i].filename.clone();
                drop(rooms);
                let keep = if round == 0 { file.to_string() } else { current };
                upload(&state, &format!("c{}", i), &code, &keep).await;
            }
            for i in 0..3 {
                state.agree_next(&format!("c{}", i), &code).await.unwrap();
            }
            tokio::time::sleep(timer::GRACE + Duration::from_secs(1)).await;
            assert_aligned(&state, &code).await;
        }

        // Three rotations in a three-player room are the identity.
        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        assert_eq!(room.current_round, 4);
        let filenames: Vec<_> = room.projects.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(filenames, files);
        assert_eq!(room.owners, vec!["Alice", "Bob", "Carol"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_force_fills_missing_saves() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 1).await;

        upload(&state, "c0", &code, "alice.proj").await;
        // Bob never saves; the 1-minute deadline plus grace passes.
        tokio::time::sleep(Duration::from_secs(61) + timer::GRACE).await;

        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        // Rotation happened without any explicit agreement.
        assert_eq!(room.current_round, 2);
        assert!(room.round_active);
        // Alice now holds the blank that was forced into Bob's slot.
        assert_eq!(room.projects[0].filename, BLANK_PROJECT.filename);
        assert_eq!(room.projects[1].filename, "alice.proj");
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_bound_ends_the_game() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 1).await;

        for _ in 0..2 {
            upload(&state, "c0", &code, "a.proj").await;
            upload(&state, "c1", &code, "b.proj").await;
            state.agree_next("c0", &code).await.unwrap();
            state.agree_next("c1", &code).await.unwrap();
            tokio::time::sleep(timer::GRACE + Duration::from_secs(1)).await;
        }

        {
            let rooms = state.rooms.read().await;
            let room = rooms.get(&code).unwrap();
            // max rounds = cycles * players = 2; round 3 would exceed it.
            assert!(room.ended);
            assert!(!room.round_active);
            assert!(room.timer.is_none());
            assert_eq!(room.owners, vec!["Alice", "Bob"]);
        }

        // Ended rooms linger for the retention window, then disappear.
        tokio::time::sleep(timer::ROOM_LINGER + Duration::from_secs(1)).await;
        assert!(state.rooms.read().await.get(&code).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_upload_during_grace_is_accepted() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 1).await;

        upload(&state, "c0", &code, "alice.proj").await;
        // Deadline fires, grace begins.
        tokio::time::sleep(Duration::from_secs(61)).await;
        {
            let rooms = state.rooms.read().await;
            let room = rooms.get(&code).unwrap();
            assert_eq!(room.round_phase, RoundPhase::Ending);
            assert!(room.round_active);
        }

        // Bob answers the save-now nudge inside the grace window.
        upload(&state, "c1", &code, "bob.proj").await;
        tokio::time::sleep(timer::GRACE).await;

        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        assert_eq!(room.current_round, 2);
        // Bob's late save survived rotation instead of a blank.
        assert_eq!(room.projects[0].filename, "bob.proj");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_round_compacts_and_continues() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob", "Carol"], 1).await;

        upload(&state, "c0", &code, "alice.proj").await;
        state.disconnect("c1").await;

        assert_aligned(&state, &code).await;
        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        assert_eq!(room.player_names(), vec!["Alice", "Carol"]);
        assert_eq!(room.owners, vec!["Alice", "Carol"]);
        assert!(!room.ended);
        // Round stays live with a fresh deadline.
        assert!(room.round_active);
        assert!(room.timer.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_completing_unanimity_ends_round() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob", "Carol"], 1).await;

        upload(&state, "c0", &code, "alice.proj").await;
        upload(&state, "c2", &code, "carol.proj").await;
        state.agree_next("c0", &code).await.unwrap();
        state.agree_next("c2", &code).await.unwrap();

        // Bob leaves without agreeing — the remaining set is unanimous.
        state.disconnect("c1").await;
        {
            let rooms = state.rooms.read().await;
            assert_eq!(rooms.get(&code).unwrap().round_phase, RoundPhase::Ending);
        }

        tokio::time::sleep(timer::GRACE + Duration::from_secs(1)).await;
        let rooms = state.rooms.read().await;
        let room = rooms.get(&code).unwrap();
        assert_eq!(room.current_round, 2);
        assert_eq!(room.owners, vec!["Carol", "Alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sole_player_disconnect_deletes_room_and_timer_goes_quiet() {
        let state = Arc::new(AppState::new());
        let code = started_room(&state, &["Alice", "Bob"], 1).await;

        state.disconnect("c1").await;
        state.disconnect("c0").await;
        assert!(state.rooms.read().await.get(&code).is_none());

        // Nothing fires for the deleted room after its old deadline passes.
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert!(state.rooms.read().await.is_empty());
    }
}
