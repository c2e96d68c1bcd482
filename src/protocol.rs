use crate::types::{Room, RoomSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateRoom {
        name: String,
    },
    JoinRoom {
        code: String,
        name: String,
    },
    SetSettings {
        code: String,
        settings: SettingsInput,
    },
    StartGame {
        code: String,
    },
    UploadFile {
        code: String,
        filename: String,
        /// Base64-encoded project bytes.
        data: String,
    },
    AgreeNext {
        code: String,
    },
}

/// Raw settings as submitted by the host; missing fields fall back to the
/// defaults, `timer_minutes` is converted to milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsInput {
    pub cycles: Option<u32>,
    pub timer_minutes: Option<u64>,
    pub max_players: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent to the founder after room creation.
    RoomCreated {
        room: RoomSnapshot,
    },
    /// Sent to a joiner after a successful join.
    RoomJoined {
        room: RoomSnapshot,
    },
    PlayerList {
        players: Vec<String>,
    },
    SettingsUpdated {
        settings: RoomSettings,
        players: Vec<String>,
    },
    GameStarted {
        state: GameSnapshot,
    },
    GameState {
        state: GameSnapshot,
    },
    /// Someone saved this round.
    UploadNotice {
        player: String,
        filename: String,
    },
    /// Sent to the uploader after their save is stored.
    UploadAck {
        filename: String,
    },
    Agreements {
        agreed: Vec<String>,
        total: usize,
    },
    /// The round deadline fired.
    RoundTimeout,
    /// Targeted nudge to players who have not saved yet.
    SaveNow,
    /// The grace window has begun; rotation follows at its expiry.
    RoundEnding {
        grace_seconds: u64,
    },
    GameEnded {
        projects: Vec<ProjectSummary>,
    },
    Error {
        code: String,
        msg: String,
    },
}

/// Lobby-phase view of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub code: String,
    pub host: String,
    pub players: Vec<String>,
    pub settings: RoomSettings,
    pub settings_confirmed: bool,
    pub started: bool,
}

impl From<&Room> for RoomSnapshot {
    fn from(room: &Room) -> Self {
        let host = room
            .players
            .iter()
            .find(|p| p.id == room.host_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        Self {
            code: room.code.clone(),
            host,
            players: room.player_names(),
            settings: room.settings.clone(),
            settings_confirmed: room.settings_confirmed,
            started: room.started,
        }
    }
}

/// Full per-round view of a started room. Buffers never cross the wire;
/// clients fetch them through the download endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub code: String,
    pub current_round: u32,
    pub max_rounds: u32,
    pub round_active: bool,
    pub players: Vec<String>,
    /// Original-owner name for each slot, index-aligned with `players`.
    pub owners: Vec<String>,
    pub filenames: Vec<String>,
    pub uploaded: Vec<bool>,
    pub agreed: Vec<String>,
    pub server_now: String,
    pub deadline: Option<String>,
}

impl From<&Room> for GameSnapshot {
    fn from(room: &Room) -> Self {
        let agreed = room
            .players
            .iter()
            .filter(|p| room.agreements.contains(&p.id))
            .map(|p| p.name.clone())
            .collect();
        Self {
            code: room.code.clone(),
            current_round: room.current_round,
            max_rounds: room.max_rounds(),
            round_active: room.round_active,
            players: room.player_names(),
            owners: room.owners.clone(),
            filenames: room.projects.iter().map(|a| a.filename.clone()).collect(),
            uploaded: room.uploaded.clone(),
            agreed,
            server_now: chrono::Utc::now().to_rfc3339(),
            deadline: room.round_deadline.map(|d| d.to_rfc3339()),
        }
    }
}

/// End-of-game summary line: which file sits in each slot and whose piece
/// it originally was.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub filename: String,
    pub owner: String,
}

impl ProjectSummary {
    pub fn from_room(room: &Room) -> Vec<Self> {
        room.projects
            .iter()
            .zip(room.owners.iter())
            .map(|(artifact, owner)| Self {
                filename: artifact.filename.clone(),
                owner: owner.clone(),
            })
            .collect()
    }
}
