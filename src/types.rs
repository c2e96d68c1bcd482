use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Opaque ID types for type safety
pub type RoomCode = String;
pub type ClientId = String;

/// An opaque project blob plus its filename — the unit handed between players.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub buffer: Vec<u8>,
    pub filename: String,
}

/// Fallback placeholder when no blank project file is configured.
const EMBEDDED_BLANK: &[u8] = include_bytes!("../assets/blank.project");

/// The blank placeholder project, loaded once at startup.
///
/// Reads `BLANK_PROJECT_PATH` if set, otherwise uses the embedded
/// placeholder bytes.
pub static BLANK_PROJECT: LazyLock<Artifact> = LazyLock::new(|| {
    let buffer = match std::env::var("BLANK_PROJECT_PATH") {
        Ok(path) => match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to read blank project {}: {}", path, e);
                EMBEDDED_BLANK.to_vec()
            }
        },
        Err(_) => EMBEDDED_BLANK.to_vec(),
    };
    Artifact {
        buffer,
        filename: "blank.project".to_string(),
    }
});

impl Artifact {
    /// A fresh copy of the blank placeholder project.
    pub fn blank() -> Self {
        BLANK_PROJECT.clone()
    }
}

/// Per-room game settings, set once by the host before start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Number of full rotations through the player list.
    pub cycles: u32,
    /// Round deadline duration in milliseconds.
    pub timer_millis: u64,
    /// Room capacity.
    pub max_players: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            cycles: 1,
            timer_millis: 300_000, // 5 minutes
            max_players: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Player {
    pub id: ClientId,
    pub name: String,
}

/// Sub-state of an active round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// The deadline timer is running and uploads are open.
    Running,
    /// The grace window has begun; rotation is guaranteed at its expiry.
    Ending,
}

/// One game session, keyed by a short unique code.
///
/// Index alignment invariant: once started, `players`, `projects`, `owners`
/// and `uploaded` always have the same length, with `projects[i]` held by
/// `players[i]` and `owners[i]` naming who originally started it.
pub struct Room {
    pub code: RoomCode,
    /// Explicit host identity; reassigned to the new `players[0]` when the
    /// host leaves.
    pub host_id: ClientId,
    pub players: Vec<Player>,
    pub settings: RoomSettings,
    pub settings_confirmed: bool,
    pub started: bool,
    pub ended: bool,
    /// 1-based round counter; bounded by `cycles * players.len()`.
    pub current_round: u32,
    pub projects: Vec<Artifact>,
    pub owners: Vec<String>,
    pub uploaded: Vec<bool>,
    pub agreements: HashSet<ClientId>,
    /// Gates uploads: true from round start until the grace window expires.
    pub round_active: bool,
    pub round_phase: RoundPhase,
    /// When the current round's deadline fires (for client countdowns).
    pub round_deadline: Option<DateTime<Utc>>,
    /// The single live timer task for this room. Replaced atomically via
    /// [`Room::arm_timer`].
    pub timer: Option<JoinHandle<()>>,
}

impl Room {
    pub fn new(code: RoomCode, founder: Player) -> Self {
        Self {
            code,
            host_id: founder.id.clone(),
            players: vec![founder],
            settings: RoomSettings::default(),
            settings_confirmed: false,
            started: false,
            ended: false,
            current_round: 0,
            projects: Vec::new(),
            owners: Vec::new(),
            uploaded: Vec::new(),
            agreements: HashSet::new(),
            round_active: false,
            round_phase: RoundPhase::Running,
            round_deadline: None,
            timer: None,
        }
    }

    pub fn is_host(&self, client_id: &str) -> bool {
        self.host_id == client_id
    }

    pub fn player_index(&self, client_id: &str) -> Option<usize> {
        self.players.iter().position(|p| p.id == client_id)
    }

    pub fn player_names(&self) -> Vec<String> {
        self.players.iter().map(|p| p.name.clone()).collect()
    }

    /// Total rounds in this game: one per player per cycle.
    pub fn max_rounds(&self) -> u32 {
        self.settings.cycles * self.players.len() as u32
    }

    /// Replace the room's timer with a new handle, cancelling the previous
    /// one. Replace-and-cancel is a single operation so no two timers for
    /// the same room can ever be live at once.
    pub fn arm_timer(&mut self, handle: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the live timer, if any.
    pub fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }

    /// Drop the timer handle without aborting it. Used when the running
    /// timer task itself drives the transition and must finish its work.
    pub fn detach_timer(&mut self) {
        self.timer.take();
    }
}
