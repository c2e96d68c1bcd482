use crate::types::RoomCode;

/// Everything that can go wrong with a client action.
///
/// All of these are recovered locally: a failed action is surfaced only to
/// the originating connection and leaves room state unchanged.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room {0} not found")]
    NotFound(RoomCode),

    #[error("the name {0} is already taken in this room")]
    NameConflict(String),

    #[error("room {0} is full")]
    RoomFull(RoomCode),

    #[error("the game has already started")]
    AlreadyStarted,

    #[error("need at least two players and confirmed settings to start")]
    CannotStart,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("no round is currently accepting uploads")]
    RoundNotActive,

    #[error("you are not a player in this room")]
    PlayerNotFound,

    #[error("you already agreed to advance this round")]
    AlreadyAgreed,

    #[error("upload your project before agreeing to advance")]
    MustUploadFirst,

    #[error("could not decode project data: {0}")]
    InvalidArtifactData(String),
}

impl RoomError {
    /// Stable wire code carried in error notices.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::NotFound(_) => "ROOM_NOT_FOUND",
            RoomError::NameConflict(_) => "NAME_TAKEN",
            RoomError::RoomFull(_) => "ROOM_FULL",
            RoomError::AlreadyStarted => "ALREADY_STARTED",
            RoomError::CannotStart => "CANNOT_START",
            RoomError::InvalidSettings(_) => "INVALID_SETTINGS",
            RoomError::RoundNotActive => "ROUND_NOT_ACTIVE",
            RoomError::PlayerNotFound => "PLAYER_NOT_FOUND",
            RoomError::AlreadyAgreed => "ALREADY_AGREED",
            RoomError::MustUploadFirst => "MUST_UPLOAD_FIRST",
            RoomError::InvalidArtifactData(_) => "INVALID_PROJECT_DATA",
        }
    }
}
