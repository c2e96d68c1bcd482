//! Spawned timer tasks driving round deadlines, grace windows, and room
//! cleanup. The tasks only sleep and call back into named [`AppState`]
//! entry points, so every re-entry into room state is auditable.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::state::AppState;
use crate::types::RoomCode;

/// Grace window between a round's deadline and its rotation.
pub const GRACE: Duration = Duration::from_secs(5);

/// How long an ended room lingers before deletion.
pub const ROOM_LINGER: Duration = Duration::from_secs(30);

/// Schedule a round's deadline, chained into the grace expiry.
///
/// The handle covers the whole deadline-then-grace chain; aborting it
/// before the deadline fires cancels the round timer entirely. Once the
/// deadline has fired, rotation is guaranteed at grace expiry unless the
/// room itself goes away.
pub fn spawn_round_deadline(
    state: Arc<AppState>,
    code: RoomCode,
    round: u32,
    deadline: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if !state.round_deadline(&code, round).await {
            return;
        }
        tokio::time::sleep(GRACE).await;
        state.finalize_round(&code, round).await;
    })
}

/// Schedule just the grace expiry, for rounds ended early by unanimous
/// agreement.
pub fn spawn_grace(state: Arc<AppState>, code: RoomCode, round: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(GRACE).await;
        state.finalize_round(&code, round).await;
    })
}

/// Schedule deletion of an ended room after the retention window.
///
/// Deliberately detached: the room's own timer slot stays free so the
/// deletion cannot be displaced by a later timer, and deleting an
/// already-gone room is a no-op.
pub fn spawn_room_cleanup(state: Arc<AppState>, code: RoomCode) {
    tokio::spawn(async move {
        tokio::time::sleep(ROOM_LINGER).await;
        state.delete_ended_room(&code).await;
    });
}
