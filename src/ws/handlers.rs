//! Dispatch layer: maps each inbound client action to exactly one state
//! machine transition. Broadcasts happen inside the state layer; the value
//! returned here goes only to the originating connection.

use std::sync::Arc;

use crate::error::RoomError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

pub async fn handle_message(
    msg: ClientMessage,
    client_id: &str,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::CreateRoom { name } => {
            let room = state.create_room(client_id, name).await;
            Some(ServerMessage::RoomCreated { room })
        }

        ClientMessage::JoinRoom { code, name } => {
            match state.join_room(client_id, &code, name).await {
                Ok(room) => Some(ServerMessage::RoomJoined { room }),
                Err(e) => Some(error_notice(e)),
            }
        }

        ClientMessage::SetSettings { code, settings } => {
            match state.set_settings(client_id, &code, settings).await {
                Ok(()) => None,
                Err(e) => Some(error_notice(e)),
            }
        }

        ClientMessage::StartGame { code } => match state.start_game(client_id, &code).await {
            Ok(()) => None,
            Err(e) => Some(error_notice(e)),
        },

        ClientMessage::UploadFile {
            code,
            filename,
            data,
        } => match state.upload_file(client_id, &code, filename, data).await {
            Ok(ack) => Some(ack),
            Err(e) => Some(error_notice(e)),
        },

        ClientMessage::AgreeNext { code } => match state.agree_next(client_id, &code).await {
            Ok(()) => None,
            Err(e) => Some(error_notice(e)),
        },
    }
}

fn error_notice(e: RoomError) -> ServerMessage {
    ServerMessage::Error {
        code: e.code().to_string(),
        msg: e.to_string(),
    }
}
