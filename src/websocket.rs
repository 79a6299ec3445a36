//! WebSocket server handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::circle::{NewCircle, PendingEdits};
use crate::service::{ApiResponse, CircleService};
use crate::AppState;

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
        };

        let reply = match serde_json::from_str::<ClientEnvelope>(&msg) {
            Ok(envelope) => {
                let response = dispatch(&state.service, envelope.message).await;
                ServerMessage::response(envelope.request_id, response)
            }
            Err(e) => {
                tracing::debug!("Rejected client message: {}", e);
                ServerMessage::response(None, ApiResponse::failure(format!("Invalid message: {}", e)))
            }
        };

        if !send(&mut sender, &reply).await {
            break;
        }
    }
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode reply: {}", e);
            return true;
        }
    };
    if let Err(e) = sender.send(Message::Text(text.into())).await {
        tracing::error!("Failed to send reply: {}", e);
        return false;
    }
    true
}

/// Run one request against the service
pub async fn dispatch(service: &CircleService, message: ClientMessage) -> ApiResponse<serde_json::Value> {
    match message {
        ClientMessage::CreateCircle {
            name,
            organizer_nickname,
            expires_at,
            device_id,
        } => service
            .create_circle(NewCircle {
                name,
                organizer_nickname,
                expires_at,
                organizer_device_id: device_id,
            })
            .await
            .into_json(),
        ClientMessage::JoinCircle {
            code,
            nickname,
            device_id,
        } => service
            .join_circle(&code, &nickname, &device_id)
            .await
            .into_json(),
        ClientMessage::LeaveCircle {
            circle_id,
            device_id,
        } => service
            .leave_circle(circle_id, &device_id)
            .await
            .into_json(),
        ClientMessage::RemoveMember {
            circle_id,
            member_id,
        } => service
            .remove_member_from_circle(circle_id, member_id)
            .await
            .into_json(),
        ClientMessage::GetCircle { circle_id } => service.get_circle(circle_id).await.into_json(),
        ClientMessage::GetMembers { circle_id } => {
            service.get_circle_members(circle_id).await.into_json()
        }
        ClientMessage::GetAssignments { circle_id } => {
            service.get_circle_assignments(circle_id).await.into_json()
        }
        ClientMessage::GetProgress { circle_id } => {
            service.get_circle_progress(circle_id).await.into_json()
        }
        ClientMessage::GetMyAssignments {
            circle_id,
            device_id,
        } => service
            .get_my_assignments(circle_id, &device_id)
            .await
            .into_json(),
        ClientMessage::AssignUnit {
            circle_id,
            unit_number,
            member_id,
        } => service
            .assign_juz_to_member(circle_id, unit_number, member_id)
            .await
            .into_json(),
        ClientMessage::AssignUnits {
            circle_id,
            unit_numbers,
            member_id,
        } => service
            .assign_multiple_juz(circle_id, &unit_numbers, member_id)
            .await
            .into_json(),
        ClientMessage::UnassignUnit {
            circle_id,
            unit_number,
        } => service
            .unassign_juz(circle_id, unit_number)
            .await
            .into_json(),
        ClientMessage::UnassignUnits {
            circle_id,
            unit_numbers,
        } => service
            .unassign_multiple_juz(circle_id, &unit_numbers)
            .await
            .into_json(),
        ClientMessage::ApplyEdits { circle_id, edits } => {
            let edits: PendingEdits = edits
                .into_iter()
                .map(|edit| (edit.unit_number, edit.member_id))
                .collect();
            service
                .apply_pending_edits(circle_id, &edits)
                .await
                .into_json()
        }
        ClientMessage::MarkInProgress {
            circle_id,
            unit_number,
            device_id,
        } => service
            .mark_juz_in_progress(circle_id, unit_number, &device_id)
            .await
            .into_json(),
        ClientMessage::MarkCompleted {
            circle_id,
            unit_number,
            device_id,
        } => service
            .mark_juz_completed(circle_id, unit_number, &device_id)
            .await
            .into_json(),
        ClientMessage::CheckUserCircle { device_id } => {
            service.check_user_circle(&device_id).await.into_json()
        }
        ClientMessage::ValidateCode { code } => {
            service.validate_circle_code(&code).await.into_json()
        }
        ClientMessage::GenerateCode => service.generate_circle_code().await.into_json(),
        ClientMessage::CheckExpiration { expires_at } => {
            service.check_circle_expiration(expires_at).into_json()
        }
        ClientMessage::CleanupExpired => service.cleanup_expired_circles().await.into_json(),
        ClientMessage::DeleteCircle { circle_id } => {
            service.delete_circle(circle_id).await.into_json()
        }
    }
}

/// A request plus the id its response will echo
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Messages from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateCircle {
        name: String,
        organizer_nickname: String,
        expires_at: DateTime<Utc>,
        device_id: String,
    },
    JoinCircle {
        code: String,
        nickname: String,
        device_id: String,
    },
    LeaveCircle {
        circle_id: Uuid,
        device_id: String,
    },
    RemoveMember {
        circle_id: Uuid,
        member_id: Uuid,
    },
    GetCircle {
        circle_id: Uuid,
    },
    GetMembers {
        circle_id: Uuid,
    },
    GetAssignments {
        circle_id: Uuid,
    },
    GetProgress {
        circle_id: Uuid,
    },
    GetMyAssignments {
        circle_id: Uuid,
        device_id: String,
    },
    AssignUnit {
        circle_id: Uuid,
        unit_number: u8,
        member_id: Uuid,
    },
    AssignUnits {
        circle_id: Uuid,
        unit_numbers: Vec<u8>,
        member_id: Uuid,
    },
    UnassignUnit {
        circle_id: Uuid,
        unit_number: u8,
    },
    UnassignUnits {
        circle_id: Uuid,
        unit_numbers: Vec<u8>,
    },
    ApplyEdits {
        circle_id: Uuid,
        edits: Vec<UnitEdit>,
    },
    MarkInProgress {
        circle_id: Uuid,
        unit_number: u8,
        device_id: String,
    },
    MarkCompleted {
        circle_id: Uuid,
        unit_number: u8,
        device_id: String,
    },
    CheckUserCircle {
        device_id: String,
    },
    ValidateCode {
        code: String,
    },
    GenerateCode,
    CheckExpiration {
        expires_at: DateTime<Utc>,
    },
    CleanupExpired,
    DeleteCircle {
        circle_id: Uuid,
    },
}

/// One pending change; a missing `member_id` frees the unit.
///
/// Later entries for the same unit replace earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEdit {
    pub unit_number: u8,
    #[serde(default)]
    pub member_id: Option<Uuid>,
}

/// Messages from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerMessage {
    pub fn response(request_id: Option<String>, response: ApiResponse<serde_json::Value>) -> Self {
        ServerMessage::Response {
            request_id,
            success: response.success,
            data: response.data,
            error: response.error,
        }
    }
}
