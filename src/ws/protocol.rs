use axum::extract::ws::Message;
use tokio::sync::mpsc;

use crate::db::models;
use crate::state::AppState;
use crate::wire::{
    ClientFrame, ErrorPayload, FrameError, Message as ChatMessage, RegisterPayload, ServerFrame,
};
use crate::ws::broadcast::send_to_user;
use crate::ws::{register_connection, ConnectionSender};

/// Per-connection protocol state owned by the actor's reader loop.
#[derive(Debug)]
pub struct SessionState {
    /// User id from the validated upgrade token
    pub user_id: String,
    /// Set once a matching `register` frame has been accepted
    pub registered: bool,
}

impl SessionState {
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            registered: false,
        }
    }
}

/// Handle an incoming text frame.
/// Decodes and validates the frame, dispatches it, and answers errors in-band.
pub async fn handle_text_message(
    text: &str,
    tx: &ConnectionSender,
    state: &AppState,
    session: &mut SessionState,
) {
    let frame = match ClientFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                user_id = %session.user_id,
                error = %e,
                "Rejected client frame"
            );
            let message = match e {
                FrameError::Malformed(_) => "Malformed frame",
                FrameError::Invalid(reason) => reason,
            };
            send_error(tx, 400, message);
            return;
        }
    };

    match frame {
        ClientFrame::Register(payload) => handle_register(payload, tx, state, session),
        ClientFrame::SendMessage(message) => {
            if !session.registered {
                send_error(tx, 409, "Register before sending");
                return;
            }
            relay_message(message, tx, state, &session.user_id).await;
        }
    }
}

fn handle_register(
    payload: RegisterPayload,
    tx: &ConnectionSender,
    state: &AppState,
    session: &mut SessionState,
) {
    if payload.user_id != session.user_id {
        tracing::warn!(
            user_id = %session.user_id,
            claimed = %payload.user_id,
            "Register for a different user refused"
        );
        send_error(tx, 403, "Cannot register as another user");
        return;
    }

    if !session.registered {
        register_connection(&state.connections, &session.user_id, tx.clone());
        session.registered = true;
        tracing::info!(user_id = %session.user_id, "Push session registered");
    }

    send_frame(tx, &ServerFrame::Registered(payload));
}

/// Relay a `send-message` frame to its receiver.
///
/// The frame only names the message; the pushed payload is the stored row,
/// and it is relayed only when the stored sender is this session's user and
/// the stored receiver matches the frame.
async fn relay_message(
    claimed: ChatMessage,
    tx: &ConnectionSender,
    state: &AppState,
    user_id: &str,
) {
    let db = state.db.clone();
    let message_id = claimed.id.clone();

    let stored = tokio::task::spawn_blocking(move || {
        let conn = db.lock().ok()?;
        models::find_message(&conn, &message_id).ok().flatten()
    })
    .await
    .ok()
    .flatten();

    let Some(stored) = stored else {
        send_error(tx, 404, "Message not found");
        return;
    };

    if stored.sender.id != user_id || stored.receiver_id != claimed.receiver_id {
        tracing::warn!(
            user_id = %user_id,
            message_id = %stored.id,
            "Relay refused: message does not belong to this sender/receiver"
        );
        send_error(tx, 403, "Message does not belong to this conversation");
        return;
    }

    let receiver_id = stored.receiver_id.clone();
    let message_id = stored.id.clone();
    let delivered = send_to_user(&state.connections, &receiver_id, &ServerFrame::NewMessage(stored));
    tracing::debug!(
        user_id = %user_id,
        receiver_id = %receiver_id,
        message_id = %message_id,
        delivered,
        "Relayed message"
    );
}

/// Encode and send a frame to this connection.
pub fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    if let Ok(text) = frame.encode() {
        let _ = tx.send(Message::Text(text.into()));
    }
}

/// Send an `error` frame.
pub fn send_error(tx: &mpsc::UnboundedSender<Message>, code: u16, message: &str) {
    send_frame(
        tx,
        &ServerFrame::Error(ErrorPayload {
            code,
            message: message.to_string(),
        }),
    );
}
