//! Live analysis over a WebSocket.
//!
//! The browser streams camera frames (JSON data URLs or raw binary) and
//! gets one JSON event back per frame. Per-frame failures are reported
//! as error events so one bad frame never tears the connection down.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use moodcam_core::imaging;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routes::{self, AnalyzeResponse, AppState};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum ClientEvent {
    Image { data: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum ServerEvent {
    Response {
        #[serde(flatten)]
        body: AnalyzeResponse,
    },
    Error {
        error: String,
    },
}

pub(crate) async fn ws_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    upgrade: WebSocketUpgrade,
) -> Response {
    // Frames from a page load join its session; a bare client gets an
    // ephemeral one that nobody else can read.
    let session = routes::session_from_jar(&jar).unwrap_or_else(Uuid::new_v4);
    upgrade.on_upgrade(move |socket| handle_socket(socket, state, session))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, session: Uuid) {
    tracing::debug!(session = %session, "websocket connected");

    while let Some(Ok(msg)) = socket.recv().await {
        let event = match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::Image { data }) => match imaging::from_data_url(&data) {
                    Ok(bytes) => analyze_frame(&state, session, bytes).await,
                    Err(e) => ServerEvent::Error {
                        error: e.to_string(),
                    },
                },
                Err(e) => ServerEvent::Error {
                    error: format!("unrecognized message: {e}"),
                },
            },
            Message::Binary(bytes) => analyze_frame(&state, session, bytes.to_vec()).await,
            Message::Close(_) => break,
            // Ping and pong are answered by the protocol layer.
            _ => continue,
        };

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "could not serialize websocket event");
                break;
            }
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            break;
        }
    }

    tracing::debug!(session = %session, "websocket closed");
}

async fn analyze_frame(state: &AppState, session: Uuid, bytes: Vec<u8>) -> ServerEvent {
    match routes::run_analysis(state, session, bytes).await {
        Ok(body) => ServerEvent::Response { body },
        Err(e) => ServerEvent::Error {
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moodcam_core::types::EmotionCounts;

    #[test]
    fn test_client_event_parses_image_frame() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"image","data":"data:image/png;base64,AAAA"}"#)
                .unwrap();
        let ClientEvent::Image { data } = event;
        assert!(data.starts_with("data:image/png"));
    }

    #[test]
    fn test_client_event_rejects_unknown_event() {
        let parsed = serde_json::from_str::<ClientEvent>(r#"{"event":"reboot"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_response_event_flattens_analysis_fields() {
        let event = ServerEvent::Response {
            body: AnalyzeResponse {
                image: "data:image/jpeg;base64,AAAA".into(),
                message: "hello".into(),
                counts: EmotionCounts::new(),
                detections: Vec::new(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "response");
        assert_eq!(json["message"], "hello");
        assert!(json["image"].as_str().unwrap().starts_with("data:image/jpeg"));
        assert!(json["counts"].is_object());
        assert!(json["detections"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_error_event_shape() {
        let event = ServerEvent::Error {
            error: "bad frame".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["error"], "bad frame");
    }
}
