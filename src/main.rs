//! wirelive server binary: Twilio voice webhook, media-stream WebSocket
//! endpoint, and the outbound-call trigger.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use wirelive::config::Config;
use wirelive::registry::SessionRegistry;
use wirelive::session;
use wirelive::telephony::{self, TwilioDialer};

struct AppState {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    dialer: TwilioDialer,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env()?);
    info!(
        mock_mode = config.mock_mode,
        max_calls = config.max_calls,
        "starting wirelive"
    );

    let registry = Arc::new(SessionRegistry::new(config.max_calls));
    let dialer = TwilioDialer::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_phone_number.clone(),
    );
    let state = Arc::new(AppState { config: config.clone(), registry, dialer });

    let app = Router::new()
        .route("/voice", post(voice_webhook))
        .route("/media-stream", get(media_stream_handler))
        .route("/call", post(trigger_call))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Answer the voice webhook with TwiML that connects the call to our
/// media stream socket.
async fn voice_webhook(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream_url = format!("wss://{}/media-stream", state.config.public_host);
    info!(%stream_url, "answering voice webhook");
    (
        [(header::CONTENT_TYPE, "application/xml")],
        telephony::connect_stream_twiml(&stream_url),
    )
}

async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_media_socket(socket, state))
}

/// Adapt the raw socket to the channel pair the session worker runs on:
/// a reader pump for inbound frames, a writer pump for outbound ones.
async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("media stream connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(256);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let worker = tokio::spawn(session::run_call(
        state.config.clone(),
        state.registry.clone(),
        inbound_rx,
        outbound_tx,
    ));

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if inbound_tx.send(text.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // Dropping the inbound sender signals stream close to the worker; the
    // worker dropping its outbound sender ends the writer.
    drop(inbound_tx);
    if let Err(e) = worker.await {
        error!(error = %e, "session worker panicked");
    }
    let _ = writer.await;
    info!("media stream disconnected");
}

#[derive(Deserialize)]
struct CallRequest {
    to: String,
}

/// Trigger an outbound call; once answered it lands in the same session
/// machinery as an inbound one.
async fn trigger_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CallRequest>,
) -> Response {
    if state.config.mock_mode {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "outbound calls unavailable in mock mode"})),
        )
            .into_response();
    }
    let webhook_url = format!("https://{}/voice", state.config.public_host);
    match state.dialer.start_call(&request.to, &webhook_url).await {
        Ok(sid) => Json(json!({"sid": sid})).into_response(),
        Err(e) => {
            error!(error = %e, "outbound call failed");
            (StatusCode::BAD_GATEWAY, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}
