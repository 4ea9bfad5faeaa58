use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use livekit_integration::{mint_token, LiveKitConfig};
use serde::{Deserialize, Serialize};
use shared::{
    auth::{verify_app_token, AppClaims},
    domain::{OnlineUser, RoomId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, MessagePayload},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod relay;

use config::load_settings;
use relay::Hub;

struct AppState {
    hub: Hub,
    app_token_secret: String,
    livekit: LiveKitConfig,
}

#[derive(Debug, Deserialize)]
struct MediaTokenRequest {
    room: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MediaTokenResponse {
    token: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    if let Some(url) = &settings.livekit_url {
        info!(%url, "relay: media server configured");
    }
    let state = AppState {
        hub: Hub::default(),
        app_token_secret: settings.app_token_secret,
        livekit: LiveKitConfig {
            api_key: settings.livekit_api_key,
            api_secret: settings.livekit_api_secret,
            ttl_seconds: settings.livekit_ttl_seconds,
        },
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "relay: listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .route("/api/livekit-token", post(livekit_token))
        .route("/api/rooms/:room_id/messages", get(room_history))
        .route("/api/online-users", get(online_users))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<AppClaims> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    verify_app_token(&state.app_token_secret, token).map_err(|err| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(ErrorCode::Unauthorized, err.to_string())),
        )
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let claims = match authenticate(&state, &headers) {
        Ok(claims) => claims,
        Err(rejection) => {
            warn!("relay: websocket upgrade refused");
            return rejection.into_response();
        }
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, claims))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, claims: AppClaims) {
    let user = OnlineUser {
        id: claims.user_id(),
        username: claims.name,
        image_url: claims.image_url,
    };
    let (peer_id, mut events_rx) = state.hub.register(user).await;
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let text = match event.to_frame() {
                Ok(text) => text,
                Err(err) => {
                    error!("relay: failed to encode event: {err}");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => match ClientRequest::from_frame(&text) {
                Ok(request) => state.hub.handle(peer_id, request).await,
                Err(err) => {
                    warn!(%peer_id, "relay: malformed frame: {err}");
                    state.hub.reject_frame(peer_id, "malformed frame").await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister(peer_id).await;
    send_task.abort();
}

async fn livekit_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MediaTokenRequest>,
) -> ApiResult<Json<MediaTokenResponse>> {
    let claims = authenticate(&state, &headers)?;
    let room_id = RoomId::new(req.room.trim());
    if room_id.is_blank() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "room is required")),
        ));
    }

    let token = mint_token(&state.livekit, &claims.user_id(), &claims.name, &room_id).map_err(
        |err| {
            error!("relay: media token minting failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, "could not mint media token")),
            )
        },
    )?;
    info!(room_id = %room_id, user_id = %claims.sub, "relay: media token issued");
    Ok(Json(MediaTokenResponse { token }))
}

async fn room_history(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<MessagePayload>>> {
    authenticate(&state, &headers)?;
    Ok(Json(state.hub.history(&RoomId::new(room_id)).await))
}

async fn online_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<OnlineUser>>> {
    authenticate(&state, &headers)?;
    Ok(Json(state.hub.online_users().await))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
