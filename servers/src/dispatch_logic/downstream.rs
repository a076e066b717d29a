use crate::dispatch_logic::config::ServerConfig;
use crate::dispatch_logic::model::ClientMessage;
use crate::dispatch_logic::routes::{self, AppError, Caller};
use crate::dispatch_logic::state::AppState;
use anyhow::Result;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::get,
};
use lib_dispatch::{ResponderSession, Role};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        Ok(layer.allow_origin(Any))
    } else {
        Ok(layer.allow_origin(origin.parse::<HeaderValue>()?))
    }
}

/// REST routes plus the responder WebSocket, with CORS applied.
pub fn app(app_state: AppState, cors_origin: &str) -> Result<Router> {
    Ok(routes::router()
        .route("/ws", get(ws_handler))
        .layer(cors_layer(cors_origin)?)
        .with_state(app_state))
}

pub async fn run(config: ServerConfig, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let app = app(app_state, &config.cors_origin)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Dispatch server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            info!("Dispatch server shutting down.");
        })
        .await?;
    Ok(())
}

/// The role claim is verified before anything else, so a non-responder gets a
/// plain 403 instead of a socket. The hub only registers the connection once
/// the handshake has completed; a failed upgrade leaves live sessions alone.
async fn ws_handler(
    caller: Caller,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, AppError> {
    let driver_id = caller.driver_id()?;
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws
        .on_failed_upgrade(move |e| warn!("WebSocket upgrade for {} failed: {}", driver_id, e))
        .on_upgrade(move |socket| async move {
            match state.hub.connect(driver_id, Role::Responder) {
                Ok(session) => handle_socket(socket, state, session).await,
                Err(e) => warn!("Could not register responder {}: {}", driver_id, e),
            }
        }))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, mut session: ResponderSession) {
    let driver_id = session.driver_id;
    let connection_id = session.connection_id;
    let mut shutdown = state.shutdown.subscribe();
    info!("Responder {} connected ({})", driver_id, connection_id);

    loop {
        tokio::select! {
            // Messages from the responder client
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::UpdateLocation { latitude, longitude }) => {
                                if let Err(e) = state.hub.update_location(driver_id, latitude, longitude) {
                                    warn!("Rejected location from {}: {}", driver_id, e);
                                }
                            }
                            Err(e) => debug!("Ignoring malformed message from {}: {}", driver_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Socket error for {}: {}", driver_id, e);
                        break;
                    }
                }
            }
            // Events pushed by the hub
            event = session.events.recv() => {
                let Some(event) = event else {
                    // superseded by a newer connection, or the hub stopped
                    info!("Responder {} connection {} superseded", driver_id, connection_id);
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json_str) => {
                        if socket.send(Message::Text(json_str.into())).await.is_err() {
                            break; // client disconnected
                        }
                    }
                    Err(e) => warn!("Failed to encode event for {}: {}", driver_id, e),
                }
            }
            _ = shutdown.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    if let Err(e) = state.hub.disconnect(driver_id, connection_id) {
        warn!("Could not deregister {}: {}", driver_id, e);
    }
    info!("Responder {} disconnected ({})", driver_id, connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use lib_dispatch::{
        DispatchPolicy, DriverId, MemoryStore, Notifier, ReportId, ReportKind, ReportSummary, ResponderEvent,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

    async fn serve() -> (SocketAddr, AppState) {
        let (shutdown, _) = broadcast::channel(1);
        let state = AppState::new(Arc::new(MemoryStore::new()), DispatchPolicy::default(), shutdown);
        let router = app(state.clone(), "*").unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (addr, state)
    }

    fn summary(id: i64) -> ReportSummary {
        ReportSummary {
            report_id: ReportId(id),
            kind: ReportKind::Sos,
            latitude: 12.9,
            longitude: 77.6,
            photo_url: Some("/uploads/scene.jpg".into()),
            description: None,
        }
    }

    fn upgrade_request(addr: SocketAddr, user_id: &str, role: &str) -> reqwest::RequestBuilder {
        reqwest::Client::new()
            .get(format!("http://{addr}/ws"))
            .header("x-user-id", user_id)
            .header("x-user-role", role)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
    }

    async fn wait_for_drivers(state: &AppState, expected: Vec<DriverId>) -> bool {
        for _ in 0..100 {
            if state.hub.connected_drivers().await.unwrap() == expected {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn public_caller_is_refused_and_live_session_survives() {
        let (addr, state) = serve().await;
        let mut live = state.hub.connect(DriverId(1), Role::Responder).unwrap();

        let response = upgrade_request(addr, "1", "Public").send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

        state.hub.notify(DriverId(1), summary(5));
        let event = timeout(Duration::from_secs(1), live.events.recv()).await.unwrap();
        assert_eq!(event, Some(ResponderEvent::NewReport(summary(5))));
        assert_eq!(state.hub.connected_drivers().await.unwrap(), vec![DriverId(1)]);
    }

    #[tokio::test]
    async fn request_that_never_upgrades_does_not_replace_the_session() {
        let (addr, state) = serve().await;
        let mut live = state.hub.connect(DriverId(1), Role::Responder).unwrap();

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/ws"))
            .header("x-user-id", "1")
            .header("x-user-role", "Responder")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_client_error(), "got {}", response.status());

        state.hub.notify(DriverId(1), summary(6));
        let event = timeout(Duration::from_secs(1), live.events.recv()).await.unwrap();
        assert_eq!(event, Some(ResponderEvent::NewReport(summary(6))));
        assert_eq!(state.hub.connected_drivers().await.unwrap(), vec![DriverId(1)]);
    }

    #[tokio::test]
    async fn responder_socket_registers_after_handshake_and_gets_pushes() {
        let (addr, state) = serve().await;
        let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
        request.headers_mut().insert("x-user-id", "2".parse().unwrap());
        request.headers_mut().insert("x-user-role", "Responder".parse().unwrap());

        let (mut socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(response.status().as_u16(), 101);
        assert!(wait_for_drivers(&state, vec![DriverId(2)]).await, "socket never registered");

        state.hub.notify(DriverId(2), summary(9));
        let frame = timeout(Duration::from_secs(1), socket.next()).await.unwrap().unwrap().unwrap();
        let tungstenite::Message::Text(text) = frame else {
            panic!("expected a text frame, got {frame:?}");
        };
        let json: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(json["type"], "newReport");
        assert_eq!(json["reportId"], 9);

        socket.close(None).await.unwrap();
        assert!(wait_for_drivers(&state, Vec::new()).await, "socket never deregistered");
    }
}
