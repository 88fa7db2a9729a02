use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use harvest_common::{Candidate, Entity, Job, JobCounters, JobPhase, Recommendation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error};

use super::api::AppState;
use crate::orchestrator::Modes;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    // Job lifecycle
    JobStarted {
        job: Job,
        resumed: bool,
    },
    JobProgress {
        job_id: i64,
        message: Option<String>,
        counters: JobCounters,
    },
    JobPhaseChanged {
        job_id: i64,
        from: JobPhase,
        to: JobPhase,
    },
    EntitiesHarvested {
        job_id: i64,
        accepted: usize,
    },

    // Loop progress for the current entity
    EntityClaimed {
        entity: Entity,
    },
    SearchStarted {
        entity_id: i64,
        request_id: String,
        query: String,
    },
    CandidatesReady {
        entity_id: i64,
        request_id: String,
        candidates: Vec<Candidate>,
        recommendation: Option<Recommendation>,
    },
    AddressAttached {
        entity: Entity,
        automatic: bool,
    },
    EntityFinished {
        entity: Entity,
        timed_out: bool,
    },
    EntitySkipped {
        entity: Entity,
    },

    // Operator-facing
    ModesChanged {
        modes: Modes,
    },
    RecoverableError {
        entity_id: Option<i64>,
        message: String,
        /// The operator can fall back to entering the address by hand.
        manual_entry: bool,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();
    debug!("event feed client connected");
    run_socket_loop(sender, receiver, rx).await;
    debug!("event feed client disconnected");
}

/// Forward broadcast events to one client, with ping/pong keepalive.
/// A client that misses a pong for [`PONG_TIMEOUT`] is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event feed client lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a WsMessage to all connected clients.
/// Returns silently even if no clients are connected.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            error!(error = %e, "failed to serialize event");
        }
    }
}
