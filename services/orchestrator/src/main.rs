mod config;

use crate::config::Config;
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use interview_core::breaker::CircuitBreaker;
use interview_core::health::{
    HealthMonitorConfig, HealthSnapshot, HttpHealthProbe, ServiceHealthMonitor,
};
use interview_core::inference::HttpInferenceClient;
use interview_core::plan::{CandidateProfile, Difficulty, Persona};
use interview_core::planner::{AdaptiveQuestionPlanner, PlannerConfig};
use interview_core::registry::SessionRegistry;
use interview_core::report::{HttpReportStore, ReportCompiler};
use interview_core::session::{MonitoringEvent, SessionSettings};
use interview_core::turn::{JoinError, TurnConfig, TurnError, TurnProcessor};
use interview_core::ClientEvent;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::fmt::time::ChronoLocal;

/// Delay between plan exhaustion and report compilation, giving the last
/// background scorings time to land.
const REPORT_GRACE: Duration = Duration::from_secs(3);
/// How often the idle sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Messages the browser client sends over the WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    JoinInterview {
        user_key: String,
        #[serde(default)]
        profile: CandidateProfile,
        #[serde(default)]
        persona: Option<Persona>,
        #[serde(default)]
        difficulty: Option<Difficulty>,
        #[serde(default)]
        topic: Option<String>,
    },
    /// One recorded answer, base64-encoded audio.
    AudioResponse { audio: String },
    /// Proctoring event forwarded from the client (tab switch, face lost...).
    MonitoringEvent {
        kind: String,
        #[serde(default)]
        detail: String,
        #[serde(default)]
        timestamp_ms: u64,
    },
}

struct AppState {
    processor: TurnProcessor,
    registry: Arc<SessionRegistry>,
    health: Arc<HealthSnapshot>,
}

/// Handles WebSocket upgrade requests.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    tracing::info!("WebSocket upgrade request received");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Manages an individual WebSocket connection: a single loop multiplexing
/// inbound client messages with outbound session events, so no sender ever
/// needs exclusive ownership of the socket.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    tracing::info!("WebSocket connection established");
    let (event_tx, mut event_rx) = mpsc::channel::<ClientEvent>(64);
    // The user key this connection joined as, once known.
    let mut joined: Option<String> = None;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {e:?}");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) =
                            dispatch(&state, &event_tx, &mut joined, text.as_str()).await
                        {
                            let payload = match serde_json::to_string(&event) {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::error!("Failed to serialize event: {e:?}");
                                    continue;
                                }
                            };
                            if socket.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::info!("WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // The session outlives the connection; only the handle is dropped.
    if let Some(user_key) = joined {
        if let Some(session) = state.registry.get(&user_key).await {
            session.lock().await.detach();
        }
        tracing::info!(user = %user_key, "WebSocket connection closed, session detached");
    } else {
        tracing::info!("WebSocket connection closed");
    }
}

/// Routes one inbound message. Session events flow through `event_tx`; the
/// returned event, if any, is an immediate error reply for this message.
async fn dispatch(
    state: &AppState,
    event_tx: &mpsc::Sender<ClientEvent>,
    joined: &mut Option<String>,
    raw: &str,
) -> Option<ClientEvent> {
    let message: ClientMessage = match serde_json::from_str(raw) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("Unparseable client message: {e}");
            return Some(error_event("Unrecognized message", "BAD_MESSAGE"));
        }
    };

    match message {
        ClientMessage::JoinInterview {
            user_key,
            profile,
            persona,
            difficulty,
            topic,
        } => {
            let settings = SessionSettings {
                persona: persona.unwrap_or(Persona::FriendlyMentor),
                difficulty: difficulty.unwrap_or(Difficulty::Medium),
                topic: topic.unwrap_or_else(|| "General".to_string()),
                candidate_name: profile.display_name().to_string(),
                resume_text: profile.resume_text.clone().unwrap_or_default(),
            };
            match state
                .processor
                .join(&user_key, &profile, settings, event_tx.clone())
                .await
            {
                Ok(()) => {
                    *joined = Some(user_key);
                    None
                }
                Err(e @ JoinError::ServiceOffline) => {
                    Some(error_event(&e.to_string(), "AI_OFFLINE"))
                }
                Err(JoinError::Init(e)) => {
                    tracing::error!(user = %user_key, "Failed to start session: {e:?}");
                    Some(error_event("Failed to start the interview", "JOIN_FAILED"))
                }
            }
        }
        ClientMessage::AudioResponse { audio } => {
            let Some(user_key) = joined.as_deref() else {
                return Some(error_event("Join an interview first", "NOT_JOINED"));
            };
            let bytes = match BASE64.decode(audio.as_bytes()) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(user = user_key, "Undecodable audio payload: {e}");
                    return Some(error_event("Audio payload is not valid base64", "BAD_AUDIO"));
                }
            };
            match state.processor.process_audio(user_key, bytes).await {
                Ok(()) => None,
                Err(TurnError::SessionExpired) => {
                    Some(error_event("Session expired", "SESSION_EXPIRED"))
                }
            }
        }
        ClientMessage::MonitoringEvent {
            kind,
            detail,
            timestamp_ms,
        } => {
            let Some(user_key) = joined.as_deref() else {
                return Some(error_event("Join an interview first", "NOT_JOINED"));
            };
            let event = MonitoringEvent {
                kind,
                detail,
                timestamp_ms,
            };
            match state.processor.record_monitoring_event(user_key, event).await {
                Ok(()) => None,
                Err(TurnError::SessionExpired) => {
                    Some(error_event("Session expired", "SESSION_EXPIRED"))
                }
            }
        }
    }
}

fn error_event(message: &str, code: &str) -> ClientEvent {
    ClientEvent::Error {
        message: message.to_string(),
        code: code.to_string(),
    }
}

/// Liveness endpoint for the orchestrator itself, reporting what it knows
/// about its dependencies.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "ai_service_online": state.health.inference_online(),
        "model_runtime_online": state.health.model_runtime_online(),
        "active_sessions": state.registry.len().await,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load application configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("Configuration loaded successfully. Starting interview orchestrator...");

    let gateway = Arc::new(HttpInferenceClient::new(config.ai_service_url.clone()));
    let breaker = Arc::new(CircuitBreaker::default());
    let registry = Arc::new(SessionRegistry::new());

    let monitor = Arc::new(ServiceHealthMonitor::new(
        Arc::new(HttpHealthProbe::new(
            config.ai_service_url.clone(),
            config.model_runtime_url.clone(),
        )),
        HealthMonitorConfig {
            restart_command: config.ai_restart_command.clone(),
            ..HealthMonitorConfig::default()
        },
    ));
    if !monitor.wait_until_ready(5, Duration::from_secs(3)).await {
        tracing::warn!("Starting without the AI service; joins are refused until it recovers");
    }
    let health_snapshot = monitor.snapshot();
    monitor.spawn();

    let planner = Arc::new(AdaptiveQuestionPlanner::new(
        gateway.clone(),
        breaker.clone(),
        PlannerConfig::default(),
    ));
    let compiler = Arc::new(ReportCompiler::new(
        registry.clone(),
        gateway.clone(),
        breaker.clone(),
        Arc::new(HttpReportStore::new(config.report_store_url.clone())),
        REPORT_GRACE,
    ));
    let processor = TurnProcessor::new(
        registry.clone(),
        gateway,
        breaker,
        planner,
        compiler,
        health_snapshot.clone(),
        TurnConfig {
            short_answer_words: config.short_answer_words,
            probe_budget: config.probe_budget,
            plan_size: config.plan_size,
            ..TurnConfig::default()
        },
    );

    // Periodic reclamation of abandoned sessions.
    {
        let registry = registry.clone();
        let max_idle = config.session_idle_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(max_idle).await;
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "Idle sweep evicted sessions");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        processor,
        registry,
        health: health_snapshot,
    });

    // Permissive CORS so a separately-served frontend can connect.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state);

    tracing::info!("Listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
