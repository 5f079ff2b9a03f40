//! HTTP and WebSocket surface.
//!
//! Owns the shared service state (token verifier, session controller and the
//! boundary services) and maps every route onto it. Terminal connections are
//! upgraded here and handed to the session controller; everything else is a
//! single call into a service.

use crate::auth::{Authorized, TokenVerifier};
use crate::config::ServerConfig;
use crate::files::FileService;
use crate::input::{MouseDispatcher, MouseSettings};
use crate::logging;
use crate::network;
use crate::qr::QrEncoder;
use crate::screen::{ScreenSettings, ScreenStreamer};
use crate::session::{
    ProcessSpawner, PtySpawner, SessionController, SessionRegistry, ShellCommand, TerminalSettings,
};
use crate::transport::websocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRef, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use mirror_core::messages::{
    ErrorBody, FileContent, FileListing, FileOpResult, HealthResponse, LogTail, MouseRequest,
    MouseResult, PathQuery, QrQuery, QrResponse, ReadRequest, ScreenStartRequest, ScreenStatus,
    SessionStatsResponse, WriteRequest,
};
use mirror_core::{MirrorError, MirrorResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Extra time, beyond the terminate grace, that shutdown waits for sessions.
const DRAIN_MARGIN: Duration = Duration::from_secs(3);

/// Error returned by API handlers, rendered as `{ "error", "code" }`.
#[derive(Debug)]
pub struct ApiError(pub MirrorError);

impl From<MirrorError> for ApiError {
    fn from(e: MirrorError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            MirrorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            MirrorError::NotFound(_) => StatusCode::NOT_FOUND,
            MirrorError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            MirrorError::Unauthorized => StatusCode::UNAUTHORIZED,
            MirrorError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            MirrorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MirrorError::Tool(_) | MirrorError::Io(_) | MirrorError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    verifier: Arc<TokenVerifier>,
    controller: SessionController,
    files: Arc<FileService>,
    mouse: Arc<MouseDispatcher>,
    screen: Arc<ScreenStreamer>,
    qr: Arc<QrEncoder>,
}

impl FromRef<AppState> for Arc<TokenVerifier> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.verifier)
    }
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_spawner(config, Arc::new(PtySpawner))
    }

    /// Build the state with a custom shell spawner.
    pub fn with_spawner(config: ServerConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let verifier = Arc::new(TokenVerifier::new(&config.tokens));

        let mut command = ShellCommand::resolve(config.shell.as_deref(), config.shell_args.clone());
        command.term = config.term.clone();
        command.cols = config.cols;
        command.rows = config.rows;
        let mut terminal = TerminalSettings::new(command);
        terminal.terminate_grace = config.terminate_grace;
        terminal.read_chunk = config.read_chunk;

        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        let controller = SessionController::new(registry, spawner, terminal);

        let mouse = MouseDispatcher::new(MouseSettings {
            tool: config.mouse_tool.clone(),
            display: config.display.clone(),
            max_per_second: config.mouse_max_per_second,
            max_per_minute: config.mouse_max_per_minute,
            ..MouseSettings::default()
        });
        let screen = ScreenStreamer::new(ScreenSettings {
            display: config.display.clone(),
            port: config.screen_port,
            quality: config.screen_quality,
            log_file: config.screen_log.clone(),
            ..ScreenSettings::default()
        });

        Self {
            files: Arc::new(FileService::new(config.max_read_bytes)),
            mouse: Arc::new(mouse),
            screen: Arc::new(screen),
            qr: Arc::new(QrEncoder::default()),
            config: Arc::new(config),
            verifier,
            controller,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.controller.registry()
    }

    pub fn screen(&self) -> &Arc<ScreenStreamer> {
        &self.screen
    }

    /// URL encoded into the QR code when the client does not supply one.
    async fn default_url(&self) -> String {
        if let Some(ref url) = self.config.qr_url {
            return url.clone();
        }
        let host = network::mesh_address().await;
        format!("{}://{}:{}", self.config.ui_scheme, host, self.config.ui_port)
    }

    /// Stop every terminal session and the screen streamer.
    pub async fn shutdown(&self) {
        let registry = self.registry();
        let asked = registry.shutdown_all();
        if asked > 0 {
            info!(sessions = asked, "stopping terminal sessions");
        }
        let drain = self.config.terminate_grace + DRAIN_MARGIN;
        if tokio::time::timeout(drain, registry.wait_until_empty()).await.is_err() {
            warn!(remaining = registry.len(), "terminal sessions still open at shutdown");
        }

        if let Err(e) = self.screen.stop().await {
            warn!(error = %e, "failed to stop screen stream");
        }
    }
}

/// All routes, with CORS and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/files", get(list_files).delete(delete_file))
        .route("/read", post(read_file))
        .route("/write", post(write_file))
        .route("/mouse", post(mouse))
        .route("/qr", get(qr))
        .route("/screen", get(screen_status))
        .route("/screen/start", post(screen_start))
        .route("/screen/stop", post(screen_stop))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(stop_session))
        .route("/log", get(recent_log))
        .route("/terminal", get(terminal))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the listener and serve until `shutdown` resolves, then stop all
/// sessions and the screen streamer.
pub async fn serve<F>(state: AppState, shutdown: F) -> MirrorResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::new(state.config.bind, state.config.port);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(
        listener,
        router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    state.shutdown().await;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "running".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        active_sessions: state.registry().len(),
        screen_active: state.screen.is_active().await,
    })
}

async fn list_files(
    _auth: Authorized,
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<FileListing> {
    Ok(Json(state.files.list_dir(&query.path).await?))
}

async fn delete_file(
    auth: Authorized,
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> ApiResult<FileOpResult> {
    info!(source = %auth.source, path = %query.path, "delete requested");
    Ok(Json(state.files.delete_path(&query.path).await?))
}

async fn read_file(
    _auth: Authorized,
    State(state): State<AppState>,
    Json(req): Json<ReadRequest>,
) -> ApiResult<FileContent> {
    Ok(Json(state.files.read_file(&req.path).await?))
}

async fn write_file(
    auth: Authorized,
    State(state): State<AppState>,
    Json(req): Json<WriteRequest>,
) -> ApiResult<FileOpResult> {
    info!(source = %auth.source, path = %req.path, bytes = req.content.len(), "write requested");
    Ok(Json(state.files.write_file(&req.path, &req.content).await?))
}

async fn mouse(
    auth: Authorized,
    State(state): State<AppState>,
    Json(req): Json<MouseRequest>,
) -> ApiResult<MouseResult> {
    Ok(Json(state.mouse.dispatch(&req, &auth.source).await?))
}

async fn qr(State(state): State<AppState>, Query(query): Query<QrQuery>) -> ApiResult<QrResponse> {
    let url = match query.url.filter(|u| !u.trim().is_empty()) {
        Some(url) => url,
        None => state.default_url().await,
    };
    Ok(Json(state.qr.generate(&url, query.size).await?))
}

async fn screen_status(_auth: Authorized, State(state): State<AppState>) -> Json<ScreenStatus> {
    Json(state.screen.status().await)
}

async fn screen_start(
    auth: Authorized,
    State(state): State<AppState>,
    body: Option<Json<ScreenStartRequest>>,
) -> ApiResult<ScreenStatus> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    info!(source = %auth.source, quality = ?req.quality, allow_remote = req.allow_remote, "screen start requested");
    Ok(Json(state.screen.start(&req).await?))
}

async fn screen_stop(auth: Authorized, State(state): State<AppState>) -> ApiResult<ScreenStatus> {
    info!(source = %auth.source, "screen stop requested");
    Ok(Json(state.screen.stop().await?))
}

async fn list_sessions(_auth: Authorized, State(state): State<AppState>) -> Json<SessionStatsResponse> {
    let sessions = state.registry().snapshot();
    Json(SessionStatsResponse {
        active_sessions: sessions.len(),
        sessions,
    })
}

async fn stop_session(
    auth: Authorized,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.registry().shutdown(&id) {
        info!(source = %auth.source, session_id = %id, "session shutdown requested");
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(MirrorError::NotFound(format!("session {id}")).into())
    }
}

async fn recent_log(_auth: Authorized, State(state): State<AppState>) -> ApiResult<LogTail> {
    let dir = state.config.log_dir.as_deref();
    Ok(Json(logging::tail(dir, logging::TAIL_LINES).await?))
}

async fn terminal(auth: Authorized, State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let controller = state.controller.clone();
    debug!(source = %auth.source, "terminal upgrade");
    ws.max_message_size(websocket::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = websocket::split(socket);
            if let Err(e) = controller.run(sink, stream).await {
                warn!(source = %auth.source, error = %e, "terminal session not started");
            }
        })
}
