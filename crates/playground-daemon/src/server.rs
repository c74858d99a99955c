use std::path::PathBuf;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use playground_core::Progress;
use playground_process::{ShutdownSignal, runtime_files};
use playground_proto::{
    COMMAND_PATH, CommandReply, MAX_COMMAND_BODY_BYTES, METHOD_NOT_ALLOWED, PING_PATH, PONG,
    decode_command,
};
use tracing::Instrument;

use crate::controller::ControllerHandle;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
struct AppState {
    controller: ControllerHandle,
}

fn reply(code: StatusCode, body: CommandReply) -> Response {
    (code, Json(body)).into_response()
}

pub fn router(controller: ControllerHandle) -> Router {
    Router::new()
        .route(PING_PATH, get(ping))
        .route(COMMAND_PATH, any(command))
        .layer(middleware::from_fn(request_id))
        .with_state(AppState { controller })
}

async fn request_id(req: Request<Body>, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

async fn ping() -> Json<CommandReply> {
    Json(CommandReply::ok(PONG))
}

async fn command(State(state): State<AppState>, method: Method, body: Body) -> Response {
    if method != Method::POST {
        return reply(
            StatusCode::METHOD_NOT_ALLOWED,
            CommandReply::error(METHOD_NOT_ALLOWED),
        );
    }
    let bytes = match axum::body::to_bytes(body, MAX_COMMAND_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return reply(
                StatusCode::BAD_REQUEST,
                CommandReply::error(format!("read request body: {e}")),
            );
        }
    };
    let cmd = match decode_command(&bytes) {
        Ok(cmd) => cmd,
        Err(e) => return reply(StatusCode::BAD_REQUEST, CommandReply::error(e)),
    };
    tracing::info!(command = cmd.kind.as_str(), "command received");
    let answer = state.controller.submit(cmd).await;
    if let Some(err) = answer.error.as_deref() {
        tracing::warn!(error = err, "command rejected");
    }
    reply(StatusCode::OK, answer)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    /// 0 picks a free port.
    pub port: u16,
}

/// Serves the command protocol on loopback until `shutdown` fires or the
/// controller stops.
///
/// The port record is written only after every progress line emitted so far
/// has been flushed, and removed again once serving ends.
pub async fn listen_and_serve(
    config: &ServerConfig,
    controller: ControllerHandle,
    progress: &Progress,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port))
        .await
        .with_context(|| format!("bind command server on 127.0.0.1:{}", config.port))?;
    let port = listener
        .local_addr()
        .context("command server local address")?
        .port();

    progress.print_lines([format!("Command server listening on 127.0.0.1:{port}")]);
    progress.sync().await;
    runtime_files::write_port_record(&config.data_dir, port)?;
    tracing::info!(port, "command server ready");

    let stopped = controller.clone();
    let served = axum::serve(listener, router(controller))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.wait() => {}
                _ = stopped.stopped() => {}
            }
        })
        .await;

    if let Err(err) = runtime_files::remove_port_record(&config.data_dir) {
        tracing::warn!(error = %err, "remove port record");
    }
    served.context("serve command server")
}
