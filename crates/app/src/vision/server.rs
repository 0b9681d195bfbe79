//! Actix Web server exposing the live preview and the operator controls.
//!
//! The server runs on a dedicated thread to keep the pipeline hot path free
//! from Actix runtime concerns. Control endpoints never touch pipeline state:
//! they queue a [`Command`] and wait for the controller's answer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::vision::{
    config::ServerOptions,
    control::{CommandError, ControlHandle},
    data::{Command, FramePacket, SharedFrame, SharedStatus, StatusSnapshot, StreamPacket},
    telemetry,
};

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) latest: SharedFrame,
    pub(crate) composite: SharedFrame,
    pub(crate) status: SharedStatus,
    pub(crate) control: ControlHandle,
    pub(crate) trackers: Vec<&'static str>,
    pub(crate) pending: Arc<AtomicUsize>,
}

#[derive(Default)]
/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Deserialize)]
struct ControlQuery {
    value: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct LegacyTrackerQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Serialize)]
struct ControlResponse {
    ok: bool,
    message: String,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    #[serde(flatten)]
    status: &'a StatusSnapshot,
    pending_publish: usize,
}

#[derive(Serialize)]
struct TrackersResponse<'a> {
    available: &'a [&'static str],
    active: Option<&'static str>,
    pending: Option<&'static str>,
}

/// Register every preview and control route.
pub(crate) fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/stream.mjpg", web::get().to(stream_handler))
        .route("/video_feed", web::get().to(stream_handler))
        .route("/frame.jpg", web::get().to(frame_handler))
        .route("/composite.jpg", web::get().to(composite_handler))
        .route("/status", web::get().to(status_handler))
        .route("/trackers", web::get().to(trackers_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/control/{action}", web::post().to(control_handler))
        .route("/reset_tracker", web::get().to(legacy_reset_tracker))
        .route("/recalibrate", web::get().to(legacy_recalibrate))
        .route("/set_tracker", web::get().to(legacy_set_tracker));
}

/// Spawn the preview server thread once the listener is bound.
pub(crate) fn spawn_preview_server(
    options: &ServerOptions,
    state: ServerState,
) -> Result<PreviewServer> {
    let bind = (options.bind.clone(), options.port);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
    let handle = telemetry::spawn_thread("linecam-preview-server", move || {
        let outcome = actix_web::rt::System::new().block_on(async move {
            let server = match HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .configure(routes)
            })
            .workers(2)
            .bind(bind.clone())
            {
                Ok(server) => server.run(),
                Err(err) => {
                    let _ = ready_tx.send(Err(format!("{}:{}: {err}", bind.0, bind.1)));
                    return Ok(());
                }
            };
            let _ = ready_tx.send(Ok(()));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = outcome {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("Preview server listening on {}:{}", options.bind, options.port);
            Ok(PreviewServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(reason)) => {
            let _ = handle.join();
            Err(anyhow!("failed to bind preview server on {reason}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("preview server thread exited during startup"))
        }
    }
}

/// Copy preview packets into the slots read by the HTTP handlers.
pub(crate) fn spawn_stream_forwarder(
    packets: Receiver<StreamPacket>,
    latest: SharedFrame,
    composite: SharedFrame,
) -> thread::JoinHandle<()> {
    telemetry::spawn_thread("linecam-stream-forwarder", move || {
        for packet in packets {
            let (slot, packet) = match packet {
                StreamPacket::Live(packet) => (&latest, packet),
                StreamPacket::Composite(packet) => (&composite, packet),
            };
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(packet);
            }
        }
        debug!("Preview stream closed");
    })
    .expect("failed to spawn stream forwarder")
}

/// Fetch the latest encoded frame from the shared pointer.
fn latest_frame(shared: &SharedFrame) -> Option<FramePacket> {
    match shared.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

fn latest_status(shared: &SharedStatus) -> Option<StatusSnapshot> {
    match shared.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

fn jpeg_response(packet: Option<FramePacket>) -> HttpResponse {
    match packet {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .append_header(("Cache-Control", "no-cache"))
            .append_header(("X-Sequence", packet.frame_number.to_string()))
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(crate::html::index::LINECAM_INDEX_HTML)
}

async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    jpeg_response(latest_frame(&state.latest))
}

async fn composite_handler(state: web::Data<ServerState>) -> HttpResponse {
    jpeg_response(latest_frame(&state.composite))
}

/// Stream the MJPEG feed over a multipart response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        let mut last_sent = None;
        loop {
            interval.tick().await;
            let Some(packet) = latest_frame(&state.latest) else {
                continue;
            };
            if last_sent == Some(packet.frame_number) {
                continue;
            }
            last_sent = Some(packet.frame_number);
            let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&packet.jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_status(&state.status) {
        Some(status) => HttpResponse::Ok().json(StatusResponse {
            status: &status,
            pending_publish: state.pending.load(Ordering::SeqCst),
        }),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn trackers_handler(state: web::Data<ServerState>) -> HttpResponse {
    let status = latest_status(&state.status);
    HttpResponse::Ok().json(TrackersResponse {
        available: &state.trackers,
        active: status.as_ref().map(|status| status.active_tracker),
        pending: status.as_ref().and_then(|status| status.pending_tracker),
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Translate `/control/{action}` into a controller command.
fn parse_command(action: &str, query: &ControlQuery) -> std::result::Result<Command, String> {
    let value = |param: &str| -> std::result::Result<u32, String> {
        let raw = query
            .value
            .as_deref()
            .ok_or_else(|| format!("{param} requires ?value=<n>"))?;
        raw.trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid {param}: {raw:?} is not a non-negative integer"))
    };
    match action {
        "cooldown" => Ok(Command::TriggerCooldown),
        "recalibrate" => Ok(Command::Recalibrate),
        "autofocus" => Ok(Command::ResetAutofocus),
        "tracker" => query
            .name
            .clone()
            .or_else(|| query.value.clone())
            .map(Command::SetTrackerBackend)
            .ok_or_else(|| "tracker requires ?name=<backend>".to_string()),
        "line_x" => value("line_x").map(Command::SetLineX),
        "min_y" => value("min_y").map(Command::SetMinY),
        "max_y" => value("max_y").map(Command::SetMaxY),
        other => Err(format!("unknown control action {other:?}")),
    }
}

fn control_reply(ok: bool, message: String) -> ControlResponse {
    ControlResponse { ok, message }
}

async fn dispatch(state: &ServerState, command: Command) -> HttpResponse {
    let label = command.label();
    match state.control.send(command).await {
        Ok(message) => HttpResponse::Ok().json(control_reply(true, message)),
        Err(err) => {
            debug!(command = label, "Control request failed: {err}");
            let body = control_reply(false, err.to_string());
            match err {
                err if err.is_rejection() => HttpResponse::BadRequest().json(body),
                CommandError::Timeout(_) | CommandError::Unavailable => {
                    HttpResponse::ServiceUnavailable().json(body)
                }
                _ => HttpResponse::InternalServerError().json(body),
            }
        }
    }
}

async fn control_handler(
    path: web::Path<String>,
    query: web::Query<ControlQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    match parse_command(&path, &query) {
        Ok(command) => dispatch(&state, command).await,
        Err(message) => HttpResponse::BadRequest().json(control_reply(false, message)),
    }
}

async fn legacy_text(state: &ServerState, command: Command, done: &str) -> HttpResponse {
    match state.control.send(command).await {
        Ok(_) => HttpResponse::Ok().body(done.to_string()),
        Err(err) if err.is_rejection() => HttpResponse::BadRequest().body(err.to_string()),
        Err(err) => HttpResponse::ServiceUnavailable().body(err.to_string()),
    }
}

async fn legacy_reset_tracker(state: web::Data<ServerState>) -> HttpResponse {
    legacy_text(&state, Command::TriggerCooldown, "Tracker reset").await
}

async fn legacy_recalibrate(state: web::Data<ServerState>) -> HttpResponse {
    legacy_text(&state, Command::Recalibrate, "Recalibrated").await
}

async fn legacy_set_tracker(
    query: web::Query<LegacyTrackerQuery>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let Some(name) = query.kind.clone() else {
        return HttpResponse::BadRequest().body("Invalid tracker type");
    };
    let done = format!("Tracker set to {name}");
    legacy_text(&state, Command::SetTrackerBackend(name), &done).await
}
