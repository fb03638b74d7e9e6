//! Control endpoints for the live session.
//!
//! Each endpoint returns the session snapshot after the command was applied.
//! Failures inside the session never show up as HTTP errors; they are visible
//! only as `status = "error"` in the snapshot. The one HTTP-level failure is a
//! driver that has stopped (503).

use crate::{error::AppError, live::LiveSnapshot, state::AppState};
use actix_web::{web, HttpResponse};
use tracing::info;

fn snapshot_response(snapshot: LiveSnapshot) -> HttpResponse {
    HttpResponse::Ok().json(snapshot)
}

fn unavailable(err: anyhow::Error) -> AppError {
    AppError::SessionUnavailable(err.to_string())
}

pub async fn get_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(snapshot_response(state.live.snapshot()))
}

pub async fn connect_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Connect requested over HTTP");
    let snapshot = state.live.connect().await.map_err(unavailable)?;
    Ok(snapshot_response(snapshot))
}

pub async fn disconnect_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    info!("Disconnect requested over HTTP");
    let snapshot = state.live.disconnect().await.map_err(unavailable)?;
    Ok(snapshot_response(snapshot))
}

pub async fn toggle_mute(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.live.toggle_mute().await.map_err(unavailable)?;
    Ok(snapshot_response(snapshot))
}
