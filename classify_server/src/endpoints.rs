//! Endpoints of HTTP server.
//!
use std::{convert::Infallible, sync::Arc};

use axum::{
    body::StreamBody,
    extract::Query,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use common::protocol::{Fault, ViewState};
use futures::{future, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    controller::{ControllerComm, Outcome},
    meter::METER,
    render::render_page,
};

/// Search parameters of the device selection.
#[derive(Debug, Deserialize)]
pub struct DeviceParams {
    id: String,
}

/// Build the router serving the view.
pub fn router(comm: Arc<ControllerComm>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/state", get(state))
        .route("/stream", get(preview_stream))
        .route("/classify", post(classify))
        .route("/device", post(select_device))
        .route("/healthcheck", get(healthcheck))
        .layer(Extension(comm))
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

pub async fn index(Extension(comm): Extension<Arc<ControllerComm>>) -> Html<String> {
    Html(render_page(&comm.state()))
}

pub async fn state(Extension(comm): Extension<Arc<ControllerComm>>) -> Json<ViewState> {
    Json(comm.state())
}

// Live preview of the selected camera.
pub async fn preview_stream(Extension(comm): Extension<Arc<ControllerComm>>) -> impl IntoResponse {
    log::info!("Preview stream requested");

    // Frames missed by a slow client are skipped
    let stream = BroadcastStream::new(comm.subscribe_preview())
        .filter_map(|item| future::ready(item.ok()))
        .map(|item| {
            METER.tick_preview();
            Ok::<_, Infallible>(item)
        });

    // Set body and headers for multipart streaming
    let body = StreamBody::new(stream);
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

/// Click on the video: classify one more frame.
pub async fn classify(Extension(comm): Extension<Arc<ControllerComm>>) -> Response {
    match comm.classify().await {
        Ok(Outcome::Classified) => Json(comm.state()).into_response(),
        Ok(Outcome::Skipped) => StatusCode::NO_CONTENT.into_response(),
        Err(fault) => fault_response(fault),
    }
}

pub async fn select_device(
    Extension(comm): Extension<Arc<ControllerComm>>,
    Query(params): Query<DeviceParams>,
) -> Response {
    log::info!("Device {} selected", &params.id);
    match comm.select_device(&params.id).await {
        Ok(()) => Json(comm.state()).into_response(),
        Err(fault) => fault_response(fault),
    }
}

fn fault_response(fault: Fault) -> Response {
    let status = match fault {
        Fault::DeviceUnavailable(_) | Fault::NoDevices => StatusCode::NOT_FOUND,
        Fault::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, fault.to_string()).into_response()
}
