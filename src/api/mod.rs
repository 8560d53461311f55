//! HTTP surface of the orchestrator.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::descriptor::DescriptorDocument;
use crate::error::{Result, SmoError};
use crate::orchestrator::Orchestrator;

/// Wrapper so orchestrator errors can travel through warp rejections.
#[derive(Debug)]
struct ApiError(SmoError);

impl warp::reject::Reject for ApiError {}

fn reject(error: SmoError) -> Rejection {
    warp::reject::custom(ApiError(error))
}

/// Serve the API until the process exits.
pub async fn serve(orchestrator: Arc<Orchestrator>, bind_address: &str, port: u16) -> Result<()> {
    let addr: std::net::SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("✅ SMO API listening on http://{}", addr);
    warp::serve(routes(orchestrator)).run(addr).await;
    Ok(())
}

/// The full route tree; exposed separately so tests can drive it without a
/// socket.
pub fn routes(
    orchestrator: Arc<Orchestrator>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let orch = orchestrator.clone();
    let list = warp::path!("graph" / "project" / String)
        .and(warp::get())
        .and_then(move |project: String| {
            let orch = orch.clone();
            async move { list_handler(orch, project).await }
        });

    let orch = orchestrator.clone();
    let submit = warp::path!("graph" / "project" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .and_then(move |project: String, body: Bytes| {
            let orch = orch.clone();
            async move { submit_handler(orch, project, body).await }
        });

    let orch = orchestrator.clone();
    let fetch = warp::path!("graph" / String)
        .and(warp::get())
        .and_then(move |name: String| {
            let orch = orch.clone();
            async move { fetch_handler(orch, name).await }
        });

    let orch = orchestrator.clone();
    let placement = warp::path!("graph" / String / "placement")
        .and(warp::get())
        .and_then(move |name: String| {
            let orch = orch.clone();
            async move { placement_handler(orch, name).await }
        });

    let orch = orchestrator.clone();
    let start = warp::path!("graph" / String / "start")
        .and(warp::get())
        .and_then(move |name: String| {
            let orch = orch.clone();
            async move { start_handler(orch, name).await }
        });

    let orch = orchestrator.clone();
    let stop = warp::path!("graph" / String / "stop")
        .and(warp::get())
        .and_then(move |name: String| {
            let orch = orch.clone();
            async move { stop_handler(orch, name).await }
        });

    let orch = orchestrator.clone();
    let remove = warp::path!("graph" / String)
        .and(warp::delete())
        .and_then(move |name: String| {
            let orch = orch.clone();
            async move { remove_handler(orch, name).await }
        });

    list.or(submit)
        .or(placement)
        .or(start)
        .or(stop)
        .or(fetch)
        .or(remove)
        .with(warp::log("smo_api"))
        .recover(handle_rejection)
}

async fn list_handler(
    orchestrator: Arc<Orchestrator>,
    project: String,
) -> Result<impl Reply, Rejection> {
    let graphs = orchestrator.list(&project).await;
    Ok(warp::reply::json(&graphs))
}

async fn submit_handler(
    orchestrator: Arc<Orchestrator>,
    project: String,
    body: Bytes,
) -> Result<impl Reply, Rejection> {
    // The body is either `{"artifact": "<oci-ref>"}` or a descriptor
    // document in YAML or JSON
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
        if let Some(artifact_ref) = value.get("artifact").and_then(|v| v.as_str()) {
            orchestrator
                .submit_artifact(&project, artifact_ref)
                .await
                .map_err(reject)?;
            return Ok(warp::reply::with_status("Graph deployed", StatusCode::OK));
        }
    }

    let document = DescriptorDocument::parse(&body).map_err(reject)?;
    orchestrator
        .submit(&project, document.hda_graph)
        .await
        .map_err(reject)?;
    Ok(warp::reply::with_status("Graph deployed", StatusCode::OK))
}

async fn fetch_handler(
    orchestrator: Arc<Orchestrator>,
    name: String,
) -> Result<impl Reply, Rejection> {
    match orchestrator.fetch(&name).await {
        Some(graph) => Ok(warp::reply::json(&graph)),
        None => Err(reject(SmoError::GraphNotFound { name })),
    }
}

async fn placement_handler(
    orchestrator: Arc<Orchestrator>,
    name: String,
) -> Result<impl Reply, Rejection> {
    orchestrator.replace(&name).await.map_err(reject)?;
    Ok(warp::reply::with_status(
        "Placement algorithm triggered",
        StatusCode::OK,
    ))
}

async fn start_handler(
    orchestrator: Arc<Orchestrator>,
    name: String,
) -> Result<impl Reply, Rejection> {
    orchestrator.start(&name).await.map_err(reject)?;
    Ok(warp::reply::with_status("Graph started", StatusCode::OK))
}

async fn stop_handler(
    orchestrator: Arc<Orchestrator>,
    name: String,
) -> Result<impl Reply, Rejection> {
    orchestrator.stop(&name).await.map_err(reject)?;
    Ok(warp::reply::with_status("Graph stopped", StatusCode::OK))
}

async fn remove_handler(
    orchestrator: Arc<Orchestrator>,
    name: String,
) -> Result<impl Reply, Rejection> {
    orchestrator.remove(&name).await.map_err(reject)?;
    Ok(warp::reply::with_status("Graph removed", StatusCode::OK))
}

/// Map error kinds to status codes and a structured body.
async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Rejection> {
    let (status, kind, message) = if let Some(ApiError(error)) = rejection.find::<ApiError>() {
        let status = match error {
            SmoError::GraphNotFound { .. } => StatusCode::NOT_FOUND,
            SmoError::GraphAlreadyExists { .. }
            | SmoError::AlreadyRunning { .. }
            | SmoError::AlreadyStopped { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = match error {
            SmoError::Subprocess(_) => "Subprocess error",
            SmoError::Descriptor(_) | SmoError::Yaml(_) => "Yaml read error",
            SmoError::Solver(_) => "Solver error",
            SmoError::GraphNotFound { .. } => "Not found",
            SmoError::GraphAlreadyExists { .. }
            | SmoError::AlreadyRunning { .. }
            | SmoError::AlreadyStopped { .. } => "Bad request",
            _ => "Internal error",
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", error);
        }
        (status, kind, error.to_string())
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found", "No such route".to_string())
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error",
            format!("{:?}", rejection),
        )
    };

    let body = warp::reply::json(&serde_json::json!({
        "error": kind,
        "message": message,
    }));
    Ok(warp::reply::with_status(body, status))
}
