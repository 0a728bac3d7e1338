use crate::api::response::ApiResponse;
use crate::error::{AppError, AppResult};
use crate::etl::{Cluster, ControlRequest, ControlResponse, RawEtlSpec};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use etl_common::types::NodeId;
use serde_json::json;
use std::sync::Arc;

pub fn etl_routes() -> Router<Arc<Cluster>> {
    Router::new()
        .route("/", put(create_etl))
        .route("/", get(list_etls))
        .route("/objects/:id", get(fetch_object))
        .route("/:name", get(get_etl).delete(delete_etl))
        .route("/:name/stop", post(stop_etl))
        .route("/:name/start", post(start_etl))
        .route(
            "/:name/transform/:node",
            post(transform_object).layer(DefaultBodyLimit::disable()),
        )
}

async fn control(cluster: &Cluster, request: ControlRequest) -> AppResult<ControlResponse> {
    Ok(cluster.handle(request).await?)
}

#[tracing::instrument(skip(cluster, payload))]
async fn create_etl(
    State(cluster): State<Arc<Cluster>>,
    payload: Result<Json<RawEtlSpec>, JsonRejection>,
) -> AppResult<Response> {
    let Json(spec) = payload?;
    let name = spec.name.clone();
    let response = control(&cluster, ControlRequest::Create { spec }).await?;

    tracing::info!(etl = %name, "ETL created via API");

    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(cluster))]
async fn list_etls(State(cluster): State<Arc<Cluster>>) -> AppResult<Response> {
    let response = control(&cluster, ControlRequest::List).await?;
    let count = match &response {
        ControlResponse::List(items) => items.len(),
        _ => 0,
    };

    tracing::debug!(count, "ETLs listed via API");

    let meta = json!({ "count": count, "nodes": cluster.node_ids() });
    Ok((StatusCode::OK, Json(ApiResponse::success_with_meta(response, meta))).into_response())
}

#[tracing::instrument(skip(cluster), fields(etl = %name))]
async fn get_etl(
    State(cluster): State<Arc<Cluster>>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let response = control(&cluster, ControlRequest::Status { name }).await?;
    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(cluster), fields(etl = %name))]
async fn stop_etl(
    State(cluster): State<Arc<Cluster>>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let response = control(&cluster, ControlRequest::Stop { name }).await?;

    tracing::info!("ETL stopped via API");

    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(cluster), fields(etl = %name))]
async fn start_etl(
    State(cluster): State<Arc<Cluster>>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let response = control(&cluster, ControlRequest::Start { name }).await?;

    tracing::info!("ETL started via API");

    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(cluster), fields(etl = %name))]
async fn delete_etl(
    State(cluster): State<Arc<Cluster>>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let response = control(&cluster, ControlRequest::Delete { name }).await?;

    tracing::info!("ETL deleted via API");

    Ok((StatusCode::OK, Json(ApiResponse::success(response))).into_response())
}

#[tracing::instrument(skip(cluster, body), fields(etl = %name, node = %node, size = body.len()))]
async fn transform_object(
    State(cluster): State<Arc<Cluster>>,
    Path((name, node)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<Response> {
    let out = cluster.transform(&name, &NodeId::new(node.as_str()), body).await?;

    tracing::debug!(out = out.len(), "Object transformed");

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        out,
    )
        .into_response())
}

/// Pull-mode callback: a pod fetches the object it was told about.
#[tracing::instrument(skip(cluster))]
async fn fetch_object(
    State(cluster): State<Arc<Cluster>>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id: u64 = id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid object id '{}'", id)))?;
    let data = cluster.fetch_object(id)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}
