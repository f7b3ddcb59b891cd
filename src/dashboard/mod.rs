//! HTTP/JSON API for the job source, worker clients and the operator console.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::geo::Coordinate;
use crate::node::Node;
use crate::scheduler::{Job, JobFilter, JobId, JobStatus, Offer, OfferStatus};
use crate::worker::{Worker, WorkerId};

#[derive(Clone)]
pub struct DashboardState {
    pub node: Arc<Node>,
}

/// Maps [`DispatchError`] onto HTTP. Lost races and resolved offers are not
/// failures from the worker's point of view and answer 200 with
/// `valid: false`.
pub struct ApiError(pub DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    valid: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_stale() => StatusCode::OK,
            DispatchError::NotOwner { .. } => StatusCode::FORBIDDEN,
            DispatchError::JobNotFound(_)
            | DispatchError::WorkerNotFound(_)
            | DispatchError::OfferNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::DuplicateJob(_)
            | DispatchError::DuplicateWorker(_)
            | DispatchError::WorkerBusy { .. }
            | DispatchError::IllegalTransition { .. } => StatusCode::CONFLICT,
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            valid: false,
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct SubmitJobRequest {
    id: String,
    lat: f64,
    lng: f64,
    address: String,
}

#[derive(Deserialize)]
struct JobQuery {
    status: Option<String>,
    lat: Option<f64>,
    lng: Option<f64>,
    radius_m: Option<f64>,
}

#[derive(Deserialize)]
struct WorkerRequest {
    worker_id: String,
}

#[derive(Deserialize)]
struct AbandonRequest {
    worker_id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct RegisterWorkerRequest {
    id: String,
    name: String,
    #[serde(default)]
    contact: String,
    vehicle: Option<String>,
}

#[derive(Deserialize)]
struct OnlineRequest {
    online: bool,
}

#[derive(Deserialize)]
struct LocationRequest {
    lat: f64,
    lng: f64,
    at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct LocationResponse {
    applied: bool,
}

#[derive(Deserialize)]
struct RejectRequest {
    #[serde(default)]
    reason: String,
}

/// Offer answer as seen by the worker screen.
#[derive(Serialize)]
struct OfferOutcome {
    valid: bool,
    offer: Offer,
}

pub fn router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/api/jobs/{id}", get(get_job_handler).delete(retract_job_handler))
        .route("/api/jobs/{id}/complete", post(complete_job_handler))
        .route("/api/jobs/{id}/abandon", post(abandon_job_handler))
        .route("/api/workers", get(list_workers_handler).post(register_worker_handler))
        .route("/api/workers/{id}", get(get_worker_handler))
        .route("/api/workers/{id}/online", post(online_handler))
        .route("/api/workers/{id}/location", post(location_handler))
        .route("/api/workers/{id}/history", get(history_handler))
        .route("/api/workers/{id}/offer", get(open_offer_handler))
        .route("/api/workers/{id}/offers/stream", get(offer_stream_handler))
        .route("/api/offers/{id}", get(get_offer_handler))
        .route("/api/offers/{id}/accept", post(accept_handler))
        .route("/api/offers/{id}/reject", post(reject_handler))
        .route("/api/incidents", get(incidents_handler))
        .route("/api/incidents/stream", get(incident_stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(DashboardState { node })
}

async fn submit_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitJobRequest>,
) -> ApiResult<impl IntoResponse> {
    if payload.id.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("job id must not be empty".into()).into());
    }
    let job = Job::new(payload.id, Coordinate::new(payload.lat, payload.lng), payload.address);
    let job = state.node.submit_job(job).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(state): State<DashboardState>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let mut filter = JobFilter::any();
    if let Some(status) = query.status.as_deref().filter(|s| !s.is_empty()) {
        filter.status = Some(
            status
                .parse::<JobStatus>()
                .map_err(DispatchError::InvalidRequest)?,
        );
    }
    if let (Some(lat), Some(lng), Some(radius_m)) = (query.lat, query.lng, query.radius_m) {
        filter = filter.within(Coordinate::new(lat, lng), radius_m);
    }
    Ok(Json(state.node.list_jobs(filter).await))
}

async fn get_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.node.job(&JobId::from(id)).await?))
}

async fn retract_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.node.retract_job(&JobId::from(id)).await?))
}

async fn complete_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    Json(payload): Json<WorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    let completion = state
        .node
        .complete_job(&JobId::from(id), &WorkerId::from(payload.worker_id))
        .await?;
    Ok(Json(completion))
}

async fn abandon_job_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    Json(payload): Json<AbandonRequest>,
) -> ApiResult<Json<Job>> {
    let job = state
        .node
        .abandon_job(&JobId::from(id), &WorkerId::from(payload.worker_id), &payload.reason)
        .await?;
    Ok(Json(job))
}

async fn register_worker_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<RegisterWorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    if payload.id.trim().is_empty() {
        return Err(DispatchError::InvalidRequest("worker id must not be empty".into()).into());
    }
    let mut worker = Worker::new(payload.id, payload.name, payload.contact);
    if let Some(vehicle) = payload.vehicle {
        worker = worker.with_vehicle(vehicle);
    }
    let worker = state.node.register_worker(worker).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn list_workers_handler(State(state): State<DashboardState>) -> Json<Vec<Worker>> {
    Json(state.node.list_workers().await)
}

async fn get_worker_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.node.worker(&WorkerId::from(id)).await?))
}

async fn online_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    Json(payload): Json<OnlineRequest>,
) -> ApiResult<Json<Worker>> {
    let worker = state
        .node
        .set_online(&WorkerId::from(id), payload.online)
        .await?;
    Ok(Json(worker))
}

async fn location_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    Json(payload): Json<LocationRequest>,
) -> ApiResult<Json<LocationResponse>> {
    let applied = state
        .node
        .update_location(
            &WorkerId::from(id),
            Coordinate::new(payload.lat, payload.lng),
            payload.at.unwrap_or_else(Utc::now),
        )
        .await?;
    Ok(Json(LocationResponse { applied }))
}

async fn history_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.node.worker_history(&WorkerId::from(id)).await?))
}

async fn open_offer_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let worker_id = WorkerId::from(id);
    state.node.worker(&worker_id).await?;
    Ok(Json(state.node.open_offer_for(&worker_id).await))
}

async fn offer_stream_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let worker_id = WorkerId::from(id);
    state.node.worker(&worker_id).await?;

    let stream = BroadcastStream::new(state.node.subscribe_offers()).filter_map(move |msg| match msg {
        Ok(notification) if notification.worker_id == worker_id => Event::default()
            .event("offer")
            .json_data(&notification)
            .ok()
            .map(Ok),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(worker_id = %worker_id, skipped, "Offer stream lagged");
            None
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn get_offer_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.node.offer(&id).await?))
}

async fn accept_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<OfferOutcome>> {
    let offer = state.node.accept_offer(&id).await?;
    Ok(Json(OfferOutcome {
        valid: offer.status == OfferStatus::Accepted,
        offer,
    }))
}

async fn reject_handler(
    State(state): State<DashboardState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<RejectRequest>>,
) -> ApiResult<Json<OfferOutcome>> {
    let reason = payload.map(|Json(p)| p.reason).unwrap_or_default();
    let offer = state.node.reject_offer(&id, &reason).await?;
    Ok(Json(OfferOutcome {
        valid: offer.status == OfferStatus::Rejected,
        offer,
    }))
}

async fn incidents_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.node.incident_feed().await)
}

async fn incident_stream_handler(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.node.subscribe_incidents()).filter_map(|msg| match msg {
        Ok(report) => Event::default()
            .event("incident")
            .json_data(&report)
            .ok()
            .map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "Incident stream lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
