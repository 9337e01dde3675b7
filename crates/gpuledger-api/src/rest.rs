//! REST API handlers

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, Request, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use gpuledger_cluster::ControlPlane;
use gpuledger_core::{Binding, LedgerError, LedgerResult, WorkloadId, WorkloadSpec};
use gpuledger_scheduler::{AllocationCoordinator, Reservation};
use gpuledger_store::LedgerStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_NAME_LEN: usize = 63;

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Arc<AllocationCoordinator>,
    pub store: Arc<dyn LedgerStore>,
    pub plane: Arc<dyn ControlPlane>,
    /// Labels put on admitted workloads so the reconciler selects them
    pub workload_labels: BTreeMap<String, String>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<AllocationCoordinator>,
        store: Arc<dyn LedgerStore>,
        plane: Arc<dyn ControlPlane>,
        workload_selector: &str,
    ) -> Self {
        Self {
            coordinator,
            store,
            plane,
            workload_labels: selector_labels(workload_selector),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/create", post(create_workload))
        .route("/api/v1/capacity", get(get_capacity))
        .route("/api/v1/status", get(get_status))
        .with_state(Arc::new(state))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http().make_span_with(
                    |request: &Request<axum::body::Body>| {
                        let request_id = request
                            .headers()
                            .get(REQUEST_ID_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id = %request_id,
                        )
                    },
                ))
                .layer(TimeoutLayer::new(request_timeout))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

/// Request ids are random v4 UUIDs
#[derive(Clone, Copy, Default)]
struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Error response carrying a status per error kind
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            LedgerError::AlreadyExists(_) => StatusCode::CONFLICT,
            LedgerError::NoCapacityAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, format!("[ERROR] {}\n", self.message)).into_response()
    }
}

/// Request to admit a workload
#[derive(Debug, Deserialize)]
pub struct CreateWorkloadRequest {
    /// Workload name, unique within the namespace
    pub name: String,
    /// Container image
    pub image: String,
    /// Requested VRAM in GiB
    pub vram: i64,
}

/// Allocate VRAM and submit a workload bound to it
async fn create_workload(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateWorkloadRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    let Json(req) = payload.map_err(|rejection| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid request body: {}", rejection.body_text()),
        )
    })?;
    validate_name(&req.name)?;
    if req.image.trim().is_empty() {
        return Err(LedgerError::InvalidRequest("image must not be empty".to_string()).into());
    }

    let namespace = state.plane.namespace().to_string();
    let id = WorkloadId::new(namespace.clone(), req.name.clone());
    info!(workload = %id, image = %req.image, vram = req.vram, "Admitting workload");

    let conflict = |id: &WorkloadId| {
        ApiError::new(
            StatusCode::CONFLICT,
            format!(
                "Workload '{}' already exists in namespace [{}]",
                id.name, id.namespace
            ),
        )
    };

    let reservation = state
        .coordinator
        .allocate_for(&id, req.vram)
        .await
        .map_err(|e| match e {
            LedgerError::AlreadyExists(_) => conflict(&id),
            e => {
                warn!(workload = %id, error = %e, "Allocation failed");
                ApiError::from(e)
            }
        })?;

    let spec = WorkloadSpec {
        labels: state.workload_labels.clone(),
        ..WorkloadSpec::new(id.clone(), req.image, reservation.binding().clone())
            .with_binding_uid(reservation.uid())
    };

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(submit(Arc::clone(&state), reservation, spec, done_tx));
    let submitted = done_rx.await.map_err(|_| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Submission of workload '{}' was aborted", id.name),
        )
    })?;

    let binding = submitted.map_err(|e| match e {
        LedgerError::AlreadyExists(_) => conflict(&id),
        e => {
            error!(workload = %id, error = %e, "Workload submission failed");
            ApiError::from(e)
        }
    })?;

    info!(workload = %id, binding = %binding, "Workload admitted");
    Ok(format!(
        "Workload '{}' created successfully in namespace [{}] on {}/{}\n",
        id.name, namespace, binding.node_id, binding.slot_id
    ))
}

/// Submit a workload backed by a held reservation.
///
/// Runs detached from the request so a timed-out request never cuts a
/// submission off halfway. The reservation is committed only once the
/// requester has the result; if the requester is gone by then, the workload
/// is withdrawn instead.
async fn submit(
    state: Arc<AppState>,
    reservation: Reservation,
    spec: WorkloadSpec,
    done: oneshot::Sender<LedgerResult<Binding>>,
) {
    let id = spec.id.clone();
    if let Err(e) = state.plane.create_workload(&spec).await {
        if let Err(release_err) = reservation.cancel().await {
            error!(workload = %id, error = %release_err, "Compensating release failed");
        }
        let _ = done.send(Err(e));
        return;
    }

    match done.send(Ok(reservation.binding().clone())) {
        Ok(()) => {
            reservation.commit();
        }
        Err(_) => withdraw(&state, &id, reservation).await,
    }
}

/// Delete a workload whose request was abandoned, then release its
/// reservation. If the delete fails the reservation is kept so the running
/// workload stays accounted for until the reconciler reclaims it.
async fn withdraw(state: &AppState, id: &WorkloadId, reservation: Reservation) {
    warn!(workload = %id, "Request abandoned during submission, withdrawing workload");
    match state.plane.delete_workload(id).await {
        Ok(()) | Err(LedgerError::NotFound(_)) => {
            if let Err(e) = reservation.cancel().await {
                error!(workload = %id, error = %e, "Failed to release withdrawn reservation");
            }
        }
        Err(e) => {
            error!(workload = %id, error = %e, "Failed to withdraw workload, keeping reservation");
            reservation.commit();
        }
    }
}

fn validate_name(name: &str) -> Result<(), ApiError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidRequest(format!(
            "workload name {:?} must be a lowercase DNS label",
            name
        ))
        .into())
    }
}

/// Labels implied by a `key=value[,key=value]` selector
fn selector_labels(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|term| term.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Capacity of one GPU slot
#[derive(Debug, Serialize, Deserialize)]
pub struct CapacityResponse {
    pub node_id: String,
    pub slot_id: u32,
    pub total_capacity: u64,
    pub used_capacity: u64,
    pub remaining_capacity: u64,
    pub available: bool,
}

/// List the ledger
async fn get_capacity(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CapacityResponse>>, ApiError> {
    let records = state.store.list_capacity().await?;
    Ok(Json(
        records
            .into_iter()
            .map(|r| CapacityResponse {
                remaining_capacity: r.remaining_capacity(),
                node_id: r.node_id,
                slot_id: r.slot_id,
                total_capacity: r.total_capacity,
                used_capacity: r.used_capacity,
                available: r.available,
            })
            .collect(),
    ))
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub store: String,
    pub control_plane: String,
    pub nodes: usize,
    pub slots: usize,
    pub bindings: usize,
    pub total_vram: u64,
    pub used_vram: u64,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    let records = state.store.list_capacity().await?;
    let bindings = state.store.list_bindings().await?;
    let nodes = records
        .iter()
        .map(|r| r.node_id.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store.name().to_string(),
        control_plane: state.plane.name().to_string(),
        nodes,
        slots: records.len(),
        bindings: bindings.len(),
        total_vram: records.iter().map(|r| r.total_capacity).sum(),
        used_vram: records.iter().map(|r| r.used_capacity).sum(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use gpuledger_cluster::InMemoryCluster;
    use gpuledger_core::{Binding, WorkloadPhase};
    use gpuledger_scheduler::RetryPolicy;
    use gpuledger_store::MemoryLedger;
    use tower::ServiceExt;

    struct Fixture {
        store: Arc<MemoryLedger>,
        cluster: Arc<InMemoryCluster>,
        router: Router,
    }

    async fn fixture(slots: &[(&str, u32, u64)]) -> Fixture {
        fixture_with_timeout(slots, Duration::from_secs(5)).await
    }

    async fn fixture_with_timeout(slots: &[(&str, u32, u64)], timeout: Duration) -> Fixture {
        let store = Arc::new(MemoryLedger::new());
        for &(node, slot, total) in slots {
            store.register_slot(node, slot, total).await.unwrap();
        }
        let cluster = Arc::new(InMemoryCluster::new("xrcloud"));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            budget: Duration::from_secs(1),
        };
        let coordinator = Arc::new(AllocationCoordinator::new(store.clone(), policy));
        let state = AppState::new(coordinator, store.clone(), cluster.clone(), "app=gpushare");
        Fixture {
            store,
            cluster,
            router: create_router(state, timeout),
        }
    }

    fn create(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/create")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn used(store: &MemoryLedger) -> u64 {
        store
            .list_capacity()
            .await
            .unwrap()
            .iter()
            .map(|r| r.used_capacity)
            .sum()
    }

    #[tokio::test]
    async fn test_create_workload() {
        let f = fixture(&[("node-a", 0, 16)]).await;

        let (status, body) = send(
            &f.router,
            create(r#"{"name":"train-1","image":"busybox","vram":6}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "Workload 'train-1' created successfully in namespace [xrcloud] on node-a/0\n"
        );

        let id = WorkloadId::new("xrcloud", "train-1");
        let workload = f.cluster.workload(&id).await.unwrap();
        assert_eq!(workload.phase, WorkloadPhase::Pending);
        assert_eq!(workload.binding, Some(Binding::new("node-a", 0, 6)));
        assert_eq!(workload.labels.get("app").map(String::as_str), Some("gpushare"));
        let record = f.store.binding(&id).await.unwrap().unwrap();
        assert_eq!(workload.binding_uid, Some(record.uid));
        assert_eq!(used(&f.store).await, 6);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_requests() {
        let f = fixture(&[("node-a", 0, 16)]).await;

        for body in [
            r#"{"name":"job","image":"busybox","vram":0}"#,
            r#"{"name":"job","image":"busybox","vram":-5}"#,
            r#"{"name":"Bad_Name","image":"busybox","vram":1}"#,
            r#"{"name":"job","image":"","vram":1}"#,
            r#"{"name":"job","image":"busybox"}"#,
            "not json",
        ] {
            let (status, _) = send(&f.router, create(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body}");
        }
        assert_eq!(used(&f.store).await, 0);
    }

    #[tokio::test]
    async fn test_create_wrong_method() {
        let f = fixture(&[("node-a", 0, 16)]).await;
        let request = Request::builder()
            .method("GET")
            .uri("/create")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(&f.router, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_create_duplicate_name_conflicts() {
        let f = fixture(&[("node-a", 0, 16)]).await;
        let body = r#"{"name":"job","image":"busybox","vram":4}"#;

        assert_eq!(send(&f.router, create(body)).await.0, StatusCode::OK);
        let (status, text) = send(&f.router, create(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(text.contains("already exists in namespace [xrcloud]"));
        assert_eq!(used(&f.store).await, 4);
    }

    #[tokio::test]
    async fn test_create_without_capacity() {
        let f = fixture(&[("node-a", 0, 16)]).await;

        let (status, _) = send(
            &f.router,
            create(r#"{"name":"big","image":"busybox","vram":17}"#),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_failed_submission_releases_reservation() {
        let f = fixture(&[("node-a", 0, 16)]).await;
        f.cluster
            .fail_next_create(LedgerError::ControlPlane("admission webhook denied".to_string()))
            .await;

        let (status, _) = send(
            &f.router,
            create(r#"{"name":"job","image":"busybox","vram":8}"#),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(used(&f.store).await, 0);
        assert!(f
            .store
            .binding(&WorkloadId::new("xrcloud", "job"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_existing_cluster_workload_conflicts_and_releases() {
        let f = fixture(&[("node-a", 0, 16)]).await;
        f.cluster
            .fail_next_create(LedgerError::AlreadyExists("pod xrcloud/job".to_string()))
            .await;

        let (status, _) = send(
            &f.router,
            create(r#"{"name":"job","image":"busybox","vram":8}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(used(&f.store).await, 0);
    }

    #[tokio::test]
    async fn test_timed_out_request_withdraws_workload() {
        let f = fixture_with_timeout(&[("node-a", 0, 16)], Duration::from_millis(30)).await;
        f.cluster.delay_next_create(Duration::from_millis(150)).await;

        let (status, _) = send(
            &f.router,
            create(r#"{"name":"slow","image":"busybox","vram":8}"#),
        )
        .await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

        let id = WorkloadId::new("xrcloud", "slow");
        let mut settled = false;
        for _ in 0..200 {
            if used(&f.store).await == 0
                && f.store.binding(&id).await.unwrap().is_none()
                && f.cluster.deletes() == 1
            {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(settled);
        assert!(f.cluster.workload(&id).await.is_none());

        // The name is free again
        let (status, _) = send(
            &f.router,
            create(r#"{"name":"slow","image":"busybox","vram":8}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_capacity_and_status() {
        let f = fixture(&[("node-a", 0, 16), ("node-a", 1, 8), ("node-b", 0, 24)]).await;
        send(
            &f.router,
            create(r#"{"name":"job","image":"busybox","vram":10}"#),
        )
        .await;

        let request = Request::builder()
            .uri("/api/v1/capacity")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&f.router, request).await;
        assert_eq!(status, StatusCode::OK);
        let capacity: Vec<CapacityResponse> = serde_json::from_str(&body).unwrap();
        assert_eq!(capacity.len(), 3);
        assert_eq!(capacity[0].remaining_capacity, 6);

        let request = Request::builder()
            .uri("/api/v1/status")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&f.router, request).await;
        assert_eq!(status, StatusCode::OK);
        let status: StatusResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(status.nodes, 2);
        assert_eq!(status.slots, 3);
        assert_eq!(status.bindings, 1);
        assert_eq!(status.total_vram, 48);
        assert_eq!(status.used_vram, 10);
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let f = fixture(&[]).await;
        let request = Request::builder()
            .uri("/api/v1/status")
            .body(Body::empty())
            .unwrap();

        let response = f.router.clone().oneshot(request).await.unwrap();
        let id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_selector_labels() {
        let labels = selector_labels("app=gpushare, tier = batch,flag");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("tier").map(String::as_str), Some("batch"));
    }
}
