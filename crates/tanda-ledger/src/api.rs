//! HTTP API for the pool ledger.

use crate::error::Error;
use crate::models::{Address, Pool};
use crate::service::{parse_addresses, CreatePoolRequest, CreditReport, PoolService, PoolStatus};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type AppState = PoolService;

/// Build the API router.
pub fn build_router(service: PoolService) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        // Pools
        .route("/api/v1/pools", get(list_pools).post(create_pool))
        .route("/api/v1/pools/:id", get(get_pool))
        .route("/api/v1/pools/:id/join", post(join_pool))
        .route("/api/v1/pools/:id/status", get(pool_status))
        // Scores
        .route("/api/v1/credit-scores", post(credit_scores))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// An [`Error`] rendered as `{ success: false, error, details }`.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

/// Status code for an error.
pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) | Error::Schedule(_) => StatusCode::BAD_REQUEST,
        Error::AlreadyMember { .. } | Error::AlreadyExists(_) => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PrivatePool(_) | Error::Ineligible { .. } => StatusCode::FORBIDDEN,
        Error::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }

        let details = match &self.0 {
            Error::Ineligible { threshold, failures } => {
                json!({ "threshold": threshold, "failures": failures })
            }
            Error::AlreadyMember { pool, participant } => {
                json!({ "pool": pool, "participant": participant })
            }
            Error::ConsistencyFault(fault) => json!(fault),
            _ => Value::Null,
        };

        let body = json!({
            "success": false,
            "error": self.0.to_string(),
            "details": details,
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<Address> {
    Ok(Address::parse(raw)?)
}

// --- Health ---

async fn health() -> &'static str {
    "OK"
}

// --- Pools ---

#[derive(Debug, Deserialize)]
struct ListQuery {
    participant: Option<String>,
    #[serde(default)]
    public: bool,
}

async fn list_pools(
    State(service): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Pool>>> {
    let pools = match query.participant {
        Some(raw) => {
            let participant = parse_id(&raw)?;
            let mut pools = service.pools_for(&participant);
            if query.public {
                pools.retain(|p| p.is_public);
            }
            pools
        }
        None if query.public => service.list_public_pools(),
        None => service.list_pools(),
    };
    Ok(Json(pools))
}

async fn create_pool(
    State(service): State<AppState>,
    payload: Result<Json<CreatePoolRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Pool>)> {
    let Json(request) = payload?;
    let pool = service.create_pool(request).await?;
    Ok((StatusCode::CREATED, Json(pool)))
}

async fn get_pool(
    State(service): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Pool>> {
    let id = parse_id(&id)?;
    Ok(Json(service.get_pool(&id)?))
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    participant: String,
}

async fn join_pool(
    State(service): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<JoinRequest>, JsonRejection>,
) -> ApiResult<Json<Pool>> {
    let Json(request) = payload?;
    let id = parse_id(&id)?;
    let participant = parse_id(&request.participant)?;
    Ok(Json(service.join_pool(&id, &participant).await?))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    participant: Option<String>,
}

async fn pool_status(
    State(service): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<PoolStatus>> {
    let id = parse_id(&id)?;
    let participant = query.participant.as_deref().map(parse_id).transpose()?;
    let status = service
        .pool_status(&id, participant.as_ref(), Utc::now())
        .await?;
    Ok(Json(status))
}

// --- Scores ---

#[derive(Debug, Deserialize)]
struct CreditScoresRequest {
    participants: Vec<String>,
}

async fn credit_scores(
    State(service): State<AppState>,
    payload: Result<Json<CreditScoresRequest>, JsonRejection>,
) -> ApiResult<Json<CreditReport>> {
    let Json(request) = payload?;
    if request.participants.is_empty() {
        return Err(Error::Validation("participants must not be empty".into()).into());
    }
    let participants = parse_addresses(&request.participants)?;
    Ok(Json(service.credit_report(&participants).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{InMemoryChainReader, ObservedCycle};
    use crate::eligibility::{EligibilityGate, StaticScoreSource};
    use crate::storage::PoolStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn addr(n: u8) -> String {
        format!("0x{}", hex::encode([n; 20]))
    }

    fn router() -> (Router, Arc<InMemoryChainReader>) {
        let source = StaticScoreSource::new()
            .with_score(Address::parse(&addr(1)).unwrap(), 90.0)
            .with_score(Address::parse(&addr(2)).unwrap(), 30.0);
        let chain = Arc::new(InMemoryChainReader::new());
        let service = PoolService::new(
            Arc::new(PoolStore::in_memory()),
            EligibilityGate::new(Arc::new(source)),
            chain.clone(),
        );
        (build_router(service), chain)
    }

    async fn call(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn create_body(requirement: f64, public: bool) -> Value {
        json!({
            "id": addr(0xaa),
            "name": "Friends",
            "participants": [addr(1)],
            "paymentAmount": "1000000",
            "paymentFrequencySecs": 604800,
            "isPublic": public,
            "creditRequirement": requirement,
            "creator": addr(1),
        })
    }

    #[tokio::test]
    async fn health_ok() {
        let (router, _) = router();
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_fetch_and_list() {
        let (router, _) = router();
        let (status, pool) =
            call(&router, "POST", "/api/v1/pools", Some(create_body(50.0, true))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(pool["averageCredit"], 90.0);

        let uri = format!("/api/v1/pools/{}", addr(0xaa));
        let (status, fetched) = call(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["name"], "Friends");

        let (_, mine) = call(
            &router,
            "GET",
            &format!("/api/v1/pools?participant={}", addr(1)),
            None,
        )
        .await;
        assert_eq!(mine.as_array().unwrap().len(), 1);

        let (status, _) =
            call(&router, "POST", "/api/v1/pools", Some(create_body(50.0, true))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn errors_carry_status_and_body() {
        let (router, _) = router();
        let (status, body) = call(&router, "GET", "/api/v1/pools/0x1234", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let uri = format!("/api/v1/pools/{}", addr(0xbb));
        let (status, _) = call(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&router, "POST", "/api/v1/pools", Some(json!({"name": 1}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn join_refusals_map_to_statuses() {
        let (router, _) = router();
        call(&router, "POST", "/api/v1/pools", Some(create_body(50.0, true))).await;
        let join = format!("/api/v1/pools/{}/join", addr(0xaa));

        let (status, body) =
            call(&router, "POST", &join, Some(json!({"participant": addr(2)}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["details"]["failures"][0]["score"], 30.0);

        let (status, _) = call(&router, "POST", &join, Some(json!({"participant": addr(1)}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn status_needs_chain_state() {
        let (router, chain) = router();
        call(&router, "POST", "/api/v1/pools", Some(create_body(0.0, true))).await;
        let uri = format!("/api/v1/pools/{}/status?participant={}", addr(0xaa), addr(1));

        let (status, _) = call(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        chain.insert(
            Address::parse(&addr(0xaa)).unwrap(),
            ObservedCycle {
                vault_balance: 0,
                cycle_start: 1_700_000_000,
                payment_frequency: 604_800,
                participants: vec![Address::parse(&addr(1)).unwrap()],
                current_recipient_index: 0,
                paid: vec![false],
            },
        );
        let (status, body) = call(&router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["claimEligibleAt"], "2023-11-21T22:13:20Z");
        assert_eq!(body["hasPaid"], false);
    }

    #[tokio::test]
    async fn credit_scores_report() {
        let (router, _) = router();
        let (status, body) = call(
            &router,
            "POST",
            "/api/v1/credit-scores",
            Some(json!({"participants": [addr(1), addr(2), addr(3)]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["average"], 40.0);
        assert_eq!(body["scores"][2]["score"], 0.0);

        let (status, _) = call(
            &router,
            "POST",
            "/api/v1/credit-scores",
            Some(json!({"participants": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
