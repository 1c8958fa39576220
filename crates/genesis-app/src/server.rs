//! REST control surface and WebSocket observer endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use genesis_bus::Severity;
use genesis_core::ParamError;
use genesis_runtime::GenesisRuntime;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<GenesisRuntime>,
}

/// Error envelope returned by every failing operator command.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code, message: message.into() }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }
}

impl From<ParamError> for ApiError {
    fn from(err: ParamError) -> Self {
        match &err {
            ParamError::UnknownParam(_) => Self::bad_request("UNKNOWN_PARAM", err.to_string()),
            ParamError::InvalidValue { .. } => {
                Self::bad_request("INVALID_VALUE", err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            code: self.code.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateParamRequest {
    pub name: String,
    #[schema(value_type = Object)]
    pub value: Value,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ForceEvolutionRequest {
    #[serde(default)]
    pub reason: Option<String>,
    /// One of `low`, `medium`, `high`, `critical`.
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_world,
        get_stats,
        update_param,
        force_evolution,
        list_mutations,
        get_mutation_source,
        list_entities,
        get_entity,
        kill_entity
    ),
    components(schemas(ErrorResponse, UpdateParamRequest, ForceEvolutionRequest)),
    info(
        title = "Genesis Operator API",
        version = env!("CARGO_PKG_VERSION"),
        description = "World inspection and evolution controls"
    ),
    tags((name = "world"), (name = "evolution"), (name = "mutations"), (name = "entities"))
)]
struct ApiDoc;

/// Build the full application router.
pub fn router(runtime: Arc<GenesisRuntime>) -> Router {
    let state = ApiState { runtime };
    let api = Router::new()
        .route("/api/world", get(get_world))
        .route("/api/stats", get(get_stats))
        .route("/api/params", patch(update_param))
        .route("/api/evolution/force", post(force_evolution))
        .route("/api/mutations", get(list_mutations))
        .route("/api/mutations/{id}/source", get(get_mutation_source))
        .route("/api/entities", get(list_entities))
        .route("/api/entities/{id}", get(get_entity).delete(kill_entity))
        .route("/ws/world", get(ws_world))
        .route("/ws/agents", get(ws_agents))
        .with_state(state);

    Router::new()
        .merge(api)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

#[utoipa::path(
    get,
    path = "/api/world",
    tag = "world",
    responses((status = 200, description = "Current world overview"))
)]
async fn get_world(State(state): State<ApiState>) -> Json<Value> {
    let world = state.runtime.world();
    let world = world.lock().expect("world lock poisoned");
    Json(json!({
        "tick": world.tick().0,
        "entity_count": world.alive_count(),
        "resource_count": world.resource_count(),
        "mean_energy": world.mean_energy(),
        "params": world.config(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "world",
    responses((status = 200, description = "Aggregate statistics and pipeline state"))
)]
async fn get_stats(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.runtime.snapshots().latest();
    let registry = state.runtime.registry();
    Json(json!({
        "snapshot": snapshot.as_deref(),
        "registry": {
            "registry_version": registry.version(),
            "traits": registry.names(),
        },
        "cycle": state.runtime.cycle().current(),
        "observers": state.runtime.hub().session_count(),
        "dropped_critical_events": state.runtime.bus().dropped_critical(),
    }))
}

#[utoipa::path(
    patch,
    path = "/api/params",
    tag = "world",
    request_body = UpdateParamRequest,
    responses(
        (status = 200, description = "Queued for the next tick boundary"),
        (status = 400, body = ErrorResponse)
    )
)]
async fn update_param(
    State(state): State<ApiState>,
    Json(request): Json<UpdateParamRequest>,
) -> Result<Json<Value>, ApiError> {
    let change = state.runtime.update_param(&request.name, &request.value)?;
    Ok(Json(json!({
        "queued": change.name(),
        "value": request.value,
    })))
}

#[utoipa::path(
    post,
    path = "/api/evolution/force",
    tag = "evolution",
    request_body = ForceEvolutionRequest,
    responses(
        (status = 202, description = "Evolution trigger queued"),
        (status = 400, body = ErrorResponse)
    )
)]
async fn force_evolution(
    State(state): State<ApiState>,
    Json(request): Json<ForceEvolutionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let severity = match request.severity.as_deref() {
        None => None,
        Some("low") => Some(Severity::Low),
        Some("medium") => Some(Severity::Medium),
        Some("high") => Some(Severity::High),
        Some("critical") => Some(Severity::Critical),
        Some(other) => {
            return Err(ApiError::bad_request(
                "INVALID_VALUE",
                format!("unknown severity '{other}'"),
            ));
        }
    };
    state.runtime.force_evolution(request.reason, severity);
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))))
}

#[utoipa::path(
    get,
    path = "/api/mutations",
    tag = "mutations",
    responses((status = 200, description = "All mutation attempts, newest first"))
)]
async fn list_mutations(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.runtime.store().list()))
}

#[utoipa::path(
    get,
    path = "/api/mutations/{id}/source",
    tag = "mutations",
    params(("id" = Uuid, Path, description = "Mutation id")),
    responses(
        (status = 200, description = "GeneScript source text"),
        (status = 404, body = ErrorResponse)
    )
)]
async fn get_mutation_source(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<String, ApiError> {
    state
        .runtime
        .store()
        .source(id)
        .ok_or_else(|| ApiError::not_found(format!("no mutation {id}")))
}

#[utoipa::path(
    get,
    path = "/api/entities",
    tag = "entities",
    responses((status = 200, description = "All entities in spawn order"))
)]
async fn list_entities(State(state): State<ApiState>) -> Json<Value> {
    let world = state.runtime.world();
    let world = world.lock().expect("world lock poisoned");
    Json(json!(world.entity_views()))
}

#[utoipa::path(
    get,
    path = "/api/entities/{id}",
    tag = "entities",
    params(("id" = Uuid, Path, description = "Entity id")),
    responses(
        (status = 200, description = "Entity detail"),
        (status = 404, body = ErrorResponse)
    )
)]
async fn get_entity(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let world = state.runtime.world();
    let world = world.lock().expect("world lock poisoned");
    world
        .entity_view(id)
        .map(|view| Json(json!(view)))
        .ok_or_else(|| ApiError::not_found(format!("no entity {id}")))
}

#[utoipa::path(
    delete,
    path = "/api/entities/{id}",
    tag = "entities",
    params(("id" = Uuid, Path, description = "Entity id")),
    responses(
        (status = 202, description = "Kill queued for the next tick"),
        (status = 404, body = ErrorResponse)
    )
)]
async fn kill_entity(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.runtime.kill_entity(id) {
        Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))))
    } else {
        Err(ApiError::not_found(format!("no entity {id}")))
    }
}

async fn ws_world(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| world_stream(socket, state))
}

/// Push binary world frames; client messages only signal liveness.
async fn world_stream(socket: WebSocket, state: ApiState) {
    let hub = state.runtime.hub();
    let mut session = hub.register();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            changed = session.frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let frame = session.frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    let payload = Bytes::from(frame.as_ref().clone());
                    if sink.send(Message::Binary(payload)).await.is_err() {
                        break;
                    }
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => {
                    if let Message::Text(text) = message {
                        if text.as_str() != "ping" {
                            debug!(text = %text.as_str(), "world stream client message");
                        }
                    }
                }
                _ => break,
            },
        }
    }
    hub.unregister(session.id);
}

async fn ws_agents(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| agent_stream(socket, state))
}

/// Push narration JSON lines.
async fn agent_stream(socket: WebSocket, state: ApiState) {
    let hub = state.runtime.hub();
    let mut session = hub.register();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            line = session.feed.recv() => {
                let Some(line) = line else { break };
                if sink.send(Message::Text(line.as_ref().clone().into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
    hub.unregister(session.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use genesis_core::GenesisConfig;
    use genesis_runtime::RuntimeConfig;
    use tower::util::ServiceExt;

    fn test_router() -> (Router, Arc<GenesisRuntime>) {
        let runtime = Arc::new(
            GenesisRuntime::new(RuntimeConfig {
                world: GenesisConfig {
                    world_width: 300.0,
                    world_height: 300.0,
                    min_population: 3,
                    max_entities: 30,
                    rng_seed: Some(1),
                    ..GenesisConfig::default()
                },
                ..RuntimeConfig::default()
            })
            .expect("runtime"),
        );
        (router(runtime.clone()), runtime)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn world_endpoint_reports_population_and_params() {
        let (router, _runtime) = test_router();
        let response = router
            .oneshot(Request::get("/api/world").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["entity_count"], 3);
        assert_eq!(json["params"]["min_population"], 3);
    }

    #[tokio::test]
    async fn param_updates_validate_and_reject_unknown_names() {
        let (router, _runtime) = test_router();
        let ok = router
            .clone()
            .oneshot(
                Request::patch("/api/params")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"spawn_rate","value":1.25}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(ok.status(), StatusCode::OK);

        let bad = router
            .oneshot(
                Request::patch("/api/params")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"gravity","value":1}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let json = body_json(bad).await;
        assert_eq!(json["code"], "UNKNOWN_PARAM");
    }

    #[tokio::test]
    async fn force_evolution_validates_severity() {
        let (router, runtime) = test_router();
        let mut force_rx = runtime.bus().subscribe_force();

        let accepted = router
            .clone()
            .oneshot(
                Request::post("/api/evolution/force")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"reason":"testing","severity":"critical"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);
        let event = force_rx.try_recv().expect("force event");
        assert_eq!(event.severity, Some(Severity::Critical));

        let rejected = router
            .oneshot(
                Request::post("/api/evolution/force")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"severity":"apocalyptic"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mutation_source_returns_404_for_unknown_ids() {
        let (router, _runtime) = test_router();
        let response = router
            .oneshot(
                Request::get(format!("/api/mutations/{}/source", Uuid::new_v4()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn entity_inspection_and_kill_round_trip() {
        let (router, runtime) = test_router();
        let id = {
            let world = runtime.world();
            let world = world.lock().expect("world");
            world.entity_views()[0].id
        };

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/api/entities/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "alive");

        let response = router
            .clone()
            .oneshot(
                Request::delete(format!("/api/entities/{id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = router
            .oneshot(
                Request::delete(format!("/api/entities/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
