use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use synapse::config::SynapseConfig;
use synapse::dlq::{DeadLetterQueue, DeadLetterReason, DlqFilter, RedisDlqStore};
use synapse::lag::CdcLagTracker;
use synapse::outbox::RedisOutbox;
use synapse::shutdown::ShutdownSignal;
use synapse::synapse::{ReplayError, SynapseEngine};

#[derive(Clone)]
struct AppState {
    engine: Arc<SynapseEngine>,
    redis_pool: Pool,
    api_key: String,
}

#[tokio::main]
async fn main() {
    // 1. Initialize Logging
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    // 2. Load Configuration
    let config = SynapseConfig::load().expect("Failed to load configuration");

    let api_key = config.server.api_key.clone().unwrap_or_else(|| {
        warn!("server.api_key not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
        "dev-key".to_string()
    });

    // 3. Setup Redis Pool
    let cfg = Config::from_url(config.redis.url.clone());
    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .expect("Failed to create Redis pool");

    // 4. Build the Engine
    let shutdown = ShutdownSignal::with_drain_grace(config.engine.drain_grace());

    let outbox = Arc::new(RedisOutbox::new(pool.clone()));
    let dlq = DeadLetterQueue::new(Arc::new(RedisDlqStore::new(pool.clone())));

    let mut engine = SynapseEngine::new(
        outbox,
        dlq,
        config.engine.options(),
        shutdown.clone(),
    )
    .with_lag_tracker(CdcLagTracker::with_degraded_threshold(
        config.engine.lag_degraded_p95(),
    ));

    for name in config.target_names() {
        let target = &config.targets[name];
        let adapter = target
            .build_adapter(name, &pool)
            .expect("Failed to build target adapter");
        engine.add_target(
            adapter,
            target.breaker_config(),
            target.retry_config(),
            target.per_attempt_timeout(),
        );
        info!(target = %name, kind = %target.kind, "Target registered");
    }

    let engine = Arc::new(engine);

    let instance = format!(
        "{}-{}",
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "synapse".to_string()),
        &uuid::Uuid::new_v4().to_string()[..8]
    );
    info!(instance = %instance, "Starting Synapse engine");

    // 5. Run the Engine
    // Subscribe before the signal listener spawns: a broadcast only reaches
    // receivers that already exist when it fires.
    let mut server_shutdown = shutdown.subscribe();
    let engine_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    // 6. Listen for termination signals
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.listen_for_signals().await });
    }

    // 7. Build the Admin Router with Auth Middleware
    let app_state = Arc::new(AppState {
        engine,
        redis_pool: pool,
        api_key,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/dlq", get(list_dlq))
        .route("/dlq/:id", get(get_dlq_entry).delete(purge_dlq_entry))
        .route("/dlq/:id/replay", post(replay_dlq_entry))
        .layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth_middleware,
        ))
        .with_state(app_state);

    // 8. Start the Admin Server
    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port)
        .parse()
        .expect("Invalid address");

    info!("Synapse admin server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind admin server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.recv().await;
        })
        .await
        .expect("Admin server failed");

    // 9. Wait for the engine to drain
    match engine_handle.await {
        Ok(Ok(())) => info!("Engine drained cleanly"),
        Ok(Err(e)) => error!(error = %e, "Engine stopped with error"),
        Err(e) => error!(error = %e, "Engine task panicked"),
    }
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header {
        Some(auth_header) if auth_header.starts_with("Bearer ") => {
            let token = &auth_header[7..];
            if token == state.api_key {
                Ok(next.run(req).await)
            } else {
                warn!("Invalid API Key attempt");
                Err(StatusCode::UNAUTHORIZED)
            }
        }
        _ => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    // Simple PING to check Redis connectivity
    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "status": "ok",
        "redis": "connected",
        "engine": state.engine.state().as_str(),
    })))
}

/// Get metrics endpoint - counters, lag percentiles and breaker states.
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.engine.metrics().snapshot();
    let lag = state.engine.lag().snapshot();
    let breakers: Vec<Value> = state
        .engine
        .breaker_states()
        .into_iter()
        .map(|(target, s)| json!({ "target": target, "state": s }))
        .collect();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "engineState": state.engine.state(),
        "engine": snapshot,
        "lag": lag,
        "breakers": breakers,
    }))
}

#[derive(Debug, Deserialize)]
struct DlqQuery {
    target: Option<String>,
    entity_id: Option<String>,
    reason: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

fn parse_reason(reason: &str) -> Option<DeadLetterReason> {
    match reason {
        "RETRY_EXHAUSTED" => Some(DeadLetterReason::RetryExhausted),
        "CIRCUIT_OPEN_TIMEOUT" => Some(DeadLetterReason::CircuitOpenTimeout),
        "VALIDATION_REJECTED" => Some(DeadLetterReason::ValidationRejected),
        "ORDER_HELD" => Some(DeadLetterReason::OrderHeld),
        _ => None,
    }
}

async fn list_dlq(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<Value>, StatusCode> {
    let reason = match query.reason.as_deref() {
        Some(r) => Some(parse_reason(r).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };

    let filter = DlqFilter {
        target: query.target,
        entity_id: query.entity_id,
        reason,
        limit: query.limit,
        offset: query.offset,
    };

    let entries = state.engine.dlq().list(&filter).await.map_err(|e| {
        error!(error = %e, "DLQ list failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "count": entries.len(),
        "entries": entries,
    })))
}

async fn get_dlq_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let entry = state.engine.dlq().entry(&id).await.map_err(|e| {
        error!(error = %e, "DLQ fetch failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    match entry {
        Some(entry) => Ok(Json(json!(entry))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn replay_dlq_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.replay(&id).await {
        Ok(result) => Ok(Json(json!({
            "status": "applied",
            "result": result,
        }))),
        Err(ReplayError::NotFound(id)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("DLQ entry not found: {}", id) })),
        )),
        Err(e @ ReplayError::OutOfOrder { .. }) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        )),
        Err(e @ ReplayError::UnknownTarget(_)) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        )),
        Err(e @ ReplayError::Failed { .. }) => Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        )),
        Err(ReplayError::Dlq(e)) => {
            error!(error = %e, "Replay bookkeeping failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "DLQ storage error" })),
            ))
        }
    }
}

async fn purge_dlq_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let removed = state.engine.dlq().purge(&id).await.map_err(|e| {
        error!(error = %e, "DLQ purge failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if removed {
        Ok(Json(json!({ "status": "purged", "id": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
