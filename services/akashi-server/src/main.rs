use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use akashi_server::config::Config;
use akashi_server::handlers;
use akashi_server::middleware::{
    AuthMiddleware, RateLimitLayer, RateRule, Recovery, RequestIdMiddleware, RequestMetrics,
    SecurityHeaders,
};
use akashi_server::services::api_keys::{self, ApiKeyVerifier};
use akashi_server::services::broker::NotificationBroker;
use akashi_server::services::buffer::{EventBuffer, PgEventSink};
use akashi_server::services::decisions::DecisionService;
use akashi_server::services::embedder::{Embedder, HttpEmbedder, NoopEmbedder};
use akashi_server::services::idempotency::IdempotencyController;
use akashi_server::services::jwt::JwtManager;
use akashi_server::services::scorer::{ConflictScorer, ScorerConfig};
use akashi_server::services::validator::{
    NoopValidator, OllamaValidator, OpenAiValidator, Validator,
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    info!("Starting akashi-server on {}:{}", config.host, config.port);

    let pool = akashi_database::create_pool(&config.database_url).await?;

    let verifier = web::Data::new(ApiKeyVerifier::new());
    ensure_seed_admin(&pool, &verifier, &config).await?;

    let jwt = web::Data::new(JwtManager::from_key_paths(
        config.jwt_private_key_path.as_deref(),
        config.jwt_public_key_path.as_deref(),
        config.token_ttl_seconds,
        config.scoped_token_max_ttl_seconds,
    )?);

    let validator: Arc<dyn Validator> = match config.validator_provider.as_str() {
        "ollama" => Arc::new(OllamaValidator::new(
            config.validator_url.clone(),
            config.validator_model.clone(),
        )),
        "openai" => Arc::new(OpenAiValidator::new(
            config.validator_url.clone(),
            config.validator_model.clone(),
            config.validator_api_key.clone().unwrap_or_default(),
        )),
        _ => Arc::new(NoopValidator),
    };
    let embedder: Arc<dyn Embedder> = match config.embedder_provider.as_str() {
        "http" => Arc::new(HttpEmbedder::new(
            config.embedder_url.clone(),
            config.embedder_model.clone(),
        )),
        _ => Arc::new(NoopEmbedder),
    };

    let scorer = Arc::new(ConflictScorer::new(
        pool.clone(),
        validator,
        ScorerConfig {
            topic_floor: config.topic_similarity_floor,
            significance_threshold: config.significance_threshold,
            decay_half_life_hours: config.temporal_decay_half_life_hours,
            candidate_window: config.scorer_candidate_window,
        },
    ));
    let decisions = web::Data::new(DecisionService::new(pool.clone(), embedder, scorer));

    let idempotency = web::Data::new(IdempotencyController::new(
        pool.clone(),
        config.idempotency_ttl_seconds,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let buffer = web::Data::new(EventBuffer::new(
        config.buffer_capacity,
        config.buffer_high_water,
    ));
    let flusher = buffer.spawn_flusher(
        Arc::new(PgEventSink::new(pool.clone())),
        Duration::from_millis(config.buffer_flush_interval_ms),
        shutdown_rx.clone(),
    );

    let broker = web::Data::new(NotificationBroker::new());
    let broker_task = {
        let broker = broker.clone();
        let database_url = config.database_url.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { broker.run(database_url, shutdown_rx).await })
    };

    let rate_limiter = RateLimitLayer::new(
        vec![
            RateRule {
                prefix: "/auth".to_string(),
                per_second: config.rate_limit_auth_per_sec,
                burst: config.rate_limit_auth_burst,
            },
            RateRule {
                prefix: "/v1/runs".to_string(),
                per_second: config.rate_limit_ingest_per_sec,
                burst: config.rate_limit_ingest_burst,
            },
            RateRule {
                prefix: "/v1/trace".to_string(),
                per_second: config.rate_limit_ingest_per_sec,
                burst: config.rate_limit_ingest_burst,
            },
            RateRule {
                prefix: "/v1/search".to_string(),
                per_second: config.rate_limit_search_per_sec,
                burst: config.rate_limit_search_burst,
            },
            RateRule {
                prefix: "/v1/query".to_string(),
                per_second: config.rate_limit_query_per_sec,
                burst: config.rate_limit_query_burst,
            },
        ],
        jwt.clone().into_inner(),
    );

    let server_config = web::Data::new(config.clone());
    let pool_data = web::Data::new(pool.clone());
    let request_timeout = Duration::from_millis(config.client_request_timeout_ms);
    let bind_addr = (config.host.clone(), config.port);

    let buffer_for_drain = buffer.clone();
    let server = HttpServer::new(move || {
        let cors = build_cors(&config);
        // Middleware runs outermost-last-registered: request id wraps the
        // whole chain, then security headers, CORS, metrics, tracing,
        // recovery, rate limiting, and auth closest to the handlers.
        App::new()
            .app_data(pool_data.clone())
            .app_data(server_config.clone())
            .app_data(jwt.clone())
            .app_data(verifier.clone())
            .app_data(decisions.clone())
            .app_data(idempotency.clone())
            .app_data(buffer.clone())
            .app_data(broker.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(config.max_body_bytes)
                    .error_handler(handlers::json_error_handler),
            )
            .wrap(AuthMiddleware::new(
                jwt.clone().into_inner(),
                verifier.clone().into_inner(),
                pool_data.get_ref().clone(),
            ))
            .wrap(rate_limiter.clone())
            .wrap(Recovery)
            .wrap(tracing_actix_web::TracingLogger::default())
            .wrap(RequestMetrics)
            .wrap(cors)
            .wrap(SecurityHeaders)
            .wrap(RequestIdMiddleware)
            .configure(handlers::configure)
            .default_service(web::route().to(handlers::not_found))
    })
    .client_request_timeout(request_timeout)
    .bind(bind_addr)?
    .run();

    let result = server.await;

    // Drain: refuse new appends, flush the backlog, stop the workers.
    info!("server stopped; draining event buffer");
    let _ = shutdown_tx.send(true);
    if !buffer_for_drain.drain(Duration::from_secs(10)).await {
        warn!("event buffer did not fully drain before shutdown deadline");
    }
    let _ = flusher.await;
    let _ = broker_task.await;

    result?;
    Ok(())
}

fn build_cors(config: &Config) -> Cors {
    match config.cors_origins.as_deref() {
        Some(origins) if !origins.trim().is_empty() => {
            let mut cors = Cors::default()
                .allowed_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
                .allow_any_header()
                .max_age(3600);
            for origin in origins.split(',') {
                cors = cors.allowed_origin(origin.trim());
            }
            cors
        }
        _ => Cors::permissive(),
    }
}

/// Seed the zero-org "admin" agent so fresh deployments can authenticate.
/// The key comes from config, or is generated and logged once.
async fn ensure_seed_admin(
    pool: &PgPool,
    verifier: &ApiKeyVerifier,
    config: &Config,
) -> anyhow::Result<()> {
    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT id FROM agents WHERE org_id = $1 AND agent_id = $2")
            .bind(Uuid::nil())
            .bind(handlers::agents::SEED_ADMIN)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Ok(());
    }

    let (secret, generated) = match &config.bootstrap_admin_key {
        Some(key) => (key.clone(), false),
        None => (api_keys::generate_secret(), true),
    };
    let hash = verifier
        .hash_secret(&secret)
        .map_err(|e| anyhow::anyhow!("failed to hash bootstrap key: {}", e))?;

    sqlx::query(
        r#"
        INSERT INTO agents (id, org_id, agent_id, role, api_key_hash, tags, metadata, created_at)
        VALUES (gen_random_uuid(), $1, $2, 'platform_admin', $3, '{}', '{}'::jsonb, NOW())
        ON CONFLICT (org_id, agent_id) DO NOTHING
        "#,
    )
    .bind(Uuid::nil())
    .bind(handlers::agents::SEED_ADMIN)
    .bind(&hash)
    .execute(pool)
    .await?;

    if generated {
        warn!(
            "seed admin created with generated credential 'admin:{}'; store it now, it will not be shown again",
            secret
        );
    } else {
        info!("seed admin created from configured bootstrap key");
    }
    Ok(())
}
