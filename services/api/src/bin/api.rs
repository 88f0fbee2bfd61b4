//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{FileCacheStore, MirroredAccessLog, MirroredUserRegistry, PgDocumentStore},
    config::{Config, ConfigError},
    error::ApiError,
    web::{
        delete_application_handler, get_application_handler, list_applications_handler,
        lookup_handler, pending_writes_handler, request_corrections_handler, require_reviewer,
        resubmit_handler, rest::ApiDoc, retry_write_handler, set_status_handler,
        state::AppState, submit_application_handler, track_handler, tracking_handler,
        update_fields_handler, verify_field_handler,
    },
};
use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderName, HeaderValue, Method,
};
use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{delete, get, patch, post},
    Router,
};
use classroom_core::memory::InMemoryRemote;
use classroom_core::{
    ApplicationLifecycleManager, MirrorSynchronizer, RemoteDocumentStore, RetryPolicy,
    SubmissionValidator, SyncEvent, ValidationPolicy,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Open the Local Cache ---
    let cache = Arc::new(FileCacheStore::open(&config.cache_dir)?);

    // --- 3. Connect to the Remote Store & Run Migrations ---
    let remote: Arc<dyn RemoteDocumentStore> = match config.database_url.as_deref() {
        Some(url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = PgDocumentStore::new(db_pool);
            info!("Running database migrations...");
            store.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL is not set; mirroring to an in-memory remote that is lost on exit.");
            Arc::new(InMemoryRemote::new())
        }
    };

    // --- 4. Start the Mirror ---
    let retry = RetryPolicy {
        base: config.sync_retry_base,
        max: config.sync_retry_max,
    };
    let mirror = Arc::new(MirrorSynchronizer::new(cache, remote, retry));
    match mirror.bootstrap().await {
        Ok(report) => info!(
            seeded = report.seeded_remote,
            pushed = report.pushed_records,
            reconciled = report.reconciled.len(),
            "Mirror ready."
        ),
        Err(e) => warn!(
            error = %e,
            "Remote store unreachable at startup; serving from the local cache until the mirror bootstrap succeeds."
        ),
    }

    let shutdown = CancellationToken::new();
    let mut background = vec![mirror.spawn_listeners(&shutdown)];
    background.push(tokio::spawn(mirror.clone().run_writer(shutdown.child_token())));
    background.push(tokio::spawn(log_sync_events(
        mirror.subscribe_events(),
        shutdown.child_token(),
    )));

    // --- 5. Build the Shared AppState ---
    let manager = Arc::new(ApplicationLifecycleManager::new(
        mirror.clone(),
        Arc::new(MirroredUserRegistry::new(mirror.clone())),
        Arc::new(MirroredAccessLog::new(mirror.clone())),
    ));
    let validator = SubmissionValidator::new(ValidationPolicy {
        email_domain: config.university_email_domain.clone(),
    })
    .map_err(|e| ApiError::Internal(format!("Invalid validation pattern: {}", e)))?;

    let app_state = Arc::new(AppState {
        manager,
        mirror: mirror.clone(),
        validator: Arc::new(validator),
        config: config.clone(),
        shutdown: shutdown.clone(),
    });

    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|e| {
        ConfigError::InvalidValue("CORS_ORIGIN".to_string(), e.to_string())
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static("x-reviewer-id"),
        ]);

    // --- 6. Create the Web Router ---
    // Applicant routes (no auth required)
    let public_routes = Router::new()
        .route("/applications", post(submit_application_handler))
        .route("/applications/lookup", post(lookup_handler))
        .route("/applications/{id}/tracking", get(tracking_handler))
        .route("/applications/{id}/track", get(track_handler))
        .route("/applications/{id}/fields", patch(update_fields_handler))
        .route("/applications/{id}/resubmit", post(resubmit_handler));

    // Reviewer routes (reviewer identity required)
    let admin_routes = Router::new()
        .route("/admin/applications", get(list_applications_handler))
        .route(
            "/admin/applications/{id}",
            get(get_application_handler).delete(delete_application_handler),
        )
        .route("/admin/applications/{id}/verifications", post(verify_field_handler))
        .route("/admin/applications/{id}/corrections", post(request_corrections_handler))
        .route("/admin/applications/{id}/status", post(set_status_handler))
        .route("/admin/sync/pending", get(pending_writes_handler))
        .route("/admin/sync/retry/{collection}/{id}", post(retry_write_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_reviewer,
        ));

    // Combine API routes
    let api_router = Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // --- 8. Drain Background Work ---
    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    let flushed = mirror.flush().await;
    info!(
        flushed,
        remaining = mirror.pending().len(),
        "Final sync flush complete. Server stopped."
    );

    Ok(())
}

/// Resolves on Ctrl-C and cancels every connection and background task.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for the shutdown signal: {:?}", e);
        return;
    }
    info!("Shutdown signal received.");
    shutdown.cancel();
}

/// Logs mirror events. Failed application writes are called out because the
/// admin can retry them by hand.
async fn log_sync_events(mut events: broadcast::Receiver<SyncEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(SyncEvent::WriteFailed {
                collection,
                id,
                attempts,
                error,
                retryable: true,
            }) => warn!(
                collection = %collection,
                id = id.as_deref().unwrap_or_default(),
                attempts,
                error = %error,
                "Application sync failed; retry via POST /admin/sync/retry/{{collection}}/{{id}}"
            ),
            Ok(SyncEvent::WriteFailed { .. }) => {}
            Ok(SyncEvent::WriteAcknowledged { collection, id, version }) => {
                debug!(collection = %collection, id = ?id, version, "Write synced")
            }
            Ok(SyncEvent::SnapshotApplied { collection, records }) => {
                debug!(collection = %collection, records, "Remote snapshot applied")
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Sync event log fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}
