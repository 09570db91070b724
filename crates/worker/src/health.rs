use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};
use warden_db::{ping, DbPool};

use crate::classifier::Classifier;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    classifier: Arc<dyn Classifier>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, classifier: Arc<dyn Classifier>) -> Self {
        Self { db_pool, classifier }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub classifier: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "worker.health.start",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "worker.health.error",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let classifier = classifier_check(state.classifier.as_ref()).await;
    let ready = database.status == "ready" && classifier.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "warden-worker poller initialized".to_string(),
        },
        database,
        classifier,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

async fn classifier_check(classifier: &dyn Classifier) -> HealthCheck {
    if classifier.health_check().await {
        HealthCheck { status: "ready", detail: "classifier endpoint reachable".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: "classifier endpoint unreachable".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::{extract::State, Json};
    use tower::ServiceExt;
    use warden_core::analysis::ClassificationContext;
    use warden_core::Classification;
    use warden_db::connect_with_settings;

    use crate::classifier::{Classifier, ClassifierError};
    use crate::health::{health, router, HealthState};

    struct StaticProbe(bool);

    #[async_trait]
    impl Classifier for StaticProbe {
        async fn classify(
            &self,
            _context: &ClassificationContext,
        ) -> Result<Classification, ClassifierError> {
            Err(ClassifierError::Status(501))
        }

        async fn health_check(&self) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn health_returns_ready_when_dependencies_are_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) =
            health(State(HealthState::new(pool.clone(), Arc::new(StaticProbe(true))))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.classifier.status, "ready");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_degrades_when_classifier_is_unreachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) =
            health(State(HealthState::new(pool.clone(), Arc::new(StaticProbe(false))))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.classifier.status, "degraded");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_degrades_when_database_is_closed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) =
            health(State(HealthState::new(pool, Arc::new(StaticProbe(true))))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.database.status, "degraded");
    }

    #[tokio::test]
    async fn router_serves_health_route() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        let app = router(HealthState::new(pool.clone(), Arc::new(StaticProbe(true))));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        pool.close().await;
    }
}
