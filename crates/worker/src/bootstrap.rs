use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};
use warden_core::config::{AppConfig, ConfigError, LoadOptions};
use warden_core::EventLog;
use warden_db::{connect_with_config, migrations, sql_event_log, DbPool};

use crate::classifier::{Classifier, ClassifierError, ThreatClassifier};

pub struct Worker {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub event_log: EventLog,
    pub classifier: Arc<ThreatClassifier>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("classifier at `{0}` is unreachable")]
    ClassifierUnreachable(String),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Worker, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Opens the pool, applies migrations and probes the classifier.
///
/// An unreachable classifier is fatal here and nowhere else.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Worker, BootstrapError> {
    info!(event_name = "worker.bootstrap.start", "starting worker bootstrap");

    let db_pool = connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "worker.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "worker.bootstrap.migrations_applied", "database migrations applied");

    let classifier = Arc::new(ThreatClassifier::new(&config.classifier)?);
    if !classifier.health_check().await {
        error!(
            event_name = "worker.bootstrap.classifier_unreachable",
            endpoint = %classifier.endpoint(),
            "classifier health check failed"
        );
        db_pool.close().await;
        return Err(BootstrapError::ClassifierUnreachable(classifier.endpoint().to_string()));
    }
    info!(
        event_name = "worker.bootstrap.classifier_ready",
        endpoint = %classifier.endpoint(),
        "classifier reachable"
    );

    let event_log = sql_event_log(&db_pool);
    Ok(Worker { config, db_pool, event_log, classifier })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use warden_core::config::{AppConfig, ConfigOverrides, LoadOptions};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::bootstrap::{bootstrap, bootstrap_with_config, BootstrapError};

    fn config_for(endpoint: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.database.max_connections = 1;
        config.classifier.endpoint = endpoint.to_string();
        config
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_invalid_classifier_endpoint() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                classifier_endpoint: Some("ftp://classifier".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("classifier.endpoint"), "message was `{message}`");
    }

    #[tokio::test]
    async fn unreachable_classifier_aborts_bootstrap() {
        let result = bootstrap_with_config(config_for("http://127.0.0.1:9")).await;

        assert!(matches!(result, Err(BootstrapError::ClassifierUnreachable(_))));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_exposes_event_log() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .mount(&server)
            .await;

        let worker = bootstrap_with_config(config_for(&server.uri())).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('agent_session', 'event_log')",
        )
        .fetch_one(&worker.db_pool)
        .await
        .expect("schema lookup");
        assert_eq!(table_count, 2);
        assert_eq!(worker.event_log.get_log_count(None, None).await.expect("count"), 0);

        worker.db_pool.close().await;
    }
}
