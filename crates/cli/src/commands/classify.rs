use std::sync::Arc;

use warden_core::ApplicationError;
use warden_worker::{ClassificationPoller, Classifier, ThreatClassifier};

use crate::commands::{
    application_failure, load_config, open_event_log, runtime, CommandResult, EXIT_CONFIG,
    EXIT_RUNTIME,
};

/// Runs exactly one poll cycle against the configured classifier.
pub fn run() -> CommandResult {
    let result = load_config().and_then(|config| {
        let classifier: Arc<dyn Classifier> = Arc::new(
            ThreatClassifier::new(&config.classifier)
                .map_err(|error| ("classifier_config", error.to_string(), EXIT_CONFIG))?,
        );
        runtime()?.block_on(async {
            let (pool, event_log) = open_event_log(&config).await?;
            let mut poller = ClassificationPoller::new(
                event_log,
                classifier,
                config.poller.polling_interval_minutes,
            );
            let polled = poller.poll_once().await;
            pool.close().await;
            polled.map_err(|error| {
                application_failure(ApplicationError::Integration(error.to_string()), EXIT_RUNTIME)
            })
        })
    });

    match result {
        Ok(stats) => {
            let message = format!(
                "classified {} of {} finished sessions",
                stats.sessions_classified, stats.sessions_found
            );
            match serde_json::to_value(stats) {
                Ok(data) => CommandResult::success_with("classify", message, data),
                Err(error) => {
                    CommandResult::failure("classify", "serialization", error.to_string(), EXIT_RUNTIME)
                }
            }
        }
        Err(failure) => CommandResult::from_failure("classify", failure),
    }
}
