use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};

use crate::commands::{load_config, CommandResult};

/// Config keys with the environment variable that overrides each.
const FIELDS: [(&str, &str); 13] = [
    ("database.url", "WARDEN_DATABASE_URL"),
    ("database.max_connections", "WARDEN_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "WARDEN_DATABASE_TIMEOUT_SECS"),
    ("classifier.endpoint", "WARDEN_CLASSIFIER_ENDPOINT"),
    ("classifier.model", "WARDEN_CLASSIFIER_MODEL"),
    ("classifier.api_key", "WARDEN_CLASSIFIER_API_KEY"),
    ("classifier.timeout_secs", "WARDEN_CLASSIFIER_TIMEOUT_SECS"),
    ("classifier.max_retries", "WARDEN_CLASSIFIER_MAX_RETRIES"),
    ("poller.polling_interval_minutes", "WARDEN_POLLER_POLLING_INTERVAL_MINUTES"),
    ("poller.shutdown_grace_secs", "WARDEN_POLLER_SHUTDOWN_GRACE_SECS"),
    ("server.bind_address", "WARDEN_SERVER_BIND_ADDRESS"),
    ("server.health_check_port", "WARDEN_SERVER_HEALTH_CHECK_PORT"),
    ("logging.level", "WARDEN_LOGGING_LEVEL"),
];

pub fn run() -> CommandResult {
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => return CommandResult::from_failure("config", failure),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut sources = Map::new();
    for (key_path, env_key) in FIELDS {
        let source =
            field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        sources.insert(key_path.to_string(), Value::String(source));
    }
    let format_source = if env::var_os("WARDEN_LOGGING_FORMAT").is_some() {
        "env (WARDEN_LOGGING_FORMAT)".to_string()
    } else {
        field_source(
            "logging.format",
            "WARDEN_LOG_FORMAT",
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        )
    };
    sources.insert("logging.format".to_string(), Value::String(format_source));

    CommandResult::success_with(
        "config",
        "effective config (source precedence: env > file > default)",
        json!({ "effective": config.redacted(), "sources": sources }),
    )
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("warden.toml"), PathBuf::from("config/warden.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<toml::Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<toml::Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&toml::Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &toml::Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn contains_path_walks_nested_tables() {
        let doc: toml::Value =
            "[classifier]\nendpoint = \"http://localhost:8000\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "classifier.endpoint"));
        assert!(!contains_path(&doc, "classifier.model"));
        assert!(!contains_path(&doc, "database.url"));
    }
}
