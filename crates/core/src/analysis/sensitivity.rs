use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityFlag {
    CredentialsPossible,
    FilePathPossible,
    NetworkTargetPossible,
}

impl SensitivityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialsPossible => "credentials_possible",
            Self::FilePathPossible => "file_path_possible",
            Self::NetworkTargetPossible => "network_target_possible",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Database,
    Filesystem,
    Network,
    Computation,
    Execution,
    General,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Computation => "computation",
            Self::Execution => "execution",
            Self::General => "general",
        }
    }
}

/// Strategy that guesses what kind of data a tool call touches.
pub trait SensitivityClassifier: Send + Sync {
    fn flags(&self, tool_name: &str, params: Option<&Value>) -> BTreeSet<SensitivityFlag>;
    fn category(&self, tool_name: &str) -> ToolCategory;
}

struct KeywordRule<T> {
    target: T,
    keywords: &'static [&'static str],
}

const NAME_RULES: [KeywordRule<SensitivityFlag>; 3] = [
    KeywordRule {
        target: SensitivityFlag::CredentialsPossible,
        keywords: &["cred", "password", "token", "key", "secret"],
    },
    KeywordRule {
        target: SensitivityFlag::FilePathPossible,
        keywords: &["file", "path", "read", "write", "disk"],
    },
    KeywordRule {
        target: SensitivityFlag::NetworkTargetPossible,
        keywords: &["http", "request", "network", "socket", "api"],
    },
];

const PARAM_RULES: [KeywordRule<SensitivityFlag>; 3] = [
    KeywordRule {
        target: SensitivityFlag::CredentialsPossible,
        keywords: &["password", "token", "secret", "credential", "apikey", "api_key"],
    },
    KeywordRule {
        target: SensitivityFlag::FilePathPossible,
        keywords: &["path", "file", "directory"],
    },
    KeywordRule {
        target: SensitivityFlag::NetworkTargetPossible,
        keywords: &["http://", "https://", "url", "host"],
    },
];

/// Tools whose arguments usually carry connection secrets.
const CREDENTIAL_BEARING_TOOLS: &[&str] = &["database", "config", "auth", "login", "connection"];

// First match wins.
const CATEGORY_RULES: [KeywordRule<ToolCategory>; 5] = [
    KeywordRule { target: ToolCategory::Database, keywords: &["sql", "database", "query", "db"] },
    KeywordRule {
        target: ToolCategory::Filesystem,
        keywords: &["file", "disk", "read", "write", "path"],
    },
    KeywordRule {
        target: ToolCategory::Network,
        keywords: &["http", "request", "api", "fetch", "post", "get"],
    },
    KeywordRule {
        target: ToolCategory::Computation,
        keywords: &["calc", "math", "compute", "eval"],
    },
    KeywordRule {
        target: ToolCategory::Execution,
        keywords: &["exec", "shell", "cmd", "command", "process"],
    },
];

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| haystack.contains(keyword))
}

/// Whether a call carried any arguments worth inspecting.
pub fn params_provided(params: Option<&Value>) -> bool {
    match params {
        None | Some(Value::Null) => false,
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

/// Substring heuristic over tool names and stringified parameters.
///
/// Matches are hints, not classifications: a tool named "Keyboard layout"
/// raises the credentials flag.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeywordSensitivityClassifier;

impl SensitivityClassifier for KeywordSensitivityClassifier {
    fn flags(&self, tool_name: &str, params: Option<&Value>) -> BTreeSet<SensitivityFlag> {
        let name = tool_name.to_lowercase();
        let mut flags: BTreeSet<SensitivityFlag> = NAME_RULES
            .iter()
            .filter(|rule| contains_any(&name, rule.keywords))
            .map(|rule| rule.target)
            .collect();

        if params_provided(params) {
            if contains_any(&name, CREDENTIAL_BEARING_TOOLS) {
                flags.insert(SensitivityFlag::CredentialsPossible);
            }
            let rendered = params.map(Value::to_string).unwrap_or_default().to_lowercase();
            flags.extend(
                PARAM_RULES
                    .iter()
                    .filter(|rule| contains_any(&rendered, rule.keywords))
                    .map(|rule| rule.target),
            );
        }

        flags
    }

    fn category(&self, tool_name: &str) -> ToolCategory {
        let name = tool_name.to_lowercase();
        CATEGORY_RULES
            .iter()
            .find(|rule| contains_any(&name, rule.keywords))
            .map(|rule| rule.target)
            .unwrap_or(ToolCategory::General)
    }
}
