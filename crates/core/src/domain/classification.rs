use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const DEFAULT_CONFIDENCE: f64 = 0.5;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ClassificationError {
    #[error("classification response is not a JSON object")]
    NotAnObject,
    #[error("classification response is missing `{0}`")]
    MissingField(&'static str),
    #[error("invalid risk_level `{0}` (expected low|medium|high|critical)")]
    InvalidRiskLevel(String),
    #[error("invalid intent `{0}` (expected benign|ambiguous|malicious)")]
    InvalidIntent(String),
    #[error("invalid confidence `{0}` (expected a number in 0.0..=1.0)")]
    InvalidConfidence(String),
    #[error("classification explanation must not be empty")]
    EmptyExplanation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = ClassificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(ClassificationError::InvalidRiskLevel(value.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Benign,
    Ambiguous,
    Malicious,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Benign => "benign",
            Self::Ambiguous => "ambiguous",
            Self::Malicious => "malicious",
        }
    }
}

impl FromStr for Intent {
    type Err = ClassificationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "benign" => Ok(Self::Benign),
            "ambiguous" => Ok(Self::Ambiguous),
            "malicious" => Ok(Self::Malicious),
            _ => Err(ClassificationError::InvalidIntent(value.to_owned())),
        }
    }
}

/// A validated risk/intent verdict for one finished session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub risk_level: RiskLevel,
    pub intent: Intent,
    pub confidence: f64,
    pub explanation: String,
}

impl Classification {
    pub fn new(
        risk_level: RiskLevel,
        intent: Intent,
        confidence: f64,
        explanation: impl Into<String>,
    ) -> Result<Self, ClassificationError> {
        let explanation = explanation.into();
        validate_confidence(confidence)?;
        if explanation.trim().is_empty() {
            return Err(ClassificationError::EmptyExplanation);
        }
        Ok(Self { risk_level, intent, confidence, explanation })
    }

    /// Strictly validates a decoded classifier response.
    ///
    /// Enumerations are matched case-insensitively. A missing confidence
    /// defaults to 0.5; numeric strings are accepted.
    pub fn from_value(value: &Value) -> Result<Self, ClassificationError> {
        let object = value.as_object().ok_or(ClassificationError::NotAnObject)?;

        let risk_level = object
            .get("risk_level")
            .and_then(Value::as_str)
            .ok_or(ClassificationError::MissingField("risk_level"))?
            .parse::<RiskLevel>()?;
        let intent = object
            .get("intent")
            .and_then(Value::as_str)
            .ok_or(ClassificationError::MissingField("intent"))?
            .parse::<Intent>()?;
        let confidence = match object.get("confidence") {
            None | Some(Value::Null) => DEFAULT_CONFIDENCE,
            Some(Value::Number(number)) => number
                .as_f64()
                .ok_or_else(|| ClassificationError::InvalidConfidence(number.to_string()))?,
            Some(Value::String(raw)) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| ClassificationError::InvalidConfidence(raw.clone()))?,
            Some(other) => return Err(ClassificationError::InvalidConfidence(other.to_string())),
        };
        let explanation = object
            .get("explanation")
            .and_then(Value::as_str)
            .ok_or(ClassificationError::MissingField("explanation"))?;

        Self::new(risk_level, intent, confidence, explanation.trim())
    }
}

fn validate_confidence(confidence: f64) -> Result<(), ClassificationError> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ClassificationError::InvalidConfidence(confidence.to_string()))
    }
}

/// Time span an aggregation covered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Classification, ClassificationError, Intent, RiskLevel};

    #[test]
    fn valid_response_survives_serialize_and_parse() {
        let parsed = Classification::from_value(&json!({
            "risk_level": "high",
            "intent": "ambiguous",
            "confidence": 0.72,
            "explanation": "elevated tool diversity"
        }))
        .expect("valid classification");

        let encoded = serde_json::to_value(&parsed).expect("serialize");
        let reparsed = Classification::from_value(&encoded).expect("reparse");

        assert_eq!(reparsed, parsed);
        assert_eq!(reparsed.risk_level, RiskLevel::High);
        assert_eq!(reparsed.intent, Intent::Ambiguous);
        assert_eq!(reparsed.confidence, 0.72);
        assert_eq!(reparsed.explanation, "elevated tool diversity");
    }

    #[test]
    fn unknown_risk_level_is_rejected() {
        let error = Classification::from_value(&json!({
            "risk_level": "severe",
            "intent": "benign",
            "confidence": 0.4,
            "explanation": "x"
        }))
        .expect_err("severe is not a risk level");

        assert_eq!(error, ClassificationError::InvalidRiskLevel("severe".to_owned()));
    }

    #[test]
    fn enumerations_are_case_insensitive() {
        let parsed = Classification::from_value(&json!({
            "risk_level": "CRITICAL",
            "intent": "Malicious",
            "confidence": "0.9",
            "explanation": "credential harvesting"
        }))
        .expect("case-insensitive values");

        assert_eq!(parsed.risk_level, RiskLevel::Critical);
        assert_eq!(parsed.intent, Intent::Malicious);
        assert_eq!(parsed.confidence, 0.9);
    }

    #[test]
    fn missing_confidence_defaults_to_half() {
        let parsed = Classification::from_value(&json!({
            "risk_level": "low",
            "intent": "benign",
            "explanation": "routine lookups"
        }))
        .expect("confidence is optional");

        assert_eq!(parsed.confidence, 0.5);
    }

    #[test]
    fn out_of_range_confidence_and_blank_explanation_are_rejected() {
        let high = Classification::from_value(&json!({
            "risk_level": "low",
            "intent": "benign",
            "confidence": 1.5,
            "explanation": "x"
        }));
        assert!(matches!(high, Err(ClassificationError::InvalidConfidence(_))));

        let blank = Classification::from_value(&json!({
            "risk_level": "low",
            "intent": "benign",
            "confidence": 0.1,
            "explanation": "   "
        }));
        assert_eq!(blank, Err(ClassificationError::EmptyExplanation));
    }

    #[test]
    fn non_object_response_is_rejected() {
        assert_eq!(
            Classification::from_value(&json!(["high"])),
            Err(ClassificationError::NotAnObject)
        );
    }
}
