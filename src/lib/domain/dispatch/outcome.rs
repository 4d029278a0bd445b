//! Send outcome

use std::fmt;

use serde_json::Value;

/// Terminal status of a send operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    /// The email was handed off for delivery
    Succeeded,

    /// The provider reported a failure
    Failed,

    /// Absent or unrecognised status, treated as failure
    Unknown(Option<String>),
}

impl SendStatus {
    /// Parses a provider status, ignoring case
    pub fn from_provider(status: Option<&str>) -> Self {
        match status {
            Some(s) if s.eq_ignore_ascii_case("succeeded") => SendStatus::Succeeded,
            Some(s) if s.eq_ignore_ascii_case("failed") => SendStatus::Failed,
            other => SendStatus::Unknown(other.map(str::to_string)),
        }
    }
}

/// The interpreted result of one send attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    /// Terminal status
    pub status: SendStatus,

    /// The status string exactly as the provider reported it
    pub raw_status: Option<String>,

    /// The provider message id
    pub provider_message_id: Option<String>,

    /// Error detail, only populated for unsuccessful sends
    pub error_detail: Option<Value>,
}

impl SendOutcome {
    /// Interprets a terminal operation document.
    ///
    /// A document that is not a JSON object has no status, and is kept whole
    /// as the error detail.
    pub fn from_result(result: &Value) -> Self {
        let Some(fields) = result.as_object() else {
            return Self {
                status: SendStatus::Unknown(None),
                raw_status: None,
                provider_message_id: None,
                error_detail: Some(result.clone()),
            };
        };

        let raw_status = fields
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        let status = SendStatus::from_provider(raw_status.as_deref());

        let error_detail = match status {
            SendStatus::Succeeded => None,
            _ => fields.get("error").filter(|e| !e.is_null()).cloned(),
        };

        Self {
            status,
            raw_status,
            provider_message_id: fields.get("id").and_then(Value::as_str).map(str::to_string),
            error_detail,
        }
    }

    /// Returns true if the email was sent
    pub fn is_success(&self) -> bool {
        self.status == SendStatus::Succeeded
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::Succeeded => write!(f, "Succeeded"),
            SendStatus::Failed => write!(f, "Failed"),
            SendStatus::Unknown(Some(s)) => write!(f, "{s}"),
            SendStatus::Unknown(None) => write!(f, "<absent>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_status_is_case_insensitive() {
        assert_eq!(SendStatus::from_provider(Some("Succeeded")), SendStatus::Succeeded);
        assert_eq!(SendStatus::from_provider(Some("SUCCEEDED")), SendStatus::Succeeded);
        assert_eq!(SendStatus::from_provider(Some("failed")), SendStatus::Failed);
        assert_eq!(
            SendStatus::from_provider(Some("Canceled")),
            SendStatus::Unknown(Some("Canceled".to_string()))
        );
        assert_eq!(SendStatus::from_provider(None), SendStatus::Unknown(None));
    }

    #[test]
    fn test_successful_result() {
        let outcome = SendOutcome::from_result(&json!({"status": "Succeeded", "id": "message-id"}));

        assert!(outcome.is_success());
        assert_eq!(outcome.provider_message_id.as_deref(), Some("message-id"));
        assert_eq!(outcome.error_detail, None);
    }

    #[test]
    fn test_failed_result_keeps_error_detail() {
        let outcome = SendOutcome::from_result(&json!({
            "status": "Failed",
            "id": "failed-id",
            "error": {"code": "InvalidRecipient", "message": "Invalid recipient"}
        }));

        assert!(!outcome.is_success());
        assert_eq!(outcome.raw_status.as_deref(), Some("Failed"));
        assert_eq!(
            outcome.error_detail,
            Some(json!({"code": "InvalidRecipient", "message": "Invalid recipient"}))
        );
    }

    #[test]
    fn test_non_object_result_is_unknown() {
        let outcome = SendOutcome::from_result(&json!("gibberish"));

        assert_eq!(outcome.status, SendStatus::Unknown(None));
        assert_eq!(outcome.status.to_string(), "<absent>");
        assert_eq!(outcome.error_detail, Some(json!("gibberish")));
    }
}
