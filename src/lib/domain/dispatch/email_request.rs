//! Validated email request

use serde_json::{Map, Value};

use super::{
    errors::{FieldViolation, ValidationError, ViolationReason},
    EmailAddress,
};

/// An email request that has passed validation.
///
/// The only way to obtain one is [`EmailRequest::validate`], so downstream
/// code never sees a partially valid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailRequest {
    to: Vec<EmailAddress>,
    subject: String,
    html_body: Option<String>,
    plain_text_body: Option<String>,
    cc: Vec<EmailAddress>,
}

impl EmailRequest {
    /// Validates a decoded payload.
    ///
    /// Every field is checked and all violations are reported together in the
    /// returned [`ValidationError`]. Unknown fields are ignored.
    pub fn validate(payload: &Value) -> Result<Self, ValidationError> {
        let Some(fields) = payload.as_object() else {
            return Err(ValidationError::new(vec![FieldViolation {
                field: "(root)".to_string(),
                reason: ViolationReason::ExpectedObject,
            }]));
        };

        let mut violations = Vec::new();

        let to = addresses(fields, "to", true, &mut violations);
        let subject = subject(fields, &mut violations);
        let html_body = optional_string(fields, "html", &mut violations);
        let plain_text_body = optional_string(fields, "plaintext", &mut violations);
        let cc = addresses(fields, "cc", false, &mut violations);

        if !violations.is_empty() {
            return Err(ValidationError::new(violations));
        }

        Ok(Self {
            to,
            subject: subject.unwrap_or_default(),
            html_body,
            plain_text_body,
            cc,
        })
    }

    /// The recipients, in payload order
    pub fn to(&self) -> &[EmailAddress] {
        &self.to
    }

    /// The subject line
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The HTML body
    pub fn html_body(&self) -> Option<&str> {
        self.html_body.as_deref()
    }

    /// The plain text body
    pub fn plain_text_body(&self) -> Option<&str> {
        self.plain_text_body.as_deref()
    }

    /// The carbon-copy recipients; empty when the payload had none
    pub fn cc(&self) -> &[EmailAddress] {
        &self.cc
    }
}

fn violation(violations: &mut Vec<FieldViolation>, field: &str, reason: ViolationReason) {
    violations.push(FieldViolation {
        field: field.to_string(),
        reason,
    });
}

fn subject(fields: &Map<String, Value>, violations: &mut Vec<FieldViolation>) -> Option<String> {
    match fields.get("subject") {
        None | Some(Value::Null) => {
            violation(violations, "subject", ViolationReason::Missing);
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            violation(violations, "subject", ViolationReason::Empty);
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            violation(violations, "subject", ViolationReason::ExpectedString);
            None
        }
    }
}

fn optional_string(
    fields: &Map<String, Value>,
    name: &str,
    violations: &mut Vec<FieldViolation>,
) -> Option<String> {
    match fields.get(name) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            violation(violations, name, ViolationReason::ExpectedString);
            None
        }
    }
}

fn addresses(
    fields: &Map<String, Value>,
    name: &str,
    required: bool,
    violations: &mut Vec<FieldViolation>,
) -> Vec<EmailAddress> {
    let items = match fields.get(name) {
        None | Some(Value::Null) => {
            if required {
                violation(violations, name, ViolationReason::Missing);
            }
            return Vec::new();
        }
        Some(Value::Array(items)) => items,
        Some(_) => {
            violation(violations, name, ViolationReason::ExpectedStringList);
            return Vec::new();
        }
    };

    if required && items.is_empty() {
        violation(violations, name, ViolationReason::NoRecipients);
        return Vec::new();
    }

    let mut parsed = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let field = format!("{name}[{i}]");

        match item {
            Value::String(raw) => match EmailAddress::new(raw) {
                Ok(address) => parsed.push(address),
                Err(err) => violation(violations, &field, err.into()),
            },
            _ => violation(violations, &field, ViolationReason::ExpectedString),
        }
    }

    parsed
}
