use serde_json::{Map, Value};

use crate::error::ParseError;

/// One mail to deliver, extracted from a raw message payload.
///
/// Wire format is a UTF-8 JSON object:
/// `{"to": "...", "subject": "...", "body": "...", "createdAt": <epoch ms>}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailJob {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Epoch milliseconds at which the producer created the mail.
    pub created_at: i64,
}

impl MailJob {
    pub fn parse(payload: Option<&[u8]>) -> Result<Self, ParseError> {
        let payload = match payload {
            Some(p) if !p.is_empty() => p,
            _ => return Err(ParseError::EmptyPayload),
        };

        let text = std::str::from_utf8(payload)?;
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(fields) = value else {
            return Err(ParseError::NotAnObject);
        };

        let to = string_field(&fields, "to")?;
        if to.trim().is_empty() {
            return Err(ParseError::EmptyDestination);
        }

        Ok(Self {
            to,
            subject: string_field(&fields, "subject")?,
            body: string_field(&fields, "body")?,
            created_at: integer_field(&fields, "createdAt")?,
        })
    }
}

fn string_field(fields: &Map<String, Value>, field: &'static str) -> Result<String, ParseError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ParseError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn integer_field(fields: &Map<String, Value>, field: &'static str) -> Result<i64, ParseError> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(Value::Number(n)) => n.as_i64().ok_or(ParseError::WrongType {
            field,
            expected: "an integer",
        }),
        Some(_) => Err(ParseError::WrongType {
            field,
            expected: "an integer",
        }),
    }
}
