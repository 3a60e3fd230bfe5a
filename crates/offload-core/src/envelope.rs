//! Error envelope codec.
//!
//! A rejection crosses the process boundary as one of two shapes:
//!
//! ```text
//! {"data": <value>}                                  plain rejection payload
//! {"error": {"message", "stack", ...extra fields}}   error rejection
//! ```
//!
//! [`wrap`] and [`unwrap`] convert between [`Rejection`] and that shape so
//! the message, trace, and every extra field survive the trip.

use std::fmt;

use crate::error::{Error, Result};
use crate::value::{Object, Value};

const DATA_KEY: &str = "data";
const ERROR_KEY: &str = "error";
const MESSAGE_KEY: &str = "message";
const STACK_KEY: &str = "stack";

/// An error with a message, a diagnostic trace, and arbitrary extra fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    message: String,
    stack: String,
    fields: Object,
}

impl ErrorValue {
    /// Create an error whose trace starts with the message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let stack = format!("Error: {}", message);
        Self {
            message,
            stack,
            fields: Object::new(),
        }
    }

    /// Capture any error, appending its source chain to the trace.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(value) = error.downcast_ref::<ErrorValue>() {
            return value.clone();
        }

        let mut value = Self::new(error.to_string());
        let mut source = error.source();
        while let Some(cause) = source {
            value.push_frame(format_args!("caused by: {}", cause));
            source = cause.source();
        }
        value
    }

    /// Rebuild from the body of an `error` envelope.
    fn from_fields(mut fields: Object) -> Self {
        let message = fields.remove(MESSAGE_KEY).map(text).unwrap_or_default();
        let stack = fields
            .remove(STACK_KEY)
            .map(text)
            .unwrap_or_else(|| format!("Error: {}", message));
        Self {
            message,
            stack,
            fields,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Attach an extra field. The keys `message` and `stack` are reserved
    /// and ignored here.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != MESSAGE_KEY && key != STACK_KEY {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// Append one line to the trace.
    pub fn push_frame(&mut self, frame: impl fmt::Display) {
        self.stack.push_str(&format!("\n    {}", frame));
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn fields(&self) -> &Object {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorValue {}

fn text(value: Value) -> String {
    match value.resolve() {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Why a code unit failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Failure with error semantics.
    Error(ErrorValue),
    /// Failure with an arbitrary payload, `Null` included.
    Data(Value),
}

impl Rejection {
    pub fn data(value: impl Into<Value>) -> Self {
        Rejection::Data(value.into())
    }

    /// Classify an arbitrary payload.
    ///
    /// An object with string `message` and `stack` entries carries error
    /// semantics; anything else is plain data.
    pub fn from_value(value: Value) -> Self {
        if let Value::Object(entries) = value.resolve() {
            let is_error = [MESSAGE_KEY, STACK_KEY]
                .iter()
                .all(|key| matches!(entries.get(*key), Some(Value::String(_))));
            if is_error {
                return Rejection::Error(ErrorValue::from_fields(entries));
            }
        }
        Rejection::Data(value)
    }

    /// Append a trace frame naming where an error rejection came from.
    pub fn with_origin(mut self, origin: &str) -> Self {
        if let Rejection::Error(error) = &mut self {
            error.push_frame(format_args!("at {}", origin));
        }
        self
    }
}

impl<E: std::error::Error + 'static> From<E> for Rejection {
    fn from(error: E) -> Self {
        Rejection::Error(ErrorValue::from_error(&error))
    }
}

/// Convert a rejection into its transportable envelope.
pub fn wrap(rejection: &Rejection) -> Value {
    match rejection {
        Rejection::Data(data) => Value::object([(DATA_KEY, data.clone())]),
        Rejection::Error(error) => {
            let mut body = error.fields.clone();
            body.insert(MESSAGE_KEY.to_string(), Value::from(error.message.as_str()));
            body.insert(STACK_KEY.to_string(), Value::from(error.stack.as_str()));
            Value::object([(ERROR_KEY, Value::Object(body))])
        }
    }
}

/// Reconstruct a rejection from its envelope.
///
/// `data` wins when present, even if it is `Null`. An envelope with neither
/// key is a protocol bug and yields [`Error::MalformedEnvelope`].
pub fn unwrap(envelope: &Value) -> Result<Rejection> {
    let Value::Object(mut entries) = envelope.resolve() else {
        return Err(Error::MalformedEnvelope);
    };

    if let Some(data) = entries.remove(DATA_KEY) {
        return Ok(Rejection::Data(data));
    }

    match entries.remove(ERROR_KEY).map(|body| body.resolve()) {
        Some(Value::Object(body)) => Ok(Rejection::Error(ErrorValue::from_fields(body))),
        _ => Err(Error::MalformedEnvelope),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_roundtrip_preserves_fields() {
        let mut error = ErrorValue::new("Failure!")
            .with_field("code", 404)
            .with_field("details", Value::object([("retry", Value::from(false))]));
        error.push_frame("at reject-error");

        let restored = unwrap(&wrap(&Rejection::Error(error.clone()))).unwrap();
        let Rejection::Error(restored) = restored else {
            panic!("expected an error rejection");
        };

        assert_eq!(restored.message(), "Failure!");
        assert_eq!(restored.stack(), error.stack());
        assert!(restored.stack().contains("reject-error"));
        assert_eq!(restored.field("code").and_then(Value::as_i64), Some(404));
        assert_eq!(restored, error);
    }

    #[test]
    fn test_data_roundtrip_including_null() {
        for data in [
            Value::Null,
            Value::from(0),
            Value::from(""),
            Value::object([("message", Value::from("Failure!"))]),
        ] {
            let restored = unwrap(&wrap(&Rejection::Data(data.clone()))).unwrap();
            assert_eq!(restored, Rejection::Data(data));
        }
    }

    #[test]
    fn test_envelope_without_keys_is_malformed() {
        let empty = Value::object(Vec::<(String, Value)>::new());
        assert!(matches!(unwrap(&empty), Err(Error::MalformedEnvelope)));
        assert!(matches!(unwrap(&Value::from(3)), Err(Error::MalformedEnvelope)));
        let bad_error = Value::object([("error", Value::from("nope"))]);
        assert!(matches!(unwrap(&bad_error), Err(Error::MalformedEnvelope)));
    }

    #[test]
    fn test_from_value_detects_error_semantics() {
        let error_like = Value::object([
            ("message", Value::from("boom")),
            ("stack", Value::from("Error: boom\n    at unit")),
            ("code", Value::from("E_BOOM")),
        ]);
        match Rejection::from_value(error_like) {
            Rejection::Error(error) => {
                assert_eq!(error.message(), "boom");
                assert_eq!(error.field("code").and_then(Value::as_str), Some("E_BOOM"));
                assert!(error.field("message").is_none());
            }
            other => panic!("expected error, got {:?}", other),
        }

        let message_only = Value::object([("message", Value::from("Failure!"))]);
        assert_eq!(
            Rejection::from_value(message_only.clone()),
            Rejection::Data(message_only)
        );
    }

    #[test]
    fn test_std_errors_keep_their_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let rejection = Rejection::from(io).with_origin("unit");
        let Rejection::Error(error) = rejection else {
            panic!("expected an error rejection");
        };
        assert_eq!(error.message(), "missing file");
        assert!(error.stack().ends_with("at unit"));

        let original = ErrorValue::new("kept").with_field("code", 1);
        assert_eq!(Rejection::from(original.clone()), Rejection::Error(original));
    }
}
