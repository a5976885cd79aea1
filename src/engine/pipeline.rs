// Result pipeline — decrypt, pre-operation hook, then classify into one outcome.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::hooks::{PreOperation, SessionHooks};
use crate::error::RequestError;
use crate::request::{RequestDescriptor, ResultFormat};

/// Processed response payload handed to success callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseValue {
    Text(String),
    Json(Value),
}

impl ResponseValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseValue::Text(s) => Some(s),
            ResponseValue::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseValue::Json(v) => Some(v),
            ResponseValue::Text(_) => None,
        }
    }

    /// Map the payload into a typed model.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        let result = match self {
            ResponseValue::Text(s) => serde_json::from_str(s),
            ResponseValue::Json(v) => T::deserialize(v),
        };
        result.map_err(|e| RequestError::Conversion(e.to_string()))
    }
}

/// Terminal outcome of one dispatch attempt (cache hits use `Success` with
/// `is_cache` set).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { value: ResponseValue, is_cache: bool },
    Failure(RequestError),
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn value(&self) -> Option<&ResponseValue> {
        match self {
            Outcome::Success { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&RequestError> {
        match self {
            Outcome::Failure(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Outcome::Success { is_cache: true, .. })
    }
}

/// What the engine should do with a processed result.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Deliver(Outcome),
    /// The pre-operation hook swallowed the result; no callback fires.
    Ignored,
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        matches!(self, Delivery::Deliver(outcome) if outcome.is_success())
    }
}

/// Decode raw body bytes with the request's result encoding.
pub fn decode_body(desc: &RequestDescriptor, body: &[u8]) -> Result<String, RequestError> {
    desc.result_encoding().decode(body)
}

/// Success path: decrypt, convert to the declared format, run the hook.
pub fn process_response(
    hooks: &SessionHooks,
    desc: &RequestDescriptor,
    body: &str,
    is_cache: bool,
) -> Delivery {
    let decrypted = (hooks.decrypt)(desc, body.to_string());
    let (value, error) = match desc.result_format() {
        ResultFormat::Text => (Some(ResponseValue::Text(decrypted)), None),
        ResultFormat::Json => match serde_json::from_str::<Value>(&decrypted) {
            Ok(json) => (Some(ResponseValue::Json(json)), None),
            Err(e) => (None, Some(RequestError::Conversion(e.to_string()))),
        },
    };
    classify((hooks.pre_operation)(desc, value, error, is_cache), is_cache)
}

/// Failure path: the hook sees no value and the error; no decryption.
pub fn process_failure(
    hooks: &SessionHooks,
    desc: &RequestDescriptor,
    error: RequestError,
) -> Delivery {
    classify((hooks.pre_operation)(desc, None, Some(error), false), false)
}

fn classify(decision: PreOperation, is_cache: bool) -> Delivery {
    match decision {
        PreOperation::Ignore => Delivery::Ignored,
        PreOperation::Deliver {
            error: Some(err), ..
        } => Delivery::Deliver(Outcome::Failure(err)),
        PreOperation::Deliver { value, error: None } => Delivery::Deliver(Outcome::Success {
            value: value.unwrap_or_else(|| ResponseValue::Text(String::new())),
            is_cache,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn text_request() -> RequestDescriptor {
        RequestDescriptor::get("post").build()
    }

    #[test]
    fn test_default_hooks_pass_through() {
        let hooks = SessionHooks::default();
        let delivery = process_response(&hooks, &text_request(), "hello", false);
        assert_eq!(
            delivery,
            Delivery::Deliver(Outcome::Success {
                value: ResponseValue::Text("hello".to_string()),
                is_cache: false,
            })
        );

        let delivery = process_failure(&hooks, &text_request(), RequestError::Network("x".into()));
        assert_eq!(
            delivery,
            Delivery::Deliver(Outcome::Failure(RequestError::Network("x".into())))
        );
    }

    #[test]
    fn test_decrypt_runs_before_hook() {
        let hooks = SessionHooks::default()
            .with_decrypt(|_, body| body.chars().rev().collect())
            .with_pre_operation(|_, value, error, is_cache| {
                assert!(is_cache);
                assert_eq!(value, Some(ResponseValue::Text("olleh".to_string())));
                PreOperation::Deliver { value, error }
            });
        let delivery = process_response(&hooks, &text_request(), "hello", true);
        assert!(delivery.is_success());
    }

    #[test]
    fn test_hook_can_turn_success_into_failure_and_ignore() {
        let hooks = SessionHooks::default().with_pre_operation(|_, value, _, _| {
            match value.as_ref().and_then(ResponseValue::as_text) {
                Some("stale") => PreOperation::Ignore,
                _ => PreOperation::Deliver {
                    value: None,
                    error: Some(RequestError::custom("business error")),
                },
            }
        });
        assert_eq!(
            process_response(&hooks, &text_request(), "stale", false),
            Delivery::Ignored
        );
        assert_eq!(
            process_response(&hooks, &text_request(), "other", false),
            Delivery::Deliver(Outcome::Failure(RequestError::custom("business error")))
        );
    }

    #[test]
    fn test_cleared_error_becomes_success() {
        let hooks = SessionHooks::default().with_pre_operation(|_, _, _, _| PreOperation::Deliver {
            value: None,
            error: None,
        });
        let delivery = process_failure(&hooks, &text_request(), RequestError::Network("x".into()));
        assert_eq!(
            delivery,
            Delivery::Deliver(Outcome::Success {
                value: ResponseValue::Text(String::new()),
                is_cache: false,
            })
        );
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
        name: String,
    }

    #[test]
    fn test_json_format_and_typed_mapping() {
        let desc = RequestDescriptor::get("item")
            .result_format(ResultFormat::Json)
            .build();
        let hooks = SessionHooks::default();

        let delivery = process_response(&hooks, &desc, r#"{"id": 3, "name": "disk"}"#, false);
        let Delivery::Deliver(outcome) = delivery else {
            panic!("expected delivery");
        };
        let value = outcome.value().unwrap();
        assert_eq!(value.as_json(), Some(&json!({"id": 3, "name": "disk"})));
        let item: Item = value.deserialize().unwrap();
        assert_eq!(item, Item { id: 3, name: "disk".to_string() });

        let delivery = process_response(&hooks, &desc, "<html>", false);
        assert!(matches!(
            delivery,
            Delivery::Deliver(Outcome::Failure(RequestError::Conversion(_)))
        ));
    }
}
