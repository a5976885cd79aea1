// Parameter and result encodings used when building a transport call.

use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::{Method, Url};
use serde_json::Value;

use super::Params;
use crate::error::RequestError;

/// How request parameters are placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterEncoding {
    /// Query string for GET/HEAD/DELETE, `application/x-www-form-urlencoded`
    /// body for everything else.
    #[default]
    Url,
    /// `application/json` body.
    Json,
}

/// Body produced by a parameter encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub content_type: &'static str,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub struct EncodedParams {
    pub url: Url,
    pub body: Option<EncodedBody>,
}

impl ParameterEncoding {
    pub fn encode(
        &self,
        method: &Method,
        mut url: Url,
        params: &Params,
    ) -> Result<EncodedParams, RequestError> {
        if params.is_empty() {
            return Ok(EncodedParams { url, body: None });
        }

        match self {
            ParameterEncoding::Url => {
                let pairs = flatten_params(params);
                if encodes_in_query(method) {
                    url.query_pairs_mut().extend_pairs(pairs.iter());
                    Ok(EncodedParams { url, body: None })
                } else {
                    let body = url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(pairs.iter())
                        .finish();
                    Ok(EncodedParams {
                        url,
                        body: Some(EncodedBody {
                            content_type: "application/x-www-form-urlencoded; charset=utf-8",
                            bytes: Bytes::from(body),
                        }),
                    })
                }
            }
            ParameterEncoding::Json => {
                let sorted: BTreeMap<&String, &Value> = params.iter().collect();
                let bytes = serde_json::to_vec(&sorted)
                    .map_err(|e| RequestError::Construction(format!("json encoding: {}", e)))?;
                Ok(EncodedParams {
                    url,
                    body: Some(EncodedBody {
                        content_type: "application/json",
                        bytes: Bytes::from(bytes),
                    }),
                })
            }
        }
    }
}

fn encodes_in_query(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::DELETE
}

/// Flatten parameters into sorted key/value pairs. Arrays become `key[]`,
/// objects become `key[field]`.
pub fn flatten_params(params: &Params) -> Vec<(String, String)> {
    let sorted: BTreeMap<&String, &Value> = params.iter().collect();
    let mut out = Vec::with_capacity(sorted.len());
    for (key, value) in sorted {
        flatten_value(key, value, &mut out);
    }
    out
}

fn flatten_value(key: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Array(items) => {
            let nested = format!("{}[]", key);
            for item in items {
                flatten_value(&nested, item, out);
            }
        }
        Value::Object(map) => {
            for (field, item) in map {
                flatten_value(&format!("{}[{}]", key, field), item, out);
            }
        }
        other => out.push((key.to_string(), scalar_to_string(other))),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// How the response body bytes are turned into a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultEncoding {
    #[default]
    Utf8,
    /// UTF-8 with invalid sequences replaced by U+FFFD.
    Utf8Lossy,
    /// ISO-8859-1; every byte maps to one char.
    Latin1,
}

impl ResultEncoding {
    pub fn decode(&self, bytes: &[u8]) -> Result<String, RequestError> {
        match self {
            ResultEncoding::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| RequestError::Conversion(format!("body is not utf-8: {}", e))),
            ResultEncoding::Utf8Lossy => Ok(String::from_utf8_lossy(bytes).into_owned()),
            ResultEncoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}
