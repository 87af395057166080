//! Assembly of the invocation payload for public calls.
//!
//! A public request either carries an explicit `{"data": ..., "headers": ...}`
//! envelope, any other JSON body, or plain query/form parameters. Whatever
//! the shape, the function sees one `data` value and a header map.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::header::{CONTENT_TYPE, USER_AGENT};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde_json::{Map, Value};

/// The `data` and `headers` handed to the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationPayload {
    pub data: Value,
    pub headers: Value,
}

/// Build the payload of a public invocation.
///
/// Bodies sent as JSON are used as-is, unwrapping a `{data, headers}`
/// envelope when present. Otherwise query and form parameters are merged into an
/// object; a key given once maps to a string and a repeated key to an
/// array of strings.
pub fn assemble(headers: &HeaderMap, query: Option<&str>, body: &[u8]) -> InvocationPayload {
    let request_headers = header_map(headers);

    if !body.is_empty() && is_json(headers) {
        if let Ok(json) = serde_json::from_slice::<Value>(body) {
            return unwrap_envelope(json, request_headers);
        }
    }

    let mut params: Vec<(String, String)> = Vec::new();
    if let Some(query) = query {
        params.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
    }
    if is_form(headers) {
        params.extend(url::form_urlencoded::parse(body).into_owned());
    }

    InvocationPayload {
        data: Value::Object(collect_params(params)),
        headers: request_headers,
    }
}

/// Split a JSON invocation body into `data` and `headers`.
///
/// Bodies with a `data` key are treated as an envelope whose `headers`
/// (when an object) replace the transport headers. Any other body is the
/// data itself.
pub fn unwrap_envelope(body: Value, request_headers: Value) -> InvocationPayload {
    match body {
        Value::Object(map) if map.contains_key("data") => split_envelope(map, request_headers),
        other => InvocationPayload {
            data: other,
            headers: request_headers,
        },
    }
}

/// Read an explicit `{data, headers}` envelope. A missing `data` is null;
/// `headers` that are not an object fall back to `default_headers`.
pub fn split_envelope(mut envelope: Map<String, Value>, default_headers: Value) -> InvocationPayload {
    let data = envelope.remove("data").unwrap_or(Value::Null);
    let headers = match envelope.remove("headers") {
        Some(h @ Value::Object(_)) => h,
        _ => default_headers,
    };
    InvocationPayload { data, headers }
}

/// Headers as a JSON object; repeated headers become arrays.
pub fn header_map(headers: &HeaderMap) -> Value {
    let params = headers.iter().filter_map(|(name, value)| {
        value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
    });
    Value::Object(collect_params(params))
}

fn collect_params(params: impl IntoIterator<Item = (String, String)>) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in params {
        match map.get_mut(&key) {
            None => {
                map.insert(key, Value::String(value));
            }
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
        }
    }
    map
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

fn is_json(headers: &HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| ct.contains("json"))
}

fn is_form(headers: &HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Caller address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// socket peer when the server was started with connect info.
pub fn client_ip(parts: &Parts) -> Option<String> {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real_ip = parts
        .headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return Some(ip.to_string());
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

pub fn user_agent(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
