//! HTTP-shaped request and response packets and their wire codec.
//!
//! Packets travel as a self-describing JSON envelope; bodies are carried as
//! base64 strings inside it. The codec round-trips exactly: bodies are
//! byte-equal and the header multimap preserves insertion order.

use std::time::Duration;

use base64::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ClientError, Result};

/// HTTP version carried when the caller does not set one.
const DEFAULT_VERSION: &str = "1.1";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Ordered multimap of header name to values.
///
/// Preserves insertion order; name comparison is ASCII-case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to a header, creating the header if absent.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => values.push(value),
            None => self.entries.push((name, vec![value])),
        }
    }

    /// Replace all values of a header with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entry_mut(&name) {
            Some(values) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((name, vec![value])),
        }
    }

    /// First value of a header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.first().map(String::as_str))
    }

    /// All values of a header.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove a header entirely.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Merge `defaults` into this map without overwriting existing headers.
    pub fn merge_missing(&mut self, defaults: &HeaderMap) {
        for (name, values) in &defaults.entries {
            if !self.contains(name) {
                self.entries.push((name.clone(), values.clone()));
            }
        }
    }

    /// Iterate over `(name, values)` entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

fn serialize_body<S: Serializer>(body: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(body))
}

fn deserialize_body<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Timeout behavior for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTimeout {
    /// Publish and return a synthetic 200 immediately; no waiter is registered.
    FireAndForget,
    /// Wait for a response indefinitely; no timer is armed.
    Never,
    /// Fail the request with `Timeout` if no response arrives in time.
    After(Duration),
}

/// Per-request options attached by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Timeout override; `None` uses the client default.
    pub timeout: Option<RequestTimeout>,
}

/// An HTTP-shaped request tunneled over the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPacket {
    /// Request method (GET, POST, ...).
    pub method: String,
    /// Request URI; may be relative if the client has a base URI.
    pub uri: String,
    /// HTTP version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Request headers.
    #[serde(default)]
    pub headers: HeaderMap,
    /// Request body bytes.
    #[serde(
        serialize_with = "serialize_body",
        deserialize_with = "deserialize_body",
        default
    )]
    pub body: Vec<u8>,
    /// Caller options; not part of the wire envelope.
    #[serde(skip)]
    pub options: RequestOptions,
}

impl RequestPacket {
    /// Create a request with the given method and URI, empty body.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            version: default_version(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            options: RequestOptions::default(),
        }
    }

    /// GET request for a URI.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri)
    }

    /// POST request with a body.
    pub fn post(uri: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("POST", uri).with_body(body)
    }

    /// PUT request with a body.
    pub fn put(uri: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("PUT", uri).with_body(body)
    }

    /// DELETE request for a URI.
    pub fn delete(uri: impl Into<String>) -> Self {
        Self::new("DELETE", uri)
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: RequestTimeout) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Encode to the wire envelope.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ClientError::InvalidArgument(format!("unserializable request: {e}")))
    }

    /// Decode from the wire envelope.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ClientError::BadResponse(format!("undecodable request packet: {e}")))
    }
}

/// An HTTP-shaped response returned through the callback queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// Status code (e.g., 200).
    pub status: u16,
    /// Reason phrase (e.g., "OK").
    pub reason: String,
    /// HTTP version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Response headers.
    #[serde(default)]
    pub headers: HeaderMap,
    /// Response body bytes.
    #[serde(
        serialize_with = "serialize_body",
        deserialize_with = "deserialize_body",
        default
    )]
    pub body: Vec<u8>,
}

impl ResponsePacket {
    /// Create a response with the given status and reason, empty body.
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            version: default_version(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// 200 OK with a body.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let mut res = Self::new(200, "OK");
        res.body = body.into();
        res
    }

    /// Synthetic 200 OK with an empty body, used for fire-and-forget sends.
    pub fn empty_ok() -> Self {
        let mut res = Self::new(200, "OK");
        res.set_content_length();
        res
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Overwrite `Content-Length` with the actual body byte count.
    pub fn set_content_length(&mut self) {
        self.headers.set("Content-Length", self.body.len().to_string());
    }

    /// Encode to the wire envelope.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ClientError::BadResponse(format!("unserializable response: {e}")))
    }

    /// Decode from the wire envelope.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ClientError::BadResponse(format!("undecodable response packet: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_preserves_insertion_order() {
        let mut headers = HeaderMap::new();
        headers.append("X-First", "1");
        headers.append("X-Second", "2");
        headers.append("X-First", "3");
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-First", "X-Second"]);
        assert_eq!(headers.get_all("X-First"), &["1", "3"]);
    }

    #[test]
    fn test_header_map_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.contains("CONTENT-TYPE"));
        headers.set("CONTENT-TYPE", "application/json");
        assert_eq!(headers.get_all("content-type"), &["application/json"]);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_merge_missing_does_not_overwrite() {
        let mut headers = HeaderMap::new();
        headers.set("Accept", "application/json");
        let mut defaults = HeaderMap::new();
        defaults.set("Accept", "text/html");
        defaults.set("User-Agent", "burrow");
        headers.merge_missing(&defaults);
        assert_eq!(headers.get("Accept"), Some("application/json"));
        assert_eq!(headers.get("User-Agent"), Some("burrow"));
    }

    #[test]
    fn test_request_round_trip() {
        let req = RequestPacket::post("/orders", b"{\"qty\": 3}".to_vec())
            .with_header("Content-Type", "application/json")
            .with_header("X-Trace", "abc");
        let bytes = req.serialize().unwrap();
        let decoded = RequestPacket::deserialize(&bytes).unwrap();
        assert_eq!(decoded.method, req.method);
        assert_eq!(decoded.uri, req.uri);
        assert_eq!(decoded.version, req.version);
        assert_eq!(decoded.headers, req.headers);
        assert_eq!(decoded.body, req.body);
    }

    #[test]
    fn test_response_round_trip_byte_equal_body() {
        let body: Vec<u8> = (0..=255).collect();
        let mut res = ResponsePacket::ok(body.clone());
        res.headers.append("X-Server", "fake");
        res.set_content_length();
        let decoded = ResponsePacket::deserialize(&res.serialize().unwrap()).unwrap();
        assert_eq!(decoded, res);
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn test_set_content_length_overwrites_inbound_value() {
        let mut res = ResponsePacket::ok(b"hello".to_vec());
        res.headers.set("Content-Length", "999");
        res.set_content_length();
        assert_eq!(res.headers.get("Content-Length"), Some("5"));
        assert_eq!(res.headers.get_all("Content-Length").len(), 1);
    }

    #[test]
    fn test_empty_ok_has_zero_content_length() {
        let res = ResponsePacket::empty_ok();
        assert_eq!(res.status, 200);
        assert!(res.body.is_empty());
        assert_eq!(res.headers.get("Content-Length"), Some("0"));
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        let err = ResponsePacket::deserialize(b"\x00\x01not json").unwrap_err();
        assert!(matches!(err, ClientError::BadResponse(_)));
    }

    #[test]
    fn test_options_not_serialized() {
        let req = RequestPacket::get("/x").with_timeout(RequestTimeout::Never);
        let decoded = RequestPacket::deserialize(&req.serialize().unwrap()).unwrap();
        assert_eq!(decoded.options, RequestOptions::default());
    }
}
