//! Request/response types exchanged between the host and a module.
//!
//! The host owns the HTTP wire engine; modules only ever see these plain,
//! serializable values. Bodies travel base64-encoded inside the JSON frames.

use serde::{Deserialize, Serialize};

/// URL of an incoming request, split the way hooks match on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUrl {
    /// Whether the request arrived on a secure endpoint
    pub https: bool,
    /// Host name without port (lowercase)
    pub host: String,
    pub port: u16,
    /// Full request path, always starting with `/`
    pub path: String,
    /// Raw query string without the leading `?`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Path of the hook that matched (empty when the hook had no path)
    #[serde(default)]
    pub base_path: String,
    /// Remainder of `path` after `base_path`
    #[serde(default)]
    pub sub_path: String,
}

impl RequestUrl {
    /// Look up a single query parameter (no percent-decoding).
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Scheme-qualified URL, mostly for log lines.
    pub fn to_url_string(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        match &self.query {
            Some(q) => format!("{}://{}:{}{}?{}", scheme, self.host, self.port, self.path, q),
            None => format!("{}://{}:{}{}", scheme, self.host, self.port, self.path),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub url: RequestUrl,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, with = "body_b64")]
    pub body: Vec<u8>,
}

impl Request {
    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "body_b64")]
    pub body: Vec<u8>,
}

impl Response {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::status(200)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn html(body: impl Into<String>) -> Self {
        Self::status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::status(200)
            .with_header("content-type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    /// 302 redirect to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::status(302).with_header("location", location)
    }

    pub fn not_found() -> Self {
        Self::status(404)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(b"Not Found".to_vec())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }
}

mod body_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
