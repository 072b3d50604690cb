use std::collections::BTreeMap;

use bytes::Bytes;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};

const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn next_request_id() -> String {
    format!("req_{}", nanoid!(16, &ID_ALPHABET))
}

/// One inbound call forwarded to an isolate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: next_request_id(),
            method: method.into(),
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Bytes::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Copies resolved path parameters into the envelope. A parameter also
    /// replaces any query pair with the same name.
    pub fn merge_params(&mut self, params: &BTreeMap<String, String>) {
        for (name, value) in params {
            self.query.retain(|(key, _)| key != name);
            self.query.push((name.clone(), value.clone()));
            self.params.insert(name.clone(), value.clone());
        }
    }

    pub fn query_string(&self) -> String {
        encode_query(&self.query)
    }

    /// Path plus encoded query, as it appears on a request line.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query_string())
        }
    }
}

pub fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|value| value.into_owned())
        .unwrap_or(spaced)
}

/// Response status line and headers. Travels as `options` in the first
/// [`ResponseChunk`] of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self::with_status(200)
    }
}

impl ResponseHead {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            status_text: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn apply(&mut self, options: ResponseOptions) {
        if let Some(status) = options.status {
            self.status = status;
        }
        if let Some(text) = options.status_text {
            self.status_text = Some(text);
        }
        for (name, value) in options.headers.unwrap_or_default() {
            self.set_header(&name, value);
        }
    }
}

/// Partial response metadata, merged into a pending [`ResponseHead`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseOptions {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

/// One unit of protocol traffic from a handler back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseChunk {
    pub request_id: String,
    #[serde(default, with = "base64_bytes")]
    pub chunk: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ResponseHead>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub done: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ResponseChunk {
    pub fn head(request_id: &str, head: ResponseHead) -> Self {
        Self {
            request_id: request_id.to_string(),
            chunk: Bytes::new(),
            options: Some(head),
            done: false,
            error: false,
        }
    }

    pub fn data(request_id: &str, chunk: Bytes) -> Self {
        Self {
            request_id: request_id.to_string(),
            chunk,
            options: None,
            done: false,
            error: false,
        }
    }

    pub fn end(request_id: &str, error: bool) -> Self {
        Self {
            request_id: request_id.to_string(),
            chunk: Bytes::new(),
            options: None,
            done: true,
            error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done || self.error
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
