//! Request assembly: parameter encoding, target URL and form body.

use std::fmt;

use bytes::Bytes;
use http::Method;
use http::header::{
    ACCEPT, ACCEPT_CHARSET, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use thiserror::Error;
use url::Url;

use crate::auth::AuthHeaders;

/// Everything outside the RFC 3986 unreserved set is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub const MIME_JSON: &str = "application/json";
pub const MIME_FORM_URLENCODED: &str = "application/x-www-form-urlencoded; charset=utf-8";
pub const CHARSET_UTF8: &str = "utf-8";

/// Problems with the target a request was built for.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("cannot parse malformed URL \"{url}\": {source}")]
    MalformedUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
}

/// Percent-encode a key or value.
pub fn url_encode(input: &str) -> String {
    utf8_percent_encode(input, UNRESERVED).to_string()
}

/// Reverse of [`url_encode`]. Invalid UTF-8 sequences are replaced.
pub fn url_decode(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

/// HTTP verbs the pipeline can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
}

impl Verb {
    pub fn method(self) -> Method {
        match self {
            Verb::Get => Method::GET,
            Verb::Post => Method::POST,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::Get => "GET",
            Verb::Post => "POST",
        })
    }
}

/// Ordered name/value parameters.
///
/// Keeps the order names were first inserted in; setting an existing name
/// replaces its value without moving it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(existing, _)| *existing == name) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.pairs.iter().position(|(existing, _)| existing == name)?;
        Some(self.pairs.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// `k=v&k=v` in insertion order.
    pub fn to_query_string(&self) -> String {
        join_encoded(self.pairs.iter())
    }

    /// `k=v&k=v` sorted by name, used for signing.
    pub fn to_canonical_string(&self) -> String {
        let mut sorted: Vec<_> = self.pairs.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        join_encoded(sorted.into_iter())
    }

    /// Encoded form body, `None` when there is nothing to send.
    pub fn to_form_body(&self) -> Option<Bytes> {
        (!self.is_empty()).then(|| Bytes::from(self.to_query_string()))
    }

    /// Parse an encoded query string. Empty segments are skipped and a
    /// segment without `=` is read as a name with an empty value.
    pub fn parse(query: &str) -> Self {
        query
            .trim_start_matches('?')
            .split('&')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.split_once('=') {
                Some((name, value)) => (url_decode(name), url_decode(value)),
                None => (url_decode(segment), String::new()),
            })
            .collect()
    }
}

fn join_encoded<'a>(pairs: impl Iterator<Item = &'a (String, String)>) -> String {
    pairs
        .map(|(name, value)| format!("{}={}", url_encode(name), url_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = QueryParams::new();
        params.extend(iter);
        params
    }
}

impl<K, V> Extend<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.set(name, value);
        }
    }
}

/// Fully prepared request handed to the worker.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub verb: Verb,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl OutgoingRequest {
    /// Declared body length, present only when a body is attached.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }
}

/// Parse and validate the base endpoint.
pub fn parse_base_url(base: &str) -> Result<Url, BuildError> {
    let url = Url::parse(base).map_err(|source| BuildError::MalformedUrl {
        url: base.to_string(),
        source,
    })?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(BuildError::UnsupportedScheme(other.to_string())),
    }
}

/// Append the encoded query to `base`, keeping any query it already has.
pub fn build_url(base: &Url, query: &QueryParams) -> Url {
    if query.is_empty() {
        return base.clone();
    }

    let encoded = query.to_query_string();
    let combined = match base.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
        _ => encoded,
    };

    let mut url = base.clone();
    url.set_query(Some(&combined));
    url
}

/// Assemble the outgoing request.
///
/// Header order is authentication headers, caller headers, then the verb
/// defaults. A caller header never replaces an authentication header, and a
/// verb default is only added when the caller did not set that header.
/// `Content-Length` always matches the body. GET carries parameters in the URL
/// and never has a body; POST carries them as a fixed-length form body.
pub fn build(
    base: &Url,
    verb: Verb,
    query: &QueryParams,
    auth: Option<&AuthHeaders>,
    extra_headers: &HeaderMap,
) -> OutgoingRequest {
    let mut headers = HeaderMap::new();
    if let Some(auth) = auth {
        headers.extend(auth.headers().clone());
    }
    for (name, value) in extra_headers {
        if auth.is_some_and(|auth| auth.headers().contains_key(name)) {
            log::warn!("ignoring caller header '{}', it is reserved for authentication", name);
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let (url, body) = match verb {
        Verb::Get => {
            headers
                .entry(ACCEPT)
                .or_insert(HeaderValue::from_static(MIME_JSON));
            headers
                .entry(ACCEPT_CHARSET)
                .or_insert(HeaderValue::from_static(CHARSET_UTF8));
            headers.remove(CONTENT_LENGTH);
            (build_url(base, query), None)
        }
        Verb::Post => {
            headers
                .entry(CONTENT_TYPE)
                .or_insert(HeaderValue::from_static(MIME_FORM_URLENCODED));
            let body = query.to_form_body();
            match body {
                Some(ref data) => {
                    headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len()));
                }
                None => {
                    headers.remove(CONTENT_LENGTH);
                }
            }
            (base.clone(), body)
        }
    };

    OutgoingRequest {
        verb,
        url,
        headers,
        body,
    }
}
