//! Typed accessors over the upstream JSON endpoints
//!
//! Four payload shapes are supported:
//! - list: `{"<array_key>": [...]}` (missing key is a schema error)
//! - flat: `[...]`
//! - lookup: `{"<array_key>": [...]}` for one `(a, b)` parameter pair, where an empty or
//!   `null` array means "no rows for this pair" and a missing key is a schema error
//! - detail: `{"<array_key>": [...]}` for one id, where a missing key also means no rows
//!
//! Decoding is split from navigation so the shape rules can be tested on plain strings.

use crate::config::{DetailEndpoint, FlatEndpoint, ListEndpoint, LookupEndpoint, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::fetch_with_retry;
use crate::session::Session;
use crate::types::{ReferenceId, Row};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Endpoint accessors bound to one authenticated session
#[derive(Clone)]
pub struct EndpointClient {
    session: Arc<Session>,
    base: Url,
}

impl EndpointClient {
    /// Create a client resolving endpoint paths against `base`
    pub fn new(session: Arc<Session>, base: Url) -> Self {
        Self { session, base }
    }

    /// The session navigations go through
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Fetch a list endpoint and return its array field
    pub async fn fetch_list(&self, endpoint: &ListEndpoint) -> Result<Vec<Row>> {
        let url = self.url(&endpoint.path)?;
        let page = self.session.navigate(&url).await?;
        decode_list(url.as_str(), &page.text, &endpoint.array_key)
    }

    /// Fetch a flat-array endpoint
    pub async fn fetch_flat(&self, endpoint: &FlatEndpoint) -> Result<Vec<Row>> {
        let url = self.url(&endpoint.path)?;
        let page = self.session.navigate(&url).await?;
        decode_flat(url.as_str(), &page.text)
    }

    /// Fetch the rows of a lookup endpoint for one `(a, b)` pair
    ///
    /// Empty when the endpoint has no rows for the pair.
    pub async fn fetch_lookup(
        &self,
        endpoint: &LookupEndpoint,
        a: ReferenceId,
        b: ReferenceId,
    ) -> Result<Vec<Row>> {
        let url = self.lookup_url(endpoint, a, b)?;
        let page = self.session.navigate(&url).await?;
        decode_lookup(url.as_str(), &page.text, &endpoint.array_key)
    }

    /// [`Self::fetch_lookup`] with bounded retry on transient render errors
    pub async fn fetch_lookup_with_retry(
        &self,
        retry: &RetryConfig,
        endpoint: &LookupEndpoint,
        a: ReferenceId,
        b: ReferenceId,
    ) -> Result<Vec<Row>> {
        fetch_with_retry(retry, || self.fetch_lookup(endpoint, a, b)).await
    }

    /// `<base><path>?<static query>&<dim_a>=<a>&<dim_b>=<b>`
    pub fn lookup_url(
        &self,
        endpoint: &LookupEndpoint,
        a: ReferenceId,
        b: ReferenceId,
    ) -> Result<Url> {
        let mut url = self.url(&endpoint.path)?;
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in &endpoint.static_query {
                query.append_pair(name, value);
            }
            query.append_pair(&endpoint.dim_a, &a.to_string());
            query.append_pair(&endpoint.dim_b, &b.to_string());
        }
        Ok(url)
    }

    /// Fetch the rows of a detail endpoint for one id
    pub async fn fetch_detail(
        &self,
        endpoint: &DetailEndpoint,
        id: ReferenceId,
    ) -> Result<Vec<Row>> {
        let url = self.detail_url(endpoint, id)?;
        let page = self.session.navigate(&url).await?;
        decode_detail(url.as_str(), &page.text, &endpoint.array_key)
    }

    /// [`Self::fetch_detail`] with bounded retry on transient render errors
    pub async fn fetch_detail_with_retry(
        &self,
        retry: &RetryConfig,
        endpoint: &DetailEndpoint,
        id: ReferenceId,
    ) -> Result<Vec<Row>> {
        fetch_with_retry(retry, || self.fetch_detail(endpoint, id)).await
    }

    /// `<base><path>?<id_param>=<id>`
    pub fn detail_url(&self, endpoint: &DetailEndpoint, id: ReferenceId) -> Result<Url> {
        let mut url = self.url(&endpoint.path)?;
        url.query_pairs_mut()
            .append_pair(&endpoint.id_param, &id.to_string());
        Ok(url)
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(|e| Error::Config {
            message: format!("invalid endpoint path {:?}: {}", path, e),
            key: None,
        })
    }
}

fn parse(url: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|source| Error::Decode {
        url: url.to_string(),
        source,
    })
}

/// Decode `{"<key>": [...]}`; the key must be present and hold an array
pub fn decode_list(url: &str, text: &str, key: &str) -> Result<Vec<Row>> {
    match parse(url, text)? {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => into_rows(url, items),
            Some(other) => Err(Error::schema(
                url,
                format!("field `{}` is {}, expected an array", key, type_name(&other)),
            )),
            None => Err(Error::schema(url, format!("missing field `{}`", key))),
        },
        other => Err(Error::schema(
            url,
            format!("expected an object, got {}", type_name(&other)),
        )),
    }
}

/// Decode a bare `[...]` payload
pub fn decode_flat(url: &str, text: &str) -> Result<Vec<Row>> {
    match parse(url, text)? {
        Value::Array(items) => into_rows(url, items),
        other => Err(Error::schema(
            url,
            format!("expected an array, got {}", type_name(&other)),
        )),
    }
}

/// Decode a lookup payload; `[]` and `null` mean no rows, a missing key is an error
pub fn decode_lookup(url: &str, text: &str, key: &str) -> Result<Vec<Row>> {
    match parse(url, text)? {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => into_rows(url, items),
            Some(Value::Null) => Ok(Vec::new()),
            Some(other) => Err(Error::schema(
                url,
                format!("field `{}` is {}, expected an array", key, type_name(&other)),
            )),
            None => Err(Error::schema(url, format!("missing field `{}`", key))),
        },
        other => Err(Error::schema(
            url,
            format!("expected an object, got {}", type_name(&other)),
        )),
    }
}

/// Decode a detail payload; a missing key, `[]` or `null` all mean no rows
pub fn decode_detail(url: &str, text: &str, key: &str) -> Result<Vec<Row>> {
    match parse(url, text)? {
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => into_rows(url, items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(Error::schema(
                url,
                format!("field `{}` is {}, expected an array", key, type_name(&other)),
            )),
        },
        other => Err(Error::schema(
            url,
            format!("expected an object, got {}", type_name(&other)),
        )),
    }
}

/// Project an integer id column out of decoded rows, in row order
pub fn reference_ids(rows: &[Row], key: &str) -> Result<Vec<ReferenceId>> {
    rows.iter()
        .enumerate()
        .map(|(index, row)| match row.get(key) {
            Some(Value::Number(n)) => n.as_i64().map(ReferenceId).ok_or_else(|| {
                Error::schema(key, format!("row {}: `{}` is not an integer", index, key))
            }),
            Some(Value::String(s)) => s.trim().parse().map_err(|_| {
                Error::schema(key, format!("row {}: `{}` is not an integer", index, key))
            }),
            _ => Err(Error::schema(
                key,
                format!("row {}: missing field `{}`", index, key),
            )),
        })
        .collect()
}

fn into_rows(url: &str, items: Vec<Value>) -> Result<Vec<Row>> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(row) => Ok(row),
            other => Err(Error::schema(
                url,
                format!("element {} is {}, expected an object", index, type_name(&other)),
            )),
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
