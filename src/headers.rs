//! Message headers and the trace-context carrier codec.
//!
//! [`Headers`] is an ordered string-to-string map attached to every record.
//! It doubles as the carrier for W3C trace context: an ambient
//! `opentelemetry` context is serialized into it on publish and extracted
//! from it on fetch, so causal linkage survives the broker boundary.

use indexmap::IndexMap;
use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Header key carrying the failure message on dead-lettered records.
pub const ERROR_HEADER: &str = "error";

/// Header key identifying the service that published a record.
pub const ORIGIN_HEADER: &str = "origin";

/// Ordered key-value header mapping.
///
/// Insertion order is preserved, matching how broker clients represent
/// header lists on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any existing value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Injector for Headers {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

impl Extractor for Headers {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Serialize a trace context into the given headers.
///
/// An empty or non-sampled context produces no headers rather than failing.
pub fn inject_context(context: &Context, headers: &mut Headers) {
    TraceContextPropagator::new().inject_context(context, headers);
}

/// Extract the trace context embedded in the given headers.
///
/// Headers without trace state yield the default (empty) context.
pub fn extract_context(headers: &Headers) -> Context {
    TraceContextPropagator::new().extract(headers)
}
