//! Named changes-feed filters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A server-side filter applied to the remote changes feed.
///
/// Parameters are kept ordered so the filter contributes the same bytes to
/// a replication id regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullFilter {
    /// Filter name, e.g. `"app/by_owner"`.
    pub name: String,
    /// String parameters passed alongside the filter.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl PullFilter {
    /// Creates a filter without parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Creates a filter with the given parameters.
    pub fn with_parameters<I, K, V>(name: impl Into<String>, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            parameters: parameters
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Adds a single parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Query-string pairs: `filter=<name>` then each parameter in key order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.parameters.len() + 1);
        pairs.push(("filter".to_string(), self.name.clone()));
        pairs.extend(
            self.parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        pairs
    }
}
