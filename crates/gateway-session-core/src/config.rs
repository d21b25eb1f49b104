//! Runtime initialization data.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::Dispatcher;

/// Request context forwarded with a remote invocation.
pub type Context = HashMap<String, String>;

/// Data used to initialize a runtime instance.
///
/// Properties are plain strings so they can be loaded from any config
/// source; the dispatcher is supplied in code and never serialized.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime properties.
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// Executor for lifecycle notifications (e.g. a UI event loop).
    /// Notifications run on the calling task when absent.
    #[serde(skip)]
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl RuntimeConfig {
    /// Stringified proxy of a router to use instead of querying the router
    /// finder.
    pub const DEFAULT_ROUTER: &'static str = "Runtime.Default.Router";

    /// Invocation retry intervals; `-1` disables retries.
    pub const RETRY_INTERVALS: &'static str = "Runtime.RetryIntervals";

    /// Create an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_property(key, value);
        self
    }

    /// Set the notification dispatcher.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Get a property value. Empty values count as unset.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Set a property value.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Get a property parsed as an integer.
    #[must_use]
    pub fn property_as_int(&self, key: &str) -> Option<i64> {
        self.property(key).and_then(|v| v.trim().parse().ok())
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("properties", &self.properties)
            .field("dispatcher", &self.dispatcher.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_property_is_unset() {
        let config = RuntimeConfig::new().with_property(RuntimeConfig::DEFAULT_ROUTER, "");
        assert_eq!(config.property(RuntimeConfig::DEFAULT_ROUTER), None);
    }

    #[test]
    fn test_property_as_int() {
        let config = RuntimeConfig::new()
            .with_property(RuntimeConfig::RETRY_INTERVALS, "-1")
            .with_property("Other", "abc");
        assert_eq!(
            config.property_as_int(RuntimeConfig::RETRY_INTERVALS),
            Some(-1)
        );
        assert_eq!(config.property_as_int("Other"), None);
        assert_eq!(config.property_as_int("Missing"), None);
    }

    #[test]
    fn test_deserialize_properties_only() {
        let json = r#"{"properties": {"Runtime.RetryIntervals": "-1"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.property(RuntimeConfig::RETRY_INTERVALS), Some("-1"));
        assert!(config.dispatcher.is_none());

        let empty: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert!(empty.properties.is_empty());
    }
}
