//! Named, immutable topic sets per service area.
//!
//! Topics are hierarchical strings separated by `/`. Stable topics are service
//! entry points; reply topics are derived per call (`<topic>/<correlation id>`).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{BridgeError, Result};

/// Separator between topic levels.
pub const TOPIC_SEPARATOR: char = '/';

/// Suffix of each service's diagnostic topic.
pub const TEST_TOPIC_SUFFIX: &str = "test";

/// Immutable set of topics owned by one service area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    name: String,
    topics: Arc<[String]>,
}

impl TopicSet {
    pub fn new<I, S>(name: impl Into<String>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Exact-match lookup.
    pub fn find(&self, topic: &str) -> Result<&str> {
        self.topics
            .iter()
            .find(|t| t.as_str() == topic)
            .map(String::as_str)
            .ok_or_else(|| BridgeError::TopicNotFound {
                set: self.name.clone(),
                topic: topic.to_string(),
            })
    }

    /// The set's `<name>/test` diagnostic topic, if it owns one.
    pub fn test_topic(&self) -> Option<&str> {
        let wanted = format!("{}{}{}", self.name, TOPIC_SEPARATOR, TEST_TOPIC_SUFFIX);
        self.find(&wanted).ok()
    }
}

/// Registry of topic sets keyed by set name.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    sets: BTreeMap<String, TopicSet>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog of the services shipped with the system.
    pub fn builtin() -> Self {
        Self::new()
            .with_set(TopicSet::new("user", ["user/test", "POST/users"]))
            .with_set(TopicSet::new("admin", ["admin/test"]))
            .with_set(TopicSet::new("ad", ["ad/test"]))
            .with_set(TopicSet::new("chat", ["chat/test"]))
            .with_set(TopicSet::new("notification", ["notification/test"]))
    }

    /// Built-in catalog with configured sets layered on top.
    ///
    /// A configured set replaces a built-in set of the same name.
    pub fn from_config(overrides: &HashMap<String, Vec<String>>) -> Self {
        overrides
            .iter()
            .fold(Self::builtin(), |registry, (name, topics)| {
                registry.with_set(TopicSet::new(name.clone(), topics.iter().cloned()))
            })
    }

    pub fn with_set(mut self, set: TopicSet) -> Self {
        self.sets.insert(set.name().to_string(), set);
        self
    }

    pub fn set(&self, name: &str) -> Result<&TopicSet> {
        self.sets.get(name).ok_or_else(|| BridgeError::TopicNotFound {
            set: name.to_string(),
            topic: String::new(),
        })
    }

    /// Exact-match lookup of `topic` within set `name`.
    pub fn find(&self, name: &str, topic: &str) -> Result<&str> {
        self.set(name)?.find(topic)
    }

    pub fn sets(&self) -> impl Iterator<Item = &TopicSet> {
        self.sets.values()
    }
}

/// Check if a topic matches a subscription filter.
///
/// Matching rules:
/// - `#` matches all topics; `a/#` matches `a` and everything below it
/// - `+` matches exactly one level
/// - Otherwise levels must be equal
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split(TOPIC_SEPARATOR);
    let mut filter_levels = filter.split(TOPIC_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Per-call reply topic: `<topic>/<discriminator>`.
pub fn reply_topic_for(topic: &str, discriminator: &str) -> String {
    format!("{}{}{}", topic, TOPIC_SEPARATOR, discriminator)
}
