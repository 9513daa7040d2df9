//! Topic → broker destination naming

use serde::{Deserialize, Serialize};

/// Maps a topic name to a broker destination name. Must be pure.
pub trait NamingStrategy: Send + Sync {
    fn destination(&self, topic: &str) -> String;
}

impl<F> NamingStrategy for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn destination(&self, topic: &str) -> String {
        self(topic)
    }
}

fn default_separator() -> String {
    "_".to_string()
}

/// Built-in naming strategies, selectable from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum QueueNaming {
    /// Destination equals the topic
    #[default]
    TopicName,
    /// Every topic maps to the same destination
    Constant { name: String },
    /// `topic + separator + suffix`
    TopicNameWithSuffix {
        suffix: String,
        #[serde(default = "default_separator")]
        separator: String,
    },
}

impl QueueNaming {
    pub fn constant(name: impl Into<String>) -> Self {
        QueueNaming::Constant { name: name.into() }
    }

    /// Suffix strategy with the default `_` separator
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        QueueNaming::TopicNameWithSuffix {
            suffix: suffix.into(),
            separator: default_separator(),
        }
    }
}

impl NamingStrategy for QueueNaming {
    fn destination(&self, topic: &str) -> String {
        match self {
            QueueNaming::TopicName => topic.to_string(),
            QueueNaming::Constant { name } => name.clone(),
            QueueNaming::TopicNameWithSuffix { suffix, separator } => {
                format!("{topic}{separator}{suffix}")
            }
        }
    }
}
