//! Log events handed to the publisher by the host logging pipeline.
//!
//! Dynamic fields and tags are carried as typed parameters rather than
//! reserved entries in the property bag.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::envelope::FormatError;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Name used in the envelope `level` key and in routing keys.
    pub fn name(&self) -> &'static str {
        match self {
            Level::Trace => "Trace",
            Level::Debug => "Debug",
            Level::Info => "Info",
            Level::Warn => "Warn",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dynamic fields attached to a single event.
///
/// Keys are unique; inserting an existing key overwrites its value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFields(BTreeMap<String, Value>);

impl EventFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, value)` tuples.
    ///
    /// A tuple without a name is a configuration error. Repeated names keep
    /// the last value.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, FormatError>
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (Option<K>, V)>,
    {
        let mut fields = Self::new();
        for (index, (name, value)) in pairs.into_iter().enumerate() {
            let name = name.ok_or_else(|| {
                FormatError::Configuration(format!("field tuple {} has no name", index))
            })?;
            fields.insert(name, value);
        }
        Ok(fields)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// One log event.
///
/// Owned by the caller; the publisher only reads it.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub logger: String,
    /// Message text after parameter substitution.
    pub message: String,
    /// Exception rendered to text, if the event carries one.
    pub exception: Option<String>,
    pub fields: Option<EventFields>,
    pub tags: Option<Vec<String>>,
    /// Ad hoc properties in insertion order.
    pub properties: Vec<(String, Value)>,
    pub parameters: Option<Vec<Value>>,
}

impl LogEvent {
    /// Create an event stamped with the current time.
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: logger.into(),
            message: message.into(),
            exception: None,
            fields: None,
            tags: None,
            properties: Vec::new(),
            parameters: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .get_or_insert_with(Vec::new)
            .extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .get_or_insert_with(EventFields::new)
            .insert(name, value);
        self
    }

    /// Attach fields given as `(name, value)` tuples.
    ///
    /// Fails when any tuple has no name.
    pub fn with_fields<K, V, I>(mut self, pairs: I) -> Result<Self, FormatError>
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (Option<K>, V)>,
    {
        let incoming = EventFields::from_pairs(pairs)?;
        let fields = self.fields.get_or_insert_with(EventFields::new);
        for (name, value) in incoming.0 {
            fields.insert(name, value);
        }
        Ok(self)
    }

    /// Attach an error, rendered with its chain of sources.
    pub fn with_exception(mut self, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut rendered = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        self.exception = Some(rendered);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Look up an ad hoc property; the last entry with the name wins.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Event time as whole seconds since the Unix epoch.
    pub fn epoch_seconds(&self) -> u64 {
        self.timestamp.timestamp().max(0) as u64
    }
}
