//! Message formatting: plain rendered text or a structured JSON envelope.
//!
//! Structured payloads look like:
//!
//! ```json
//! {
//!   "@source": "log://web-01/orders.api",
//!   "@timestamp": "2024-03-01T12:00:00Z",
//!   "@message": "order placed",
//!   "@fields": { "order_id": 42 },
//!   "@tags": ["audit"],
//!   "@type": "amqp",
//!   "level": "Info"
//! }
//! ```

use std::sync::Arc;

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::event::LogEvent;
use crate::layout::{Layout, TemplateLayout};

/// Value of the `@type` key.
pub const ENVELOPE_TYPE: &str = "amqp";

/// Field name used for the rendered exception.
pub const EXCEPTION_FIELD: &str = "exception";

/// Property names that carry dynamic fields and tags in untyped pipelines.
/// They are never copied into the envelope as plain fields.
pub const RESERVED_PROPERTIES: [&str; 2] = ["fields", "tags"];

/// Errors raised while formatting a message.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Static field rendered from a layout.
#[derive(Clone)]
pub struct Field {
    name: String,
    layout: Arc<dyn Layout>,
}

impl Field {
    pub fn new(name: impl Into<String>, layout: impl Layout + 'static) -> Self {
        Self {
            name: name.into(),
            layout: Arc::new(layout),
        }
    }

    /// Build from configuration, where either part may be missing.
    pub fn from_config(
        name: Option<String>,
        layout: Option<TemplateLayout>,
    ) -> Result<Self, FormatError> {
        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| FormatError::Configuration("static field has no name".to_string()))?;
        let layout = layout.ok_or_else(|| {
            FormatError::Configuration(format!("static field '{}' has no layout", name))
        })?;
        Ok(Self::new(name, layout))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self, event: &LogEvent) -> String {
        self.layout.render(event)
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field").field("name", &self.name).finish()
    }
}

/// Structured representation of one event.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "@source")]
    pub source: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    #[serde(rename = "@message")]
    pub message: String,
    #[serde(rename = "@fields")]
    pub fields: Option<Map<String, Value>>,
    #[serde(rename = "@tags")]
    pub tags: Option<Vec<String>>,
    #[serde(rename = "@type")]
    pub kind: String,
    pub level: String,
}

impl Envelope {
    /// Add a field. Null values are skipped; an existing name keeps its
    /// first value and the later write is rejected.
    pub fn add_field(&mut self, name: &str, value: Value) -> bool {
        if value.is_null() {
            return false;
        }
        let fields = self.fields.get_or_insert_with(Map::new);
        if fields.contains_key(name) {
            warn!(field = %name, "duplicate envelope field rejected");
            return false;
        }
        fields.insert(name.to_string(), value);
        true
    }

    /// Add a tag unless already present.
    pub fn add_tag(&mut self, tag: &str) {
        let tags = self.tags.get_or_insert_with(Vec::new);
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }

    pub fn has_fields(&self) -> bool {
        self.fields.as_ref().is_some_and(|f| !f.is_empty())
    }

    /// Make sure `@fields` and `@tags` serialize as empty collections
    /// rather than `null`.
    pub fn ensure_present(&mut self) {
        self.fields.get_or_insert_with(Map::new);
        self.tags.get_or_insert_with(Vec::new);
    }
}

/// Formatting options for [`EnvelopeBuilder`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    /// Emit a JSON envelope instead of plain rendered text.
    pub structured: bool,
    /// Use the rendered layout as `@message` instead of the event text.
    pub layout_as_message: bool,
    /// Scheme of the `@source` URI.
    pub source_scheme: String,
    /// Host part of the `@source` URI, resolved once at startup.
    pub source_host: String,
}

/// Builds message bodies from events.
pub struct EnvelopeBuilder {
    layout: Arc<dyn Layout>,
    fields: Vec<Field>,
    options: EnvelopeOptions,
}

impl EnvelopeBuilder {
    pub fn new(layout: Arc<dyn Layout>, fields: Vec<Field>, options: EnvelopeOptions) -> Self {
        Self {
            layout,
            fields,
            options,
        }
    }

    pub fn is_structured(&self) -> bool {
        self.options.structured
    }

    /// Format an event into message bytes.
    pub fn build(&self, event: &LogEvent) -> Result<Vec<u8>, FormatError> {
        if !self.options.structured {
            return Ok(self.layout.render(event).into_bytes());
        }
        let envelope = self.envelope(event);
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Assemble the structured envelope for an event.
    pub fn envelope(&self, event: &LogEvent) -> Envelope {
        let message = if self.options.layout_as_message {
            self.layout.render(event)
        } else {
            event.message.clone()
        };

        let mut envelope = Envelope {
            source: format!(
                "{}://{}/{}",
                self.options.source_scheme, self.options.source_host, event.logger
            ),
            timestamp: event
                .timestamp
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            message,
            fields: None,
            tags: None,
            kind: ENVELOPE_TYPE.to_string(),
            level: event.level.name().to_string(),
        };

        if let Some(exception) = &event.exception {
            envelope.add_field(EXCEPTION_FIELD, Value::String(exception.clone()));
        }

        if let Some(fields) = &event.fields {
            for (name, value) in fields.iter() {
                envelope.add_field(name, value.clone());
            }
        }

        if let Some(tags) = &event.tags {
            for tag in tags {
                envelope.add_tag(tag);
            }
        }

        let mut properties = Map::new();
        for (name, value) in &event.properties {
            if name.is_empty() || RESERVED_PROPERTIES.contains(&name.as_str()) {
                continue;
            }
            properties.insert(name.clone(), value.clone());
        }
        for (name, value) in properties {
            envelope.add_field(&name, value);
        }

        // Checked per static field: once the first one lands the map is no
        // longer empty, so later static fields are never added.
        for field in &self.fields {
            if !envelope.has_fields() {
                envelope.add_field(field.name(), Value::String(field.render(event)));
            }
        }

        envelope.ensure_present();
        envelope
    }
}
