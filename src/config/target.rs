//! Message formatting and buffering configuration types.

use serde::Deserialize;

use crate::broker::DeliveryMode;
use crate::codec::Compression;
use crate::envelope::{Field, FormatError};
use crate::layout::TemplateLayout;
use crate::publisher::OverflowPolicy;

/// Default routing key template. `{0}` is replaced by the level name.
pub const DEFAULT_TOPIC: &str = "logs.{0}";

/// Default `@source` URI scheme.
pub const DEFAULT_SOURCE_SCHEME: &str = "log";

/// Publisher target configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Routing key template; layout tokens are rendered, then `{0}` is
    /// replaced by the level name.
    pub topic: TemplateLayout,
    /// Application id property. Defaults to the event's logger name.
    pub app_id: Option<String>,
    /// Retry buffer capacity.
    pub max_buffer: usize,
    /// What to drop when the retry buffer is full.
    pub overflow: OverflowPolicy,
    pub compression: Compression,
    /// Emit the structured JSON envelope instead of plain text.
    pub use_json: bool,
    /// Use the rendered layout as `@message` in structured mode.
    pub use_layout_as_message: bool,
    /// Layout for plain text messages.
    pub layout: TemplateLayout,
    /// Host for the `@source` URI. Resolved from the environment when unset.
    pub source_host: Option<String>,
    pub source_scheme: String,
    pub delivery_mode: DeliveryMode,
    /// Static fields, used only when an event produced no fields.
    pub fields: Vec<FieldConfig>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            topic: TemplateLayout::new(DEFAULT_TOPIC),
            app_id: None,
            max_buffer: 1000,
            overflow: OverflowPolicy::default(),
            compression: Compression::None,
            use_json: false,
            use_layout_as_message: false,
            layout: TemplateLayout::default(),
            source_host: None,
            source_scheme: DEFAULT_SOURCE_SCHEME.to_string(),
            delivery_mode: DeliveryMode::default(),
            fields: Vec::new(),
        }
    }
}

impl TargetConfig {
    /// Validate and build the static field list.
    pub fn static_fields(&self) -> Result<Vec<Field>, FormatError> {
        self.fields
            .iter()
            .map(|f| Field::from_config(f.name.clone(), f.layout.clone()))
            .collect()
    }

    /// Host name for the `@source` URI.
    ///
    /// Uses `source_host` when set, otherwise `HOSTNAME`, then `COMPUTERNAME`,
    /// then `localhost`.
    pub fn resolve_source_host(&self) -> String {
        let non_empty = |h: &String| !h.is_empty();
        self.source_host
            .clone()
            .filter(non_empty)
            .or_else(|| std::env::var("HOSTNAME").ok().filter(non_empty))
            .or_else(|| std::env::var("COMPUTERNAME").ok().filter(non_empty))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// A static field entry as written in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub name: Option<String>,
    pub layout: Option<TemplateLayout>,
}
