//! Rendering log events to text.
//!
//! The publisher only depends on the [`Layout`] trait. [`TemplateLayout`] is a
//! small `${token}` template engine for configuration-driven setups.

use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::Value;

use crate::event::LogEvent;

/// Turns an event into text.
pub trait Layout: Send + Sync {
    fn render(&self, event: &LogEvent) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Message,
    Level,
    Logger,
    Exception,
    Date,
    Property(String),
}

/// Template with `${message}`, `${level}`, `${logger}`, `${exception}`,
/// `${date}` and `${property:NAME}` tokens.
///
/// Unknown tokens and unterminated `${` are kept as literal text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub struct TemplateLayout {
    source: String,
    segments: Vec<Segment>,
}

impl TemplateLayout {
    pub fn new(template: impl Into<String>) -> Self {
        let source = template.into();
        let segments = parse(&source);
        Self { source, segments }
    }

    /// The template as written.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Default for TemplateLayout {
    fn default() -> Self {
        Self::new("${message}")
    }
}

impl From<String> for TemplateLayout {
    fn from(template: String) -> Self {
        Self::new(template)
    }
}

impl From<&str> for TemplateLayout {
    fn from(template: &str) -> Self {
        Self::new(template)
    }
}

impl Layout for TemplateLayout {
    fn render(&self, event: &LogEvent) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Message => out.push_str(&event.message),
                Segment::Level => out.push_str(event.level.name()),
                Segment::Logger => out.push_str(&event.logger),
                Segment::Exception => {
                    if let Some(exception) = &event.exception {
                        out.push_str(exception);
                    }
                }
                Segment::Date => out.push_str(
                    &event
                        .timestamp
                        .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                ),
                Segment::Property(name) => match event.property(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_string()),
                },
            }
        }
        out
    }
}

fn parse(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        literal.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            literal.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = &after[..end];
        match token_segment(token) {
            Some(segment) => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(segment);
            }
            None => literal.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    literal.push_str(rest);
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn token_segment(token: &str) -> Option<Segment> {
    match token {
        "message" => Some(Segment::Message),
        "level" => Some(Segment::Level),
        "logger" => Some(Segment::Logger),
        "exception" => Some(Segment::Exception),
        "date" => Some(Segment::Date),
        _ => token
            .strip_prefix("property:")
            .filter(|name| !name.is_empty())
            .map(|name| Segment::Property(name.to_string())),
    }
}
