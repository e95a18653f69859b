//! Output formats for extracted events

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::script::ScriptEvent;
use crate::Error;

/// Supported output formats for extracted events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Annotated listing (default)
    #[default]
    Text,
    /// JSON array of events
    Json,
    /// JSON Lines format (one event per line)
    JsonLines,
    /// Translation CSV (address, text)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Text, OutputFormat::Json, OutputFormat::JsonLines, OutputFormat::Csv]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn EventFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for extracted events
pub trait EventFormatter {
    fn format(&self, events: &[ScriptEvent]) -> Result<String, Error>;
}

/// Format events as an annotated listing
pub struct TextFormatter;

/// Format events in JSON
pub struct JsonFormatter;

/// Format events in JSON Lines
pub struct JsonLinesFormatter;

/// Format events as translation CSV
pub struct CsvFormatter;

impl EventFormatter for TextFormatter {
    fn format(&self, events: &[ScriptEvent]) -> Result<String, Error> {
        let mut output = String::new();

        for event in events {
            let status = if event.relocatable { "relocatable" } else { "fixed" };
            output.push_str(&format!("Event at 0x{:04x} ({} bytes, {}):\n", event.addr, event.length, status));

            for reference in &event.references {
                let field = reference
                    .source_addr
                    .map_or_else(|| "unknown".to_string(), |a| format!("0x{:04x}", a));
                match reference.source_event {
                    Some(from) => output.push_str(&format!(
                        "  <- 0x{:04x} from {} in event 0x{:04x}\n",
                        reference.target_addr, field, from
                    )),
                    None => output.push_str(&format!("  <- 0x{:04x} from {}\n", reference.target_addr, field)),
                }
            }

            for line in event.text.lines() {
                output.push_str("  | ");
                output.push_str(line);
                output.push('\n');
            }
            output.push('\n');
        }

        Ok(output)
    }
}
