//! JSON and JSON Lines output formatters

use serde::Serialize;

use super::EventFormatter;
use crate::script::{EventReference, ScriptEvent};
use crate::Error;

/// Serializable reference for JSON output
#[derive(Serialize)]
struct ReferenceJson {
    /// Field holding the target, if known
    source: Option<String>,
    target: String,
    /// Event the field lives in
    #[serde(skip_serializing_if = "Option::is_none")]
    source_event: Option<String>,
}

/// Serializable event for JSON output
#[derive(Serialize)]
struct EventJson {
    address: String,
    length: usize,
    relocatable: bool,
    text: String,
    references: Vec<ReferenceJson>,
}

fn hex(addr: u16) -> String {
    format!("0x{:04x}", addr)
}

fn reference_to_json(reference: &EventReference) -> ReferenceJson {
    ReferenceJson {
        source: reference.source_addr.map(hex),
        target: hex(reference.target_addr),
        source_event: reference.source_event.map(hex),
    }
}

fn event_to_json(event: &ScriptEvent) -> EventJson {
    EventJson {
        address: hex(event.addr),
        length: event.length,
        relocatable: event.relocatable,
        text: event.text.clone(),
        references: event.references.iter().map(reference_to_json).collect(),
    }
}

impl EventFormatter for super::JsonFormatter {
    fn format(&self, events: &[ScriptEvent]) -> Result<String, Error> {
        let events: Vec<EventJson> = events.iter().map(event_to_json).collect();
        Ok(serde_json::to_string_pretty(&events)?)
    }
}

impl EventFormatter for super::JsonLinesFormatter {
    fn format(&self, events: &[ScriptEvent]) -> Result<String, Error> {
        let mut output = String::new();
        for event in events {
            output.push_str(&serde_json::to_string(&event_to_json(event))?);
            output.push('\n');
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::super::tests::sample;
    use super::super::{JsonFormatter, JsonLinesFormatter};
    use super::*;

    #[test]
    fn test_json_array() {
        let output = JsonFormatter.format(&sample()).unwrap();
        let value: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(value[0]["address"], "0xe040");
        assert_eq!(value[0]["references"][0]["source"], "0xe001");
        assert!(value[0]["references"][0].get("source_event").is_none());
        assert_eq!(value[1]["relocatable"], false);
        assert_eq!(value[1]["references"][0]["source"], Value::Null);
    }

    #[test]
    fn test_json_lines() {
        let output = JsonLinesFormatter.format(&sample()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["text"], "Name");
    }
}
