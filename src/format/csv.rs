//! CSV output formatter

use super::EventFormatter;
use crate::script::ScriptEvent;
use crate::translation::write_translation_csv;
use crate::Error;

impl EventFormatter for super::CsvFormatter {
    fn format(&self, events: &[ScriptEvent]) -> Result<String, Error> {
        let mut output = Vec::new();
        write_translation_csv(&mut output, events)?;
        String::from_utf8(output).map_err(|e| Error::InvalidRequest(format!("CSV output is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::sample;
    use super::super::CsvFormatter;
    use super::*;
    use crate::translation::read_translation_csv;

    #[test]
    fn test_csv_rows() {
        let output = CsvFormatter.format(&sample()).unwrap();
        assert!(output.ends_with("\"e080\",\"Name\"\n"));

        let table = read_translation_csv(output.as_bytes()).unwrap();
        assert_eq!(table["e040"].original, "Hi<RETN>\n<CONT>Yo<RETN>");
        assert_eq!(table["e040"].translation, None);
    }
}
