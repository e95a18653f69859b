//! Translation tables: event text keyed by the event's hex address.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::script::{ScriptEvent, ScriptKey, ScriptKind};
use crate::Error;

/// One row of a translation file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranslationEntry {
    /// Text as extracted
    pub original: String,
    /// Replacement text; `None` keeps the original
    pub translation: Option<String>,
}

impl TranslationEntry {
    /// The text to encode for this event
    pub fn text(&self) -> &str {
        self.translation.as_deref().unwrap_or(&self.original)
    }
}

/// Entries keyed by lowercase 4-digit hex address, e.g. `e04a`.
pub type TranslationTable = BTreeMap<String, TranslationEntry>;

/// Somewhere translation tables can be loaded from.
pub trait TranslationSource {
    fn load(&self, kind: ScriptKind, key: ScriptKey) -> Result<TranslationTable, Error>;
}

/// A directory tree of CSV files, `<root>/Scenarios/<key>.csv` and
/// `<root>/Combats/<key>.csv`.
#[derive(Debug, Clone)]
pub struct CsvTranslations {
    root: PathBuf,
}

impl CsvTranslations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, kind: ScriptKind, key: ScriptKey) -> PathBuf {
        self.root.join(kind.directory()).join(format!("{}.csv", key))
    }
}

impl TranslationSource for CsvTranslations {
    fn load(&self, kind: ScriptKind, key: ScriptKey) -> Result<TranslationTable, Error> {
        let path = self.path_for(kind, key);
        if !path.exists() {
            log::info!("No translations for {} {} at {}", kind, key, path.display());
            return Ok(TranslationTable::new());
        }
        read_translation_file(&path)
    }
}

/// Read a translation CSV from disk.
pub fn read_translation_file(path: &Path) -> Result<TranslationTable, Error> {
    read_translation_csv(File::open(path)?)
}

/// Parse translation rows of `address,original[,translation]`.
///
/// Rows keyed `*` hold notes and are skipped, as are rows with no key.
/// An empty translation cell means the original is kept.
pub fn read_translation_csv<R: Read>(reader: R) -> Result<TranslationTable, Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut table = TranslationTable::new();
    for record in rdr.records() {
        let record = record?;
        let key = record.get(0).unwrap_or("").trim().to_lowercase();
        if key.is_empty() || key == "*" {
            continue;
        }
        let original = record.get(1).unwrap_or("").to_string();
        let translation = record.get(2).filter(|t| !t.is_empty()).map(str::to_string);
        if table.insert(key.clone(), TranslationEntry { original, translation }).is_some() {
            log::warn!("Duplicate translation row for {}", key);
        }
    }
    Ok(table)
}

/// Write extracted events as `address,text` rows, every field quoted.
pub fn write_translation_csv<W: Write>(writer: W, events: &[ScriptEvent]) -> Result<(), Error> {
    let mut wtr = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_writer(writer);
    for event in events {
        wtr.write_record([format!("{:04x}", event.addr).as_str(), event.text.as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_read_rows() {
        let input = "\"*\",\"notes\",\"\"\n\
                     \"e040\",\"Hi<RETN>\",\"Hello<RETN>\"\n\
                     \"E060\",\"Yo<RETN>\",\"\"\n\
                     \"e070\",\"<CALL><JUMPe040>\"\n";
        let table = read_translation_csv(input.as_bytes()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table["e040"].text(), "Hello<RETN>");
        assert_eq!(table["e060"].translation, None);
        assert_eq!(table["e060"].text(), "Yo<RETN>");
        assert_eq!(table["e070"].original, "<CALL><JUMPe040>");
    }

    #[test]
    fn test_multiline_text_survives() {
        let events = vec![ScriptEvent {
            addr: 0xe040,
            length: 6,
            relocatable: true,
            text: "Hi<N>\n\"Yo\"<RETN>".to_string(),
            references: Vec::new(),
        }];
        let mut out = Vec::new();
        write_translation_csv(&mut out, &events).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("\"e040\",\"Hi<N>\n\"\"Yo\"\"<RETN>\""));

        let table = read_translation_csv(text.as_bytes()).unwrap();
        assert_eq!(table["e040"].original, events[0].text);
    }

    #[test]
    fn test_csv_directory_layout() {
        let dir = TempDir::new().unwrap();
        let source = CsvTranslations::new(dir.path());
        let key = ScriptKey::new(0x1c, 0x00, 0x21);

        let path = source.path_for(ScriptKind::Scenario, key);
        assert!(path.ends_with("Scenarios/1c.00.21.csv"));
        assert!(source.load(ScriptKind::Scenario, key).unwrap().is_empty());

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "\"e100\",\"A\",\"B\"\n").unwrap();
        let table = source.load(ScriptKind::Scenario, key).unwrap();
        assert_eq!(table["e100"].text(), "B");
    }
}
