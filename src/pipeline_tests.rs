#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use crate::{
        event::{decode_event, format_event},
        explore::{explore, EntryPoint},
        format::OutputFormat,
        patch::{PatchWriter, RegionImage, WriteRecord},
        recognizer::{EventCall, Recognizer},
        relocate::{encode_translations, RelocateOptions, Relocator},
        script::{collect_events, ScriptEvent},
        space::FreeSpan,
        strategy::PackingStrategy,
        testing::ScriptedSource,
        translation::{TranslationEntry, TranslationTable},
        Address, Error, Reg, Region,
    };

    /// A small scenario-like image: three routines each showing one event,
    /// plus a name slot reached only from a fixed root.
    fn script_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x100];
        // e040: "Hi" ret "Yo" ret, shown in two calls
        data[0x40..0x46].copy_from_slice(b"Hi\x07Yo\x07");
        // e060: "A" jump e040
        data[0x60..0x64].copy_from_slice(&[0x41, 0x0f, 0x40, 0xe0]);
        // e070: call e040, ret
        data[0x70..0x74].copy_from_slice(&[0x10, 0x40, 0xe0, 0x07]);
        // e080: "Name", end
        data[0x80..0x85].copy_from_slice(b"Name\x00");
        data
    }

    fn script_source() -> ScriptedSource {
        ScriptedSource::new()
            .mov_imm(0xe000, Reg::Si, 0xe040)
            .call(0xe003, 0x6e77)
            .call(0xe006, 0x6e77)
            .ret(0xe009)
            .mov_imm(0xe010, Reg::Si, 0xe060)
            .call(0xe013, 0x6e77)
            .ret(0xe016)
            .mov_imm(0xe020, Reg::Si, 0xe070)
            .call(0xe023, 0x6e77)
            .ret(0xe026)
    }

    fn entries() -> Vec<EntryPoint> {
        vec![
            EntryPoint::code(0xe000),
            EntryPoint::code(0xe010),
            EntryPoint::code(0xe020),
            EntryPoint::event(0xe080),
        ]
    }

    fn extract(data: &[u8]) -> Vec<ScriptEvent> {
        let region = Region::new(0xe000, data);
        let source = script_source();
        let recognizers: Vec<Box<dyn Recognizer>> = vec![Box::new(EventCall::default())];
        let graph = explore(region, &entries(), &recognizers, &source).unwrap();
        println!("Discovered {} blocks", graph.blocks().count());
        assert!(graph.external_references().is_empty());
        collect_events(&graph).unwrap()
    }

    fn translations() -> TranslationTable {
        let mut table = TranslationTable::new();
        table.insert(
            "e040".to_string(),
            TranslationEntry {
                original: "Hi<RETN>\n<CONT>Yo<RETN>".to_string(),
                translation: Some("Hello there<RETN>\n<CONT>Yo<RETN>".to_string()),
            },
        );
        table
    }

    fn options(strategy: PackingStrategy) -> RelocateOptions {
        RelocateOptions {
            strategy,
            trailing_free: Some(FreeSpan { start: 0xe0c0, end: 0xe0ff }),
            slot_limits: Vec::new(),
        }
    }

    #[test]
    fn test_extract_events() {
        let data = script_image();
        let events = extract(&data);

        let summary: Vec<(Address, usize, bool)> = events.iter().map(|e| (e.addr, e.length, e.relocatable)).collect();
        assert_eq!(
            summary,
            vec![(0xe040, 6, true), (0xe060, 4, true), (0xe070, 4, true), (0xe080, 5, false)]
        );

        let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Hi<RETN>\n<CONT>Yo<RETN>", "A<JUMPe040>", "<CALLe040><RETN>", "Name"]);

        let fields: BTreeSet<(Option<Address>, Option<Address>)> =
            events[0].references.iter().map(|r| (r.source_addr, r.source_event)).collect();
        assert_eq!(
            fields,
            BTreeSet::from([(Some(0xe001), None), (Some(0xe062), Some(0xe060)), (Some(0xe071), Some(0xe070))])
        );

        let listing = OutputFormat::Csv.get_formatter().format(&events).unwrap();
        assert!(listing.starts_with("\"e040\",\"Hi<RETN>\n<CONT>Yo<RETN>\"\n"));
    }

    #[rstest]
    #[case(PackingStrategy::First, [0xe0c0, 0xe040, 0xe060])]
    #[case(PackingStrategy::Smallest, [0xe0c0, 0xe060, 0xe070])]
    #[case(PackingStrategy::Largest, [0xe0c0, 0xe0cf, 0xe0d3])]
    fn test_relocate_translated_script(#[case] strategy: PackingStrategy, #[case] expected: [Address; 3]) {
        let data = script_image();
        let events = extract(&data);

        let options = options(strategy);
        let encoded = encode_translations(&events, &translations(), &options.slot_limits).unwrap();
        assert_eq!(encoded[&0xe040].len(), 15);

        let relocation = Relocator::new(options).relocate(&events, encoded, &[]).unwrap();
        let placed: Vec<Address> = [0xe040, 0xe060, 0xe070].iter().map(|&a| relocation.address_of(a)).collect();
        assert_eq!(placed, expected);
        assert_eq!(relocation.address_of(0xe080), 0xe080);

        // Every code pointer follows its event
        let mut image = RegionImage::new(0xe000, data.clone());
        relocation.write_to(&mut image).unwrap();
        let patched = image.region();
        for (field, original) in [(0xe001, 0xe040), (0xe011, 0xe060), (0xe021, 0xe070)] {
            assert_eq!(patched.read_u16(field).unwrap(), relocation.address_of(original));
        }

        // ...and so does every pointer inside event text
        let jump = format_event(&patched, expected[1], None, &BTreeSet::new()).unwrap();
        assert_eq!(jump, format!("A<JUMP{:04x}>", expected[0]));
        let call = format_event(&patched, expected[2], None, &BTreeSet::new()).unwrap();
        assert_eq!(call, format!("<CALL{:04x}><RETN>", expected[0]));

        let moved = decode_event(&patched, 0xe0c0, Some(0xe0cc)).unwrap();
        let end = moved.last().unwrap().end();
        assert_eq!(end - 0xe0c0, 15);
    }

    #[test]
    fn test_patch_records() {
        let data = script_image();
        let events = extract(&data);
        let options = options(PackingStrategy::First);
        let encoded = encode_translations(&events, &translations(), &options.slot_limits).unwrap();
        let relocation = Relocator::new(options).relocate(&events, encoded, &[]).unwrap();

        let mut records: Vec<WriteRecord> = Vec::new();
        relocation.write_to(&mut records).unwrap();

        let moved_jump = records.iter().find(|r| r.address == 0xe040).unwrap();
        assert_eq!(moved_jump.bytes, vec![0x41, 0x0f, 0xc0, 0xe0]);

        let fixups: Vec<(Address, Vec<u8>)> = records[4..].iter().map(|r| (r.address, r.bytes.clone())).collect();
        assert_eq!(
            fixups,
            vec![(0xe001, vec![0xc0, 0xe0]), (0xe011, vec![0x40, 0xe0]), (0xe021, vec![0x60, 0xe0])]
        );

        // The same writes applied in order leave the image consistent
        let mut image = RegionImage::new(0xe000, data);
        for record in &records {
            image.write(record.address, &record.bytes).unwrap();
        }
        assert_eq!(image.region().read_u16(0xe001).unwrap(), 0xe0c0);
    }

    #[test]
    fn test_name_slot_is_truncated_in_place() {
        let data = script_image();
        let events = extract(&data);
        let mut table = translations();
        table.insert(
            "e080".to_string(),
            TranslationEntry { original: "Name".to_string(), translation: Some("Longer name".to_string()) },
        );

        let options = options(PackingStrategy::First);
        let encoded = encode_translations(&events, &table, &options.slot_limits).unwrap();
        assert!(encoded[&0xe080].truncated);

        let relocation = Relocator::new(options).relocate(&events, encoded, &[]).unwrap();
        let name = relocation.blocks.iter().find(|b| b.original == 0xe080).unwrap();
        assert_eq!(name.address, 0xe080);
        assert_eq!(name.bytes, b"Long\x00");
    }

    #[test]
    fn test_split_out_event_is_placed() {
        let data = script_image();
        let events = extract(&data);
        let mut table = translations();
        // e060 now jumps to new text that lives nowhere yet
        table.insert(
            "e060".to_string(),
            TranslationEntry { original: "A<JUMPe040>".to_string(), translation: Some("A<JUMPe0a0>".to_string()) },
        );
        table.insert(
            "e0a0".to_string(),
            TranslationEntry { original: String::new(), translation: Some("Bye<RETN>".to_string()) },
        );

        let options = options(PackingStrategy::First);
        let encoded = encode_translations(&events, &table, &options.slot_limits).unwrap();
        assert_eq!(encoded[&0xe0a0].bytes, b"Bye\x07");

        let relocation = Relocator::new(options).relocate(&events, encoded, &[]).unwrap();
        let placed: Vec<Address> = [0xe040, 0xe060, 0xe070, 0xe0a0].iter().map(|&a| relocation.address_of(a)).collect();
        assert_eq!(placed, vec![0xe0c0, 0xe040, 0xe060, 0xe070]);

        let split = relocation.blocks.iter().find(|b| b.original == 0xe0a0).unwrap();
        assert_eq!(split.address, 0xe070);

        let mut image = RegionImage::new(0xe000, data);
        relocation.write_to(&mut image).unwrap();
        let patched = image.region();
        assert_eq!(format_event(&patched, 0xe040, None, &BTreeSet::new()).unwrap(), "A<JUMPe070>");
        assert_eq!(format_event(&patched, 0xe070, None, &BTreeSet::new()).unwrap(), "Bye<RETN>");
    }

    #[test]
    fn test_translation_row_without_event() {
        let data = script_image();
        let events = extract(&data);
        let mut table = translations();
        table.insert(
            "e0a0".to_string(),
            TranslationEntry { original: String::new(), translation: Some("Stray<RETN>".to_string()) },
        );

        let err = encode_translations(&events, &table, &[]).unwrap_err();
        assert!(matches!(err, Error::UnmatchedTranslation(ref key) if key == "e0a0"));

        table.remove("e0a0");
        table.insert(
            "nope".to_string(),
            TranslationEntry { original: String::new(), translation: None },
        );
        let err = encode_translations(&events, &table, &[]).unwrap_err();
        assert!(matches!(err, Error::UnmatchedTranslation(ref key) if key == "nope"));
    }

    #[test]
    fn test_no_room_without_trailing_space() {
        let data = script_image();
        let events = extract(&data);
        let encoded = encode_translations(&events, &translations(), &[]).unwrap();

        let err = Relocator::default().relocate(&events, encoded, &[]).unwrap_err();
        println!("Relocation failed as expected: {}", err);
        assert!(matches!(err, Error::OutOfSpace { requested: 15, total: 14, largest: 6 }));
    }
}
