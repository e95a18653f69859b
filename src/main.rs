use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use script_reloc::decoder::CapstoneDecoder;
use script_reloc::explore::{explore, EntryPoint, ExternalReference};
use script_reloc::format::OutputFormat;
use script_reloc::patch::{RegionImage, WriteRecord};
use script_reloc::relocate::{encode_translations, RelocateOptions, Relocator};
use script_reloc::script::{self, ScriptEvent, ScriptKey, ScriptKind, ScriptLocation};
use script_reloc::strategy::PackingStrategy;
use script_reloc::translation::{read_translation_file, CsvTranslations, TranslationSource, TranslationTable};
use script_reloc::{Address, Region};

fn parse_hex(s: &str) -> Result<Address, String> {
    let digits = s.trim_start_matches("0x");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid address '{}': {}", s, e))
}

#[derive(Debug, Clone, Args)]
struct ScriptArgs {
    /// Raw script bytes as loaded into memory.
    image: PathBuf,

    /// Which kind of script the image holds.
    #[arg(long, value_enum, default_value_t = ScriptKind::Scenario)]
    kind: ScriptKind,

    /// Disk location of the script (cc.hh.ss); selects per-script recognizers.
    #[arg(long)]
    key: Option<ScriptKey>,

    /// Load address (default: the kind's usual base).
    #[arg(long, value_parser = parse_hex)]
    base: Option<Address>,

    /// Explicit code entry points, replacing the usual ones.
    #[arg(long = "entry", value_parser = parse_hex)]
    entries: Vec<Address>,

    /// Explicit event entry points.
    #[arg(long = "event-entry", value_parser = parse_hex)]
    event_entries: Vec<Address>,
}

impl ScriptArgs {
    fn key(&self) -> ScriptKey {
        self.key.unwrap_or_default()
    }

    fn base(&self) -> Address {
        self.base.unwrap_or_else(|| self.kind.base())
    }

    fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.image).with_context(|| format!("failed to read {}", self.image.display()))
    }
}

#[derive(Debug, Parser)]
#[command(name = "script-reloc")]
#[command(about = "Extract, re-encode and relocate event scripts in 16-bit game binaries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover and print the events of a script.
    Events {
        #[command(flatten)]
        script: ScriptArgs,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Encode translations and relocate them inside the script.
    Relocate {
        #[command(flatten)]
        script: ScriptArgs,

        /// Translation CSV, or a directory holding Scenarios/ and Combats/.
        #[arg(long)]
        translations: Option<PathBuf>,

        /// Relocation options as JSON.
        #[arg(long)]
        options: Option<PathBuf>,

        /// Packing strategy, overriding the options file.
        #[arg(long, value_enum)]
        strategy: Option<PackingStrategy>,

        /// Zero bytes at the end of the image that may hold text.
        #[arg(long)]
        trailing_free: Option<usize>,

        /// Write the patched image here instead of printing the writes.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

struct Discovery {
    entries: Vec<EntryPoint>,
    events: Vec<ScriptEvent>,
    externals: Vec<ExternalReference>,
}

fn discover(args: &ScriptArgs, region: Region<'_>) -> Result<Discovery> {
    let key = args.key();
    let entries: Vec<EntryPoint> = if args.entries.is_empty() && args.event_entries.is_empty() {
        script::entry_points(args.kind, key, region).context("failed to find entry points")?
    } else {
        args.entries
            .iter()
            .map(|&a| EntryPoint::code(a))
            .chain(args.event_entries.iter().map(|&a| EntryPoint::event(a)))
            .collect()
    };

    let recognizers = script::recognizers(args.kind, key);
    let decoder = CapstoneDecoder::new()?;
    let graph = explore(region, &entries, &recognizers, &decoder).context("exploration failed")?;
    let events = script::collect_events(&graph)?;
    let externals = graph.external_references().to_vec();
    Ok(Discovery { entries, events, externals })
}

fn load_translations(path: Option<&Path>, kind: ScriptKind, key: ScriptKey) -> Result<TranslationTable> {
    let table = match path {
        None => TranslationTable::new(),
        Some(dir) if dir.is_dir() => CsvTranslations::new(dir).load(kind, key)?,
        Some(file) => read_translation_file(file).with_context(|| format!("failed to read {}", file.display()))?,
    };
    Ok(table)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Events { script, format } => {
            let data = script.read()?;
            let region = Region::new(script.base(), &data);
            let discovery = discover(&script, region)?;

            for external in &discovery.externals {
                log::info!("External {} reference to 0x{:04x}", external.kind, external.target_addr);
            }
            print!("{}", format.get_formatter().format(&discovery.events)?);
            Ok(())
        }
        Commands::Relocate {
            script,
            translations,
            options,
            strategy,
            trailing_free,
            output,
        } => {
            let data = script.read()?;
            let base = script.base();
            let region = Region::new(base, &data);
            let discovery = discover(&script, region)?;

            let mut options: RelocateOptions = match options {
                Some(path) => {
                    let text = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
                    serde_json::from_str(&text).with_context(|| format!("invalid options in {}", path.display()))?
                }
                None => RelocateOptions::default(),
            };
            if let Some(strategy) = strategy {
                options.strategy = strategy;
            }
            if let Some(unused) = trailing_free {
                let location = ScriptLocation { sector_addresses: vec![0], sector_length: data.len(), trailing_unused: unused };
                options.trailing_free = location.trailing_free_span(base);
            }
            options.slot_limits.extend(script::slot_limits(script.kind, &discovery.entries));

            let table = load_translations(translations.as_deref(), script.kind, script.key())?;
            let encoded = encode_translations(&discovery.events, &table, &options.slot_limits)?;
            let relocation = Relocator::new(options)
                .relocate(&discovery.events, encoded, &discovery.externals)
                .context("relocation failed")?;

            match output {
                Some(path) => {
                    let mut image = RegionImage::new(base, data.clone());
                    relocation.write_to(&mut image)?;
                    fs::write(&path, image.into_bytes()).with_context(|| format!("failed to write {}", path.display()))?;
                    let moved = relocation.blocks.iter().filter(|b| b.address != b.original).count();
                    println!("patched: {} ({} events moved)", path.display(), moved);
                }
                None => {
                    let mut records: Vec<WriteRecord> = Vec::new();
                    relocation.write_to(&mut records)?;
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
            }
            Ok(())
        }
    }
}
