//! # ACDB CLI
//!
//! Builds calibration database files from JSON layouts and runs lookups
//! against them.
//!
//! ```text
//! acdb build layout.json out.acdb
//! acdb info out.acdb
//! acdb cal out.acdb --gkv 0xA0=1 --ckv 0xC1=5
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use acdb_core::config::{LogFormat, LoggingConfig};
use acdb_core::types::parse_u32;
use acdb_core::utils::format_bytes;
use acdb_core::{Config, KeyValuePair, KeyVector, ParamClass, SubgraphParamData};
use acdb_storage::file::{DatabaseBuilder, DatabaseLayout};
use acdb_storage::{unpack_blob, BlobEntry, CalibrationStore, DatabaseFile, FileSource};

#[derive(Parser)]
#[command(name = "acdb")]
#[command(version, about = "Audio calibration database tool")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a JSON database layout into a database file
    Build {
        layout: PathBuf,
        output: PathBuf,
    },
    /// Show database properties and the chunk directory
    Info { database: PathBuf },
    /// Resolve a graph key vector to its subgraphs
    Graph {
        #[command(flatten)]
        target: Target,
    },
    /// Fetch calibration for a graph
    Cal {
        #[command(flatten)]
        target: Target,
        /// Calibration key vector
        #[arg(long = "ckv", value_name = "KEY=VALUE")]
        ckv: Vec<KeyValuePair>,
        /// Previous calibration key vector, for delta lookups
        #[arg(long = "prior", value_name = "KEY=VALUE")]
        prior: Vec<KeyValuePair>,
    },
    /// Fetch tag-scoped data for a graph
    Tag {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = parse_u32)]
        tag_id: u32,
        /// Tag key vector
        #[arg(long = "tkv", value_name = "KEY=VALUE")]
        tkv: Vec<KeyValuePair>,
    },
    /// Fetch one module parameter
    Param {
        #[command(flatten)]
        target: Target,
        #[arg(long = "ckv", value_name = "KEY=VALUE")]
        ckv: Vec<KeyValuePair>,
        #[arg(long, value_parser = parse_u32)]
        subgraph: u32,
        #[arg(long, value_parser = parse_u32)]
        module: u32,
        #[arg(long, value_parser = parse_u32)]
        param: u32,
    },
    /// Override one module parameter; persisted when delta persistence is on
    Set {
        #[command(flatten)]
        target: Target,
        #[arg(long = "ckv", value_name = "KEY=VALUE")]
        ckv: Vec<KeyValuePair>,
        #[arg(long, value_parser = parse_u32)]
        subgraph: u32,
        #[arg(long, value_parser = parse_u32)]
        module: u32,
        #[arg(long, value_parser = parse_u32)]
        param: u32,
        /// Payload as hex bytes
        #[arg(long)]
        payload: String,
        /// Store in the global override list
        #[arg(long)]
        global: bool,
    },
}

#[derive(Args)]
struct Target {
    /// Database files to load, in registry order
    #[arg(required = true)]
    databases: Vec<PathBuf>,
    /// Graph key vector
    #[arg(long = "gkv", value_name = "KEY=VALUE", required = true)]
    gkv: Vec<KeyValuePair>,
}

impl Target {
    fn gkv(&self) -> KeyVector {
        KeyVector::new(self.gkv.clone())
    }

    fn open(&self, config: Config) -> Result<CalibrationStore> {
        let store = CalibrationStore::new(config)?;
        for path in &self.databases {
            store
                .add_database(path)
                .with_context(|| format!("loading {}", path.display()))?;
        }
        Ok(store)
    }
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_json_file(path).with_context(|| format!("reading config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim_start_matches("0x")).with_context(|| format!("invalid hex payload '{}'", text))
}

fn print_entries(entries: &[BlobEntry]) {
    for entry in entries {
        println!(
            "module {:#010x} param {:#010x} size {:>5}  {}",
            entry.module_iid,
            entry.param_id,
            entry.payload.len(),
            hex::encode(&entry.payload)
        );
    }
}

/// Two-call fetch: size query, then fill
fn fetch<F>(mut call: F) -> Result<Vec<BlobEntry>>
where
    F: FnMut(Option<&mut [u8]>) -> acdb_core::Result<usize>,
{
    let size = call(None)?;
    let mut out = vec![0u8; size];
    call(Some(&mut out))?;
    Ok(unpack_blob(&out)?)
}

fn build(layout_path: &Path, output: &Path) -> Result<()> {
    let text = fs::read_to_string(layout_path).with_context(|| format!("reading {}", layout_path.display()))?;
    let layout: DatabaseLayout = serde_json::from_str(&text).with_context(|| format!("parsing {}", layout_path.display()))?;
    let written = DatabaseBuilder::from_layout(layout).write_to(output)?;
    info!("Wrote {} ({})", output.display(), format_bytes(written));
    Ok(())
}

fn show_info(path: &Path, config: &Config) -> Result<()> {
    let file = DatabaseFile::open(path, config.database.verify_checksum)?;
    let properties = file.properties()?;

    println!("database   {:#x}", properties.database_id);
    println!("vm         {:#x}", properties.vm_id);
    println!(
        "subgraphs  {:#x}..={:#x}",
        properties.subgraph_id_min, properties.subgraph_id_max
    );
    if !properties.shared_subgraphs.is_empty() {
        println!("shared     {:x?}", properties.shared_subgraphs);
    }
    println!("size       {}", format_bytes(file.len()));
    println!("chunks     {}", file.directory().len());
    for chunk in file.directory().entries() {
        println!("  {}  offset {:>8}  size {:>8}", chunk.id, chunk.offset, chunk.size);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging, cli.log_level.as_deref());
    debug!("Configuration: {:?}", config);

    match cli.command {
        Commands::Build { layout, output } => build(&layout, &output)?,
        Commands::Info { database } => show_info(&database, &config)?,
        Commands::Graph { target } => {
            let store = target.open(config)?;
            let (context, graph) = store.manager().select_by_gkv(&target.gkv())?;
            println!("database {:#x}", context.database_id());
            for subgraph in &graph.subgraphs {
                println!("  subgraph {:#010x}", subgraph);
            }
        }
        Commands::Cal { target, ckv, prior } => {
            let store = target.open(config)?;
            let (gkv, ckv, prior) = (target.gkv(), KeyVector::new(ckv), KeyVector::new(prior));
            let entries = fetch(|out| store.get_calibration(&gkv, &ckv, &prior, out))?;
            print_entries(&entries);
        }
        Commands::Tag { target, tag_id, tkv } => {
            let store = target.open(config)?;
            let (gkv, tkv) = (target.gkv(), KeyVector::new(tkv));
            let entries = fetch(|out| store.get_tag_data(&gkv, tag_id, &tkv, out))?;
            print_entries(&entries);
        }
        Commands::Param {
            target,
            ckv,
            subgraph,
            module,
            param,
        } => {
            let store = target.open(config)?;
            let payload = store.get_parameter(&target.gkv(), &KeyVector::new(ckv), subgraph, module, param)?;
            println!("{}", hex::encode(&payload));
        }
        Commands::Set {
            target,
            ckv,
            subgraph,
            module,
            param,
            payload,
            global,
        } => {
            let store = target.open(config)?;
            let data = [SubgraphParamData::new(subgraph, module, param, parse_hex(&payload)?)];
            let class = if global { ParamClass::Global } else { ParamClass::NonGlobal };
            let summary = store.set_calibration(&target.gkv(), &KeyVector::new(ckv), &data, class)?;
            if summary.applied() == 0 {
                bail!("no calibration variant owns module {:#x} parameter {:#x}", module, param);
            }
            println!(
                "replaced {} appended {} dropped {}",
                summary.replaced, summary.appended, summary.dropped
            );
        }
    }

    Ok(())
}
