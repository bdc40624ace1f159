pub mod config;
pub mod error;
pub mod model;
pub mod search;

pub use error::{ComposeError, Result};
pub use search::executor::MultiCoreExecutor;

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Deserialize;

use config::EngineConfig;
use model::ComposedQuery;
use search::fields::CoreDocument;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "corejoin",
    version,
    about = "Composed queries across joined tantivy cores"
)]
pub struct Cli {
    /// Engine config file (defaults to the platform config dir)
    #[arg(long, global = true, env = "COREJOIN_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add documents from a JSON-lines file to a core, then commit
    Index {
        #[arg(long)]
        core: String,

        /// One `{"id": .., "fields": [[name, value], ..]}` object per line; `-` reads stdin
        #[arg(long)]
        documents: PathBuf,
    },
    /// Execute a composed query given as JSON and print the response
    Query {
        /// Request file; `-` reads stdin
        #[arg(long)]
        request: PathBuf,
    },
    /// List indexed terms of a field by prefix
    Terms {
        #[arg(long)]
        core: String,

        #[arg(long)]
        field: String,

        #[arg(long, default_value = "")]
        prefix: String,

        /// Maximum number of terms; 0 lists all
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Show document counts and fields of every core
    Info,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// A line of an `index` documents file.
#[derive(Debug, Deserialize)]
struct IndexRecord {
    id: String,
    #[serde(flatten)]
    document: CoreDocument,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Index { core, documents } => {
            let executor = open_executor(cli.config)?;
            let reader = open_input(&documents)?;
            let mut indexed = 0u64;
            for (lineno, line) in reader.lines().enumerate() {
                let line = line.context("read documents")?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: IndexRecord = serde_json::from_str(&line)
                    .with_context(|| format!("parse document on line {}", lineno + 1))?;
                executor.add_document(&core, &record.id, &record.document)?;
                indexed += 1;
            }
            executor.commit(&core)?;
            executor.shutdown()?;
            println!(
                "{}",
                serde_json::json!({ "core": core, "indexed": indexed })
            );
            Ok(())
        }
        Commands::Query { request } => {
            let executor = open_executor(cli.config)?;
            let mut text = String::new();
            open_input(&request)?
                .read_to_string(&mut text)
                .context("read request")?;
            let query: ComposedQuery =
                serde_json::from_str(&text).context("parse composed query")?;
            let response = executor.execute(&query)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::Terms {
            core,
            field,
            prefix,
            limit,
        } => {
            let executor = open_executor(cli.config)?;
            let terms = executor.prefix_search(&core, &field, &prefix, limit)?;
            println!("{}", serde_json::to_string_pretty(&terms)?);
            Ok(())
        }
        Commands::Info => {
            let executor = open_executor(cli.config)?;
            println!("{}", serde_json::to_string_pretty(&executor.core_info())?);
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "corejoin", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn open_executor(config: Option<PathBuf>) -> anyhow::Result<MultiCoreExecutor> {
    let path = config.unwrap_or_else(config::default_config_path);
    let mut engine = EngineConfig::load(&path)
        .with_context(|| format!("load engine config {}", path.display()))?;
    engine.settings = engine.settings.with_env();
    MultiCoreExecutor::from_config(&engine).context("open cores")
}

fn open_input(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(std::io::stdin())));
    }
    let file = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}
