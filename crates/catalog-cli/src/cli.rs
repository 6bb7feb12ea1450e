use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "catalog",
    about = "Catalog document repository over a key-value snapshot",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Collection configuration (TOML)
    #[arg(long, global = true, default_value = "catalog.toml")]
    pub config: PathBuf,

    /// Store snapshot (JSON); created on first write
    #[arg(long, global = true, default_value = "catalog.json")]
    pub data: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show entities by id, or every entity
    Get(GetArgs),
    /// Create one entity or an array of entities
    Create(CreateArgs),
    /// Replace one entity or an array of entities
    Update(UpdateArgs),
    /// Delete entities by id
    Delete(DeleteArgs),
    /// Show or change the order of a collection
    Order(OrderArgs),
    /// Substring search over indexed properties
    Search(SearchArgs),
    /// Rebuild derived index keys from entity bodies
    Rebuild(RebuildArgs),
}

impl Command {
    /// Whether the command may change the store.
    pub fn mutates(&self) -> bool {
        match self {
            Self::Get(_) | Self::Search(_) => false,
            Self::Order(args) => !args.ids.is_empty(),
            Self::Create(_) | Self::Update(_) | Self::Delete(_) | Self::Rebuild(_) => true,
        }
    }
}

#[derive(Args)]
pub struct GetArgs {
    pub ids: Vec<String>,
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(short, long)]
    pub namespace: String,
    /// JSON object or array of objects
    pub json: String,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// JSON object or array of objects, each carrying its id
    pub json: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Args)]
pub struct OrderArgs {
    #[arg(short, long)]
    pub namespace: String,
    /// Ids to move to the front, in order
    pub ids: Vec<String>,
}

#[derive(Args)]
pub struct SearchArgs {
    /// Filters as property=query
    #[arg(required = true)]
    pub filters: Vec<String>,
}

#[derive(Args)]
pub struct RebuildArgs {
    /// Rebuild one collection only
    #[arg(short, long)]
    pub namespace: Option<String>,
}
