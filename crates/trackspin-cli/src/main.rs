use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use trackspin_api::{ApiOptions, NextTrackRequest, RecommendApi, Variant};
use trackspin_core::{HistoryStore, TrackId, UserId};
use trackspin_store_sqlite::SqliteStore;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "tsp")]
#[command(about = "Trackspin recommender CLI")]
struct Cli {
    #[arg(long, default_value = "./trackspin.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    /// Serve one recommendation turn from the command line.
    Next(NextArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    IntegrityCheck,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Upload(CatalogUploadArgs),
    ShowTrack(CatalogShowTrackArgs),
    Stats,
}

#[derive(Debug, Args)]
struct CatalogUploadArgs {
    /// JSONL file with one catalog track per line.
    #[arg(long)]
    tracks: PathBuf,
    /// JSONL file with one taste profile per line.
    #[arg(long)]
    taste: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CatalogShowTrackArgs {
    #[arg(long)]
    track: i64,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Show(HistoryShowArgs),
}

#[derive(Debug, Args)]
struct HistoryShowArgs {
    #[arg(long)]
    user: i64,
}

#[derive(Debug, Args)]
struct NextArgs {
    #[arg(long)]
    user: i64,
    /// The previously played track.
    #[arg(long)]
    track: i64,
    /// Share of the previous track that was listened to, in [0, 1].
    #[arg(long, default_value_t = 1.0)]
    time: f64,
    #[arg(long, value_enum)]
    variant: Option<VariantArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    Baseline,
    Similarity,
    Affinity,
    Blend,
    Adaptive,
}

impl From<VariantArg> for Variant {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::Baseline => Self::Baseline,
            VariantArg::Similarity => Self::Similarity,
            VariantArg::Affinity => Self::Affinity,
            VariantArg::Blend => Self::Blend,
            VariantArg::Adaptive => Self::Adaptive,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let store = SqliteStore::open(&cli.db)?;
            run_db(&command, &store)
        }
        Command::Catalog { command } => {
            let store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_catalog(&command, &store)
        }
        Command::History { command } => {
            let store = SqliteStore::open(&cli.db)?;
            store.migrate()?;
            run_history(&command, &store)
        }
        Command::Next(args) => run_next(&cli.db, &args),
    }
}

fn run_db(command: &DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::to_value(&status).context("failed to serialize schema status")?)
        }
        DbCommand::Migrate => {
            store.migrate()?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "migrated": true,
                "current_version": status.current_version,
            }))
        }
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_catalog(command: &CatalogCommand, store: &SqliteStore) -> Result<()> {
    match command {
        CatalogCommand::Upload(args) => {
            let (tracks, taste_profiles) =
                trackspin_api::upload_datasets(store, &args.tracks, args.taste.as_deref())?;
            emit_json(serde_json::json!({
                "uploaded_tracks": tracks,
                "uploaded_taste_profiles": taste_profiles,
            }))
        }
        CatalogCommand::ShowTrack(args) => {
            let track = store
                .get_track(TrackId(args.track))?
                .ok_or_else(|| anyhow!("track not found: {}", args.track))?;
            emit_json(serde_json::to_value(&track).context("failed to serialize track")?)
        }
        CatalogCommand::Stats => {
            let stats = store.stats()?;
            emit_json(serde_json::to_value(&stats).context("failed to serialize store stats")?)
        }
    }
}

fn run_history(command: &HistoryCommand, store: &SqliteStore) -> Result<()> {
    match command {
        HistoryCommand::Show(args) => {
            let history = store.load(UserId(args.user))?;
            emit_json(serde_json::json!({
                "user": args.user,
                "history": history,
            }))
        }
    }
}

fn run_next(db: &Path, args: &NextArgs) -> Result<()> {
    let api = RecommendApi::open(
        db,
        ApiOptions { variant: args.variant.map(Variant::from), play_log: None },
    )?;
    let response = api.next_track(
        UserId(args.user),
        &NextTrackRequest { track: args.track, time: args.time },
    )?;
    emit_json(serde_json::to_value(&response).context("failed to serialize recommendation")?)
}
