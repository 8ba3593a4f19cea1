use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reverie_api::HistoryApi;
use reverie_core::GameId;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rv")]
#[command(about = "Reverie operator CLI")]
struct Cli {
    #[arg(long, env = "REVERIE_DB", default_value = "./reverie.sqlite3")]
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
    Games {
        #[command(subcommand)]
        command: GamesCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum GamesCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    Show(HistoryShowArgs),
}

#[derive(Debug, Args)]
struct HistoryShowArgs {
    #[arg(long)]
    game_id: String,
    /// Only the most recent N turns.
    #[arg(long)]
    limit: Option<usize>,
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
    let api = HistoryApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Games { command: GamesCommand::List } => run_games_list(&api),
        Command::History { command: HistoryCommand::Show(args) } => run_history_show(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &HistoryApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::json!({
                "ok": report.quick_check_ok && report.sequence_gaps.is_empty(),
                "report": report
            }))
        }
    }
}

fn run_games_list(api: &HistoryApi) -> Result<()> {
    let games = api.list_games()?;
    emit_json(serde_json::json!({
        "count": games.len(),
        "games": games
    }))
}

fn run_history_show(args: &HistoryShowArgs, api: &HistoryApi) -> Result<()> {
    let game_id: GameId = args.game_id.parse().context("invalid --game-id")?;
    let turns = api.turns(game_id, args.limit)?;
    emit_json(serde_json::json!({
        "game_id": game_id,
        "turn_count": turns.len(),
        "turns": turns
    }))
}
