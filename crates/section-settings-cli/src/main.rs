use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use section_settings_api::{
    open_sqlite, GetOptions, SectionModeratorStore, StoreConfig, StoreParams,
};
use section_settings_core::{SectionId, SectionNode, SectionRepository, UserId};
use section_settings_store_sqlite::SqliteSectionStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

type Store = SectionModeratorStore<SqliteSectionStore>;

#[derive(Debug, Parser)]
#[command(name = "ssm")]
#[command(about = "Forum section moderator settings CLI")]
struct Cli {
    #[arg(long, default_value = "./section_settings.sqlite3")]
    db: PathBuf,

    /// Seconds a cached section may be served to `settings get`; 0 disables the cache.
    #[arg(long, default_value_t = 30)]
    cache_ttl_secs: u64,

    #[arg(long, default_value_t = 3)]
    max_conflict_retries: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Section {
        #[command(subcommand)]
        command: SectionCommand,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    Moderators {
        #[command(subcommand)]
        command: ModeratorsCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Rebuild inherited settings for one subtree, or the whole forest.
    Recompute(RecomputeArgs),
    /// List sections whose inherited settings are out of date.
    Verify,
    /// Settings of one user at a section and at its parent, with own flags.
    EditView(SectionUserArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SectionCommand {
    Add(SectionAddArgs),
    List,
    Show(SectionShowArgs),
}

#[derive(Debug, Args)]
struct SectionAddArgs {
    #[arg(long)]
    id: Option<SectionId>,
    #[arg(long)]
    parent: Option<SectionId>,
    #[arg(long)]
    title: String,
}

#[derive(Debug, Args)]
struct SectionShowArgs {
    #[arg(long)]
    id: SectionId,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Get(SettingsGetArgs),
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
struct SectionUserArgs {
    #[arg(long)]
    section: SectionId,
    #[arg(long)]
    user: UserId,
}

#[derive(Debug, Args)]
struct SettingsGetArgs {
    #[command(flatten)]
    target: SectionUserArgs,
    /// Keys to read; every registered key when omitted.
    #[arg(long = "key")]
    keys: Vec<String>,
    #[arg(long, default_value_t = false)]
    extended: bool,
    #[arg(long, default_value_t = false)]
    skip_cache: bool,
}

#[derive(Debug, Args)]
struct SettingsSetArgs {
    #[command(flatten)]
    target: SectionUserArgs,
    /// `key=<json>` override to store, repeatable.
    #[arg(long = "value")]
    values: Vec<String>,
    /// Key whose override is removed, repeatable.
    #[arg(long = "clear")]
    clear: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum ModeratorsCommand {
    List(ModeratorsListArgs),
    Remove(SectionUserArgs),
}

#[derive(Debug, Args)]
struct ModeratorsListArgs {
    #[arg(long)]
    section: SectionId,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Remove(UserRemoveArgs),
}

#[derive(Debug, Args)]
struct UserRemoveArgs {
    #[arg(long)]
    user: UserId,
}

#[derive(Debug, Args)]
struct RecomputeArgs {
    #[arg(long)]
    section: Option<SectionId>,
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

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = StoreConfig {
        cache_ttl: Duration::from_secs(cli.cache_ttl_secs),
        max_conflict_retries: cli.max_conflict_retries,
    };
    tracing::debug!(db = %cli.db.display(), ?config, "opening section settings database");

    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteSectionStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        command => {
            let store = open_sqlite(&cli.db, config)?;
            run_store(command, &store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteSectionStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteSectionStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_store(command: Command, store: &Store) -> Result<()> {
    match command {
        Command::Db { .. } => Err(anyhow!("database commands do not use the settings store")),
        Command::Section { command } => run_section(command, store),
        Command::Settings { command } => run_settings(command, store),
        Command::Moderators { command } => run_moderators(command, store),
        Command::User { command: UserCommand::Remove(args) } => {
            let touched = store.remove_user(args.user)?;
            emit_json(serde_json::json!({
                "user_id": args.user,
                "touched_sections": touched
            }))
        }
        Command::Recompute(args) => {
            let report = store.recompute(args.section)?;
            emit_json(serde_json::json!({
                "scope": args.section,
                "scanned": report.scanned,
                "updated": report.updated
            }))
        }
        Command::Verify => {
            let stale = store.verify()?;
            emit_json(serde_json::json!({
                "consistent": stale.is_empty(),
                "stale_sections": stale
            }))
        }
        Command::EditView(args) => {
            let view = store.edit_view(args.section, args.user)?;
            emit_json(serde_json::json!({
                "section_id": args.section,
                "user_id": args.user,
                "settings": view.settings,
                "parent_settings": view.parent_settings
            }))
        }
    }
}

fn run_section(command: SectionCommand, store: &Store) -> Result<()> {
    match command {
        SectionCommand::Add(args) => {
            let node =
                SectionNode::new(args.id.unwrap_or_default(), args.parent, args.title.trim());
            if node.title.is_empty() {
                return Err(anyhow!("--title must not be empty"));
            }
            store.repository().insert(&node)?;
            emit_json(serde_json::json!({ "section": node }))
        }
        SectionCommand::List => {
            let sections = store.repository().fetch_all()?;
            emit_json(serde_json::json!({ "sections": sections }))
        }
        SectionCommand::Show(args) => {
            let node = store
                .repository()
                .fetch_by_id(args.id)?
                .ok_or_else(|| anyhow!("forum section {} does not exist", args.id))?;
            emit_json(serde_json::json!({ "section": node }))
        }
    }
}

fn run_settings(command: SettingsCommand, store: &Store) -> Result<()> {
    match command {
        SettingsCommand::Get(args) => {
            let keys = if args.keys.is_empty() {
                store.keys().names().map(str::to_string).collect()
            } else {
                args.keys
            };
            let params = StoreParams::new(args.target.section, args.target.user);
            let options = GetOptions { skip_cache: args.skip_cache, extended: args.extended };
            let settings = store.get(&keys, &params, options)?;
            emit_json(serde_json::json!({
                "section_id": args.target.section,
                "user_id": args.target.user,
                "settings": settings
            }))
        }
        SettingsCommand::Set(args) => {
            let values = collect_updates(&args.values, &args.clear)?;
            if values.is_empty() {
                return Err(anyhow!("at least one --value or --clear is required"));
            }
            let params = StoreParams::new(args.target.section, args.target.user);
            let report = store.set(&values, &params)?;
            emit_json(serde_json::json!({
                "section_id": args.target.section,
                "user_id": args.target.user,
                "changed_keys": values.keys().collect::<Vec<_>>(),
                "recompute": report
            }))
        }
    }
}

fn run_moderators(command: ModeratorsCommand, store: &Store) -> Result<()> {
    match command {
        ModeratorsCommand::List(args) => {
            let moderators = store.get_moderators_info(args.section)?;
            emit_json(serde_json::json!({
                "section_id": args.section,
                "moderators": moderators
            }))
        }
        ModeratorsCommand::Remove(args) => {
            let report = store.remove_moderator(args.section, args.user)?;
            emit_json(serde_json::json!({
                "section_id": args.section,
                "user_id": args.user,
                "recompute": report
            }))
        }
    }
}

fn collect_updates(values: &[String], clear: &[String]) -> Result<BTreeMap<String, Option<Value>>> {
    let mut updates = BTreeMap::new();
    for raw in values {
        let (key, value) = parse_key_value(raw)?;
        updates.insert(key, Some(value));
    }
    for key in clear {
        if updates.insert(key.clone(), None).is_some() {
            return Err(anyhow!("key {key} is both set and cleared"));
        }
    }
    Ok(updates)
}

/// Parse `key=<json>`. A value that is not valid JSON is taken as a string.
fn parse_key_value(raw: &str) -> Result<(String, Value)> {
    let (key, value) =
        raw.split_once('=').ok_or_else(|| anyhow!("expected key=<json>, got {raw}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("setting key must not be empty in {raw}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
