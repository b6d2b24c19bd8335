use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lore_kernel_api::{
    AppendCorrectionRequest, CreateRunRequest, LoreKernelApi, RecordExtractionRequest,
    SearchRequest, ViewRequest,
};
use lore_kernel_core::{KernelConfig, TargetType, Utterance, ViewerRole};
use lore_kernel_store_sqlite::NewSession;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "lk")]
#[command(about = "Lore Kernel CLI: grounded session facts, entities and corrections")]
struct Cli {
    #[arg(long, default_value = "./lore_kernel.sqlite3")]
    db: PathBuf,

    /// YAML file with evidence tunables.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Campaign {
        #[command(subcommand)]
        command: CampaignCommand,
    },
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },
    Utterances {
        #[command(subcommand)]
        command: UtterancesCommand,
    },
    Extraction {
        #[command(subcommand)]
        command: ExtractionCommand,
    },
    Persist(RunIdArgs),
    Resolve(RunIdArgs),
    Process(RunIdArgs),
    Correction {
        #[command(subcommand)]
        command: Box<CorrectionCommand>,
    },
    View {
        #[command(subcommand)]
        command: Box<ViewCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaStatus,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CampaignCommand {
    Create(CampaignCreateArgs),
}

#[derive(Debug, Args)]
struct CampaignCreateArgs {
    #[arg(long = "id")]
    campaign_id: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    Create(SessionCreateArgs),
    List(CampaignArgs),
}

#[derive(Debug, Args)]
struct SessionCreateArgs {
    #[arg(long = "id")]
    session_id: String,
    #[arg(long)]
    campaign: String,
    #[arg(long)]
    number: Option<i64>,
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Args)]
struct CampaignArgs {
    #[arg(long)]
    campaign: String,
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    Create(RunCreateArgs),
    Show(RunIdArgs),
}

#[derive(Debug, Args)]
struct RunCreateArgs {
    #[arg(long)]
    session: String,
    #[arg(long = "id")]
    run_id: Option<String>,
}

#[derive(Debug, Args)]
struct RunIdArgs {
    #[arg(long)]
    run: String,
}

#[derive(Debug, Subcommand)]
enum UtterancesCommand {
    /// Ingest one JSON utterance per line.
    Ingest(FileArgs),
}

#[derive(Debug, Args)]
struct FileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ExtractionCommand {
    Record(ExtractionRecordArgs),
}

#[derive(Debug, Args)]
struct ExtractionRecordArgs {
    #[arg(long)]
    run: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CorrectionCommand {
    Append(CorrectionAppendArgs),
    List(ScopeArgs),
}

#[derive(Debug, Args)]
struct CorrectionAppendArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, value_enum)]
    target_type: TargetTypeArg,
    #[arg(long)]
    target_id: String,
    #[arg(long)]
    action: String,
    /// Action payload as a JSON object.
    #[arg(long, default_value = "{}")]
    payload: String,
    #[arg(long)]
    created_by: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ScopeArgs {
    #[arg(long)]
    campaign: String,
    #[arg(long)]
    session: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ViewArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[arg(long, value_enum, default_value_t = RoleArg::Dm)]
    role: RoleArg,
}

#[derive(Debug, Subcommand)]
enum ViewCommand {
    Entities(ViewArgs),
    Threads(ViewArgs),
    Quotes(ViewArgs),
    Facts(FactsArgs),
    Links(LinksArgs),
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct FactsArgs {
    #[arg(long)]
    run: String,
    #[arg(long, value_enum, default_value_t = RoleArg::Dm)]
    role: RoleArg,
}

#[derive(Debug, Args)]
struct LinksArgs {
    #[command(flatten)]
    view: ViewArgs,
    #[arg(long)]
    run: Option<String>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[command(flatten)]
    view: ViewArgs,
    #[arg(long)]
    query: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetTypeArg {
    Entity,
    Thread,
    Quote,
    Utterance,
}

impl From<TargetTypeArg> for TargetType {
    fn from(value: TargetTypeArg) -> Self {
        match value {
            TargetTypeArg::Entity => Self::Entity,
            TargetTypeArg::Thread => Self::Thread,
            TargetTypeArg::Quote => Self::Quote,
            TargetTypeArg::Utterance => Self::Utterance,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Dm,
    Player,
}

impl From<RoleArg> for ViewerRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Dm => Self::Dm,
            RoleArg::Player => Self::Player,
        }
    }
}

impl ViewArgs {
    fn request(&self) -> ViewRequest {
        ViewRequest {
            campaign_id: self.scope.campaign.clone(),
            session_id: self.scope.session.clone(),
            role: self.role.into(),
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

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to serialize command output")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed when embedded; keep the existing one.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: KernelConfig = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let api = LoreKernelApi::with_config(cli.db, config)?;

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Campaign { command } => match command {
            CampaignCommand::Create(args) => {
                emit_json(&api.create_campaign(&args.campaign_id, &args.name)?)
            }
        },
        Command::Session { command } => run_session(command, &api),
        Command::Run { command } => match command {
            RunCommand::Create(args) => emit_json(&api.create_run(&CreateRunRequest {
                session_id: args.session,
                run_id: args.run_id,
            })?),
            RunCommand::Show(args) => emit_json(&api.show_run(&args.run)?),
        },
        Command::Utterances { command } => match command {
            UtterancesCommand::Ingest(args) => {
                let utterances = read_utterances_jsonl(&args.file)?;
                emit_json(&api.ingest_utterances(&utterances)?)
            }
        },
        Command::Extraction { command } => match command {
            ExtractionCommand::Record(args) => {
                let payload = read_json_file(&args.file)?;
                let record = api.record_extraction(&RecordExtractionRequest { run_id: args.run, payload })?;
                emit_json(&serde_json::json!({
                    "extraction_id": record.extraction_id,
                    "run_id": record.run_id,
                    "session_id": record.session_id,
                    "kind": record.kind,
                }))
            }
        },
        Command::Persist(args) => emit_json(&api.persist_run(&args.run)?),
        Command::Resolve(args) => emit_json(&api.resolve_run(&args.run)?),
        Command::Process(args) => emit_json(&api.process_run(&args.run)?),
        Command::Correction { command } => run_correction(*command, &api),
        Command::View { command } => run_view(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &LoreKernelApi) -> Result<()> {
    match command {
        DbCommand::SchemaStatus => {
            let status = api.schema_status()?;
            emit_json(&serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => emit_json(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit_json(&api.integrity_check()?),
    }
}

fn run_session(command: SessionCommand, api: &LoreKernelApi) -> Result<()> {
    match command {
        SessionCommand::Create(args) => emit_json(&api.create_session(&NewSession {
            session_id: args.session_id,
            campaign_id: args.campaign,
            session_number: args.number,
            title: args.title,
        })?),
        SessionCommand::List(args) => {
            let sessions = api.list_sessions(&args.campaign)?;
            emit_json(&serde_json::json!({ "campaign_id": args.campaign, "sessions": sessions }))
        }
    }
}

fn run_correction(command: CorrectionCommand, api: &LoreKernelApi) -> Result<()> {
    match command {
        CorrectionCommand::Append(args) => {
            let payload: Value = serde_json::from_str(&args.payload)
                .with_context(|| format!("--payload is not valid JSON: {}", args.payload))?;
            if !payload.is_object() {
                return Err(anyhow!("--payload MUST be a JSON object"));
            }
            emit_json(&api.append_correction(AppendCorrectionRequest {
                campaign_id: args.scope.campaign,
                session_id: args.scope.session,
                target_type: args.target_type.into(),
                target_id: args.target_id,
                action: args.action,
                payload,
                created_by: args.created_by,
            })?)
        }
        CorrectionCommand::List(args) => {
            let corrections = api.list_corrections(&args.campaign, args.session.as_deref())?;
            emit_json(&serde_json::json!({
                "campaign_id": args.campaign,
                "session_id": args.session,
                "corrections": corrections
            }))
        }
    }
}

fn run_view(command: ViewCommand, api: &LoreKernelApi) -> Result<()> {
    match command {
        ViewCommand::Entities(args) => emit_json(&api.entities(&args.request())?),
        ViewCommand::Threads(args) => emit_json(&api.threads(&args.request())?),
        ViewCommand::Quotes(args) => emit_json(&api.quotes(&args.request())?),
        ViewCommand::Facts(args) => emit_json(&api.facts(&args.run, args.role.into())?),
        ViewCommand::Links(args) => {
            emit_json(&api.entity_links(&args.view.request(), args.run.as_deref())?)
        }
        ViewCommand::Search(args) => emit_json(&api.search(&SearchRequest {
            view: args.view.request(),
            query: args.query,
            limit: args.limit,
        })?),
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read JSON file {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("failed to parse JSON file {}", path.display()))
}

fn read_utterances_jsonl(path: &Path) -> Result<Vec<Utterance>> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read utterance file {}", path.display()))?;
    let mut utterances = Vec::new();
    for (index, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let utterance: Utterance = serde_json::from_str(line).with_context(|| {
            format!("invalid utterance on line {} of {}", index + 1, path.display())
        })?;
        utterances.push(utterance);
    }
    Ok(utterances)
}
