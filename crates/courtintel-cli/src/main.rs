use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use courtintel_domain::{CaseId, ConfigError, NewCase, PipelineError, UserId};
use courtintel_orchestrator::{CaseDesk, RulingPipeline};
use courtintel_provider::{GatewayConfig, OpenAiChatGateway};
use courtintel_ratelimit::TokenBucketLimiter;
use courtintel_store_sqlite::SqliteCourtStore;
use serde::Serialize;
use serde_json::json;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "courtintel")]
#[command(about = "Model-generated rulings for minor cases, with bias audits and an audit log")]
struct Cli {
    /// `SQLite` database holding users, cases, rulings and the audit log.
    #[arg(long, global = true, env = "COURTINTEL_DB", default_value = "courtintel.sqlite3")]
    db: PathBuf,
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    User(UserArgs),
    Case(CaseArgs),
    Rule(RuleArgs),
    Logs(LogsArgs),
}

#[derive(Debug, Args)]
struct UserArgs {
    #[command(subcommand)]
    command: UserSubcommand,
}

#[derive(Debug, Subcommand)]
enum UserSubcommand {
    Add {
        #[arg(long)]
        username: String,
    },
}

#[derive(Debug, Args)]
struct CaseArgs {
    #[command(subcommand)]
    command: CaseSubcommand,
}

#[derive(Debug, Subcommand)]
enum CaseSubcommand {
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        narrative: String,
        #[arg(long)]
        locale: String,
    },
    List {
        #[arg(long)]
        user: String,
    },
    Show {
        #[arg(long)]
        user: String,
        #[arg(long = "case")]
        case_id: String,
    },
    Delete {
        #[arg(long)]
        user: String,
        #[arg(long = "case")]
        case_id: String,
    },
}

#[derive(Debug, Args)]
struct RuleArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "case")]
    case_id: String,
    #[arg(long, default_value_t = false)]
    bias_check: bool,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, env = "OPENAI_MODEL")]
    model: Option<String>,
    #[arg(long, env = "OPENAI_BASE_URL")]
    base_url: Option<String>,
    /// Per-request timeout for the model backend.
    #[arg(long, env = "COURTINTEL_MODEL_TIMEOUT_MS")]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Args)]
struct LogsArgs {
    #[arg(long)]
    user: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_failure(&err),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::User(args) => user_command(&cli.db, args),
        Commands::Case(args) => case_command(&cli.db, args),
        Commands::Rule(args) => rule_command(&cli.db, args),
        Commands::Logs(args) => logs_command(&cli.db, &args),
    }
}

fn user_command(db: &std::path::Path, args: UserArgs) -> Result<()> {
    let store = SqliteCourtStore::open_and_migrate(db)?;
    let desk = CaseDesk::new(&store, &store, &store, &store);
    match args.command {
        UserSubcommand::Add { username } => print_json(&desk.register_user(&username)?),
    }
}

fn case_command(db: &std::path::Path, args: CaseArgs) -> Result<()> {
    let store = SqliteCourtStore::open_and_migrate(db)?;
    let desk = CaseDesk::new(&store, &store, &store, &store);
    match args.command {
        CaseSubcommand::Create {
            user,
            title,
            narrative,
            locale,
        } => {
            let caller = desk.resolve_user(&user)?.user_id;
            let case = desk.create_case(
                caller,
                &NewCase {
                    title,
                    narrative,
                    locale,
                },
            )?;
            print_json(&case)
        }
        CaseSubcommand::List { user } => {
            let caller = desk.resolve_user(&user)?.user_id;
            print_json(&json!({ "cases": desk.list_cases(caller)? }))
        }
        CaseSubcommand::Show { user, case_id } => {
            let caller = desk.resolve_user(&user)?.user_id;
            print_json(&desk.case_detail(caller, parse_case_id(&case_id)?)?)
        }
        CaseSubcommand::Delete { user, case_id } => {
            let caller = desk.resolve_user(&user)?.user_id;
            let case_id = parse_case_id(&case_id)?;
            desk.delete_case(caller, case_id)?;
            print_json(&json!({ "deleted": case_id.to_string() }))
        }
    }
}

fn rule_command(db: &std::path::Path, args: RuleArgs) -> Result<()> {
    let mut config = GatewayConfig::new(args.api_key, args.model, args.base_url)?;
    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_timeout_ms(timeout_ms);
    }
    let gateway = OpenAiChatGateway::new(config);
    let limiter = TokenBucketLimiter::default();

    let store = SqliteCourtStore::open_and_migrate(db)?;
    let desk = CaseDesk::new(&store, &store, &store, &store);
    let caller: UserId = desk.resolve_user(&args.user)?.user_id;
    let case_id = parse_case_id(&args.case_id)?;

    let pipeline = RulingPipeline::new(&limiter, &gateway, &store, &store, &store);
    let result = pipeline.run(case_id, caller, args.bias_check)?;
    print_json(&result)
}

fn logs_command(db: &std::path::Path, args: &LogsArgs) -> Result<()> {
    let store = SqliteCourtStore::open_and_migrate(db)?;
    let desk = CaseDesk::new(&store, &store, &store, &store);
    let caller = desk.resolve_user(&args.user)?.user_id;
    print_json(&json!({ "logs": desk.list_logs(caller)? }))
}

fn parse_case_id(raw: &str) -> Result<CaseId> {
    // Malformed ids cannot name any case.
    CaseId::from_str(raw).map_err(|_| PipelineError::NotFound.into())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn report_failure(err: &anyhow::Error) -> ExitCode {
    let (code, exit) = failure_kind(err);
    error!(code, "command failed");
    eprintln!(
        "{}",
        json!({ "error": code, "message": format!("{err:#}") })
    );
    ExitCode::from(exit)
}

fn failure_kind(err: &anyhow::Error) -> (&'static str, u8) {
    if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
        let exit = match pipeline_err {
            PipelineError::Store(_) => 1,
            PipelineError::Invalid(_) => 2,
            PipelineError::NotFound => 3,
            PipelineError::RateLimited => 4,
            PipelineError::Upstream(_) => 5,
        };
        return (pipeline_err.code(), exit);
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return ("config_error", 6);
    }
    ("internal_error", 1)
}
