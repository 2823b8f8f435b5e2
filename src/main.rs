//! skillgate command-line interface

mod cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skillgate")]
#[command(version, about = "Install, approve and run third-party skills", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.skillgate/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest file
    Validate { file: PathBuf },
    /// Parse a source reference and print its parts
    ParseSource { reference: String },
    /// Install a skill from `owner/repo@ref[:subdir]` or a repository URL
    Install {
        source: String,
        /// Access token for private repositories
        #[arg(long)]
        token: Option<String>,
        /// Validate and activate low/medium risk versions right away
        #[arg(long)]
        activate: bool,
    },
    /// Register built-in skill packages
    SyncBuiltins,
    /// List installed skills
    List,
    /// List versions of a skill
    Versions { slug: String },
    /// Validate a pending version and make it active
    Activate {
        slug: String,
        version: String,
        /// Also make it the default version
        #[arg(long)]
        default: bool,
    },
    /// Approve a high/critical risk version
    Approve {
        slug: String,
        version: String,
        #[arg(long)]
        default: bool,
    },
    /// Reject a pending version
    Reject {
        slug: String,
        version: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Retire an active version
    Deprecate {
        slug: String,
        version: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Create or update a binding
    Bind(cli::BindArgs),
    /// Show execution audit rows, newest first
    Audit {
        #[arg(long)]
        skill: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        /// Only failed calls
        #[arg(long)]
        failures: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run one tool call through policy, approval, sandbox and audit
    Run(cli::RunArgs),
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skillgate=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { file } => cli::cmd_validate(&file)?,
        Commands::ParseSource { reference } => cli::cmd_parse_source(&config, &reference)?,
        Commands::Install {
            source,
            token,
            activate,
        } => cli::cmd_install(&config, &source, token, activate).await?,
        Commands::SyncBuiltins => cli::cmd_sync_builtins(&config).await?,
        Commands::List => cli::cmd_list(&config).await?,
        Commands::Versions { slug } => cli::cmd_versions(&config, &slug).await?,
        Commands::Activate {
            slug,
            version,
            default,
        } => cli::cmd_activate(&config, &slug, &version, default).await?,
        Commands::Approve {
            slug,
            version,
            default,
        } => cli::cmd_approve(&config, &slug, &version, default).await?,
        Commands::Reject {
            slug,
            version,
            reason,
        } => cli::cmd_reject(&config, &slug, &version, reason).await?,
        Commands::Deprecate {
            slug,
            version,
            reason,
        } => cli::cmd_deprecate(&config, &slug, &version, reason).await?,
        Commands::Bind(args) => cli::cmd_bind(&config, args).await?,
        Commands::Audit {
            skill,
            session,
            tool,
            failures,
            limit,
        } => cli::cmd_audit(&config, skill, session, tool, failures, limit).await?,
        Commands::Run(args) => cli::cmd_run(&config, args).await?,
    }

    Ok(())
}
