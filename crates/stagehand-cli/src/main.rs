//! stagehand CLI.

use clap::{Parser, Subcommand, ValueEnum};
use stagehand_resources::ResourceKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Settings;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Deploy a project's cloud resources, one stage at a time", long_about = None)]
struct Cli {
    /// Project file
    #[arg(long, env = "STAGEHAND_CONFIG", default_value = "stagehand.kdl")]
    config: PathBuf,

    /// State file of the sandbox control plane
    #[arg(long, default_value = ".stagehand/sandbox.json")]
    sandbox: PathBuf,

    /// Talk to the real branching-Postgres and serverless-SQL providers
    #[arg(long)]
    live_db_providers: bool,

    /// Build images with the configured backend instead of the sandbox builder
    #[arg(long)]
    real_builds: bool,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update every resource of a stage
    Deploy {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
        /// Do not upload frontend files to the CDNs
        #[arg(long)]
        skip_frontend: bool,
    },
    /// Delete every resource of a stage
    Destroy {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
        /// Also delete the generated secrets
        #[arg(long)]
        with_secrets: bool,
        /// Also delete the state bucket
        #[arg(long)]
        with_state_bucket: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Operate on a single resource
    Resource {
        kind: ResourceKind,
        operation: ResourceOperation,
        #[arg(long, env = "STAGEHAND_STAGE", conflicts_with = "reference")]
        stage: Option<String>,
        /// Shared network reference, for `network` only
        #[arg(long = "ref")]
        reference: Option<String>,
        /// CDN name, when the stage has several
        #[arg(long)]
        name: Option<String>,
    },
    /// Manage generated secrets
    Secrets {
        #[command(subcommand)]
        command: SecretCommands,
    },
    /// Check the project file
    Validate {
        /// Only this stage; every declared stage otherwise
        #[arg(long)]
        stage: Option<String>,
    },
    /// Show the status of every resource of a stage
    Status {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
        /// Also print the recorded state ledger
        #[arg(long)]
        ledger: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
    Status,
    /// Print the rendered template
    Yaml,
    /// Compare the rendered template with the deployed one
    YamlDiff,
}

#[derive(Subcommand)]
enum SecretCommands {
    /// Generate missing managed secrets
    Ensure {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
    },
    /// Regenerate managed secrets
    Rotate {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
        /// Keys to regenerate
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Delete every managed secret
    Delete {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// List managed secrets and whether they are stored
    List {
        #[arg(long, env = "STAGEHAND_STAGE")]
        stage: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
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
    let cli = Cli::parse();
    init_tracing(cli.json);

    let settings = Settings {
        config: cli.config,
        sandbox: cli.sandbox,
        live_db_providers: cli.live_db_providers,
        real_builds: cli.real_builds,
    };

    match cli.command {
        Commands::Deploy {
            stage,
            skip_frontend,
        } => {
            commands::deploy::deploy(&settings, &stage, skip_frontend).await?;
        }
        Commands::Destroy {
            stage,
            with_secrets,
            with_state_bucket,
            yes,
        } => {
            commands::deploy::destroy(&settings, &stage, with_secrets, with_state_bucket, yes)
                .await?;
        }
        Commands::Status { stage, ledger } => {
            commands::deploy::status(&settings, &stage, ledger).await?;
        }
        Commands::Resource {
            kind,
            operation,
            stage,
            reference,
            name,
        } => {
            let target = commands::resource::Target::from_args(stage, reference, name)?;
            commands::resource::run(&settings, kind, operation, target).await?;
        }
        Commands::Secrets { command } => match command {
            SecretCommands::Ensure { stage } => {
                commands::secrets::ensure(&settings, &stage).await?;
            }
            SecretCommands::Rotate { stage, keys } => {
                commands::secrets::rotate(&settings, &stage, &keys).await?;
            }
            SecretCommands::Delete { stage, yes } => {
                commands::secrets::delete(&settings, &stage, yes).await?;
            }
            SecretCommands::List { stage } => {
                commands::secrets::list(&settings, &stage).await?;
            }
        },
        Commands::Validate { stage } => {
            commands::validate(&settings, stage.as_deref())?;
        }
    }

    Ok(())
}
