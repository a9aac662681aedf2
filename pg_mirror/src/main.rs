use std::{error::Error, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use pg_mirror::{
    clients::postgres::PostgresConfig,
    conversions::rho_term::RhoTermSerializer,
    pipeline::{
        batching::BatchConfig,
        data_pipeline::DataPipeline,
        destinations::{
            rnode::{RNodeConfig, RNodeSink},
            stdout::StdoutDestination,
            DeliverySink,
        },
        publisher::PublisherConfig,
        sources::{
            postgres::{triggers::CaptureConfig, PostgresSource},
            Source,
        },
    },
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "pg_mirror", version, about, arg_required_else_help = true)]
struct AppArgs {
    #[clap(flatten)]
    db_args: DbArgs,

    #[clap(flatten)]
    capture_args: CaptureArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct DbArgs {
    /// Host on which Postgres is running
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    db_host: String,

    /// Port on which Postgres is running
    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    db_port: u16,

    /// Postgres database name
    #[arg(long, env = "POSTGRES_DB")]
    db_name: String,

    /// Postgres database user name
    #[arg(long, env = "POSTGRES_USER")]
    db_username: String,

    /// Postgres database user password
    #[arg(long, env = "POSTGRES_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,
}

#[derive(Debug, Args)]
struct CaptureArgs {
    /// Notification channel the triggers publish on
    #[arg(long, default_value = "mirror")]
    channel: String,

    /// Name of the trigger procedure
    #[arg(long, default_value = "notify_mirror")]
    procedure: String,

    /// Table never to capture, bare or schema qualified (repeatable)
    #[arg(long = "exclude", value_name = "TABLE")]
    excluded_tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkKind {
    /// Log batches instead of delivering them
    Stdout,
    /// Deploy batches to an RNode validator
    Rnode,
}

#[derive(Debug, Args)]
struct MirrorArgs {
    #[arg(long, value_enum, default_value = "rnode")]
    sink: SinkKind,

    /// Registry uri of the mirror contract
    #[arg(long, env = "DB_CONTRACT_URI")]
    contract_uri: String,

    /// Deploy endpoint of the signing relay
    #[arg(long, env = "RNODE_DEPLOY_URL", default_value = "http://localhost:40403/api/deploy")]
    deploy_url: String,

    /// Propose endpoint of the validator
    #[arg(long, env = "RNODE_PROPOSE_URL", default_value = "http://localhost:40405/api/propose")]
    propose_url: String,

    #[arg(long, default_value_t = 100_000_000)]
    phlo_limit: u64,

    /// Maximum number of changes in one deploy
    #[arg(long, default_value_t = 64)]
    max_batch_size: usize,

    /// Milliseconds without changes after which a partial batch is deployed
    #[arg(long, default_value_t = 4000)]
    quiesce_ms: u64,

    /// Deploys allowed in flight at once; 1 keeps them strictly ordered
    #[arg(long, default_value_t = 1)]
    max_in_flight: usize,

    /// Retries of a failed submit or propose
    #[arg(long, default_value_t = 5)]
    max_retries: usize,

    /// Directory receiving batches that could not be deployed
    #[arg(long)]
    dead_letter_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install triggers and mirror changes until interrupted
    Mirror(MirrorArgs),
    /// Only install the capture triggers
    Install,
    /// Remove the capture triggers and procedure
    Uninstall,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if let Err(e) = main_impl().await {
        error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn main_impl() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = AppArgs::parse();
    let db_args = args.db_args;

    let postgres_config = PostgresConfig {
        host: db_args.db_host,
        port: db_args.db_port,
        database: db_args.db_name,
        username: db_args.db_username,
        password: db_args.db_password,
    };
    let capture_config = CaptureConfig {
        channel: args.capture_args.channel,
        procedure: args.capture_args.procedure,
        excluded_tables: args.capture_args.excluded_tables,
        watched_tables: None,
    };

    let mut postgres_source = PostgresSource::new(&postgres_config, capture_config).await?;

    match args.command {
        Command::Install => {
            postgres_source.prepare().await?;
            for binding in postgres_source.bindings() {
                info!("capturing {}", binding.table);
            }
        }
        Command::Uninstall => {
            postgres_source.uninstall().await?;
        }
        Command::Mirror(mirror_args) => {
            let sink = mirror_args.sink;
            match sink {
                SinkKind::Stdout => {
                    mirror(postgres_source, StdoutDestination::default(), mirror_args).await?
                }
                SinkKind::Rnode => {
                    let mut rnode_config =
                        RNodeConfig::new(&mirror_args.deploy_url, &mirror_args.propose_url);
                    rnode_config.phlo_limit = mirror_args.phlo_limit;
                    let destination = RNodeSink::new(rnode_config)?;
                    mirror(postgres_source, destination, mirror_args).await?
                }
            }
        }
    }

    Ok(())
}

async fn mirror<Dest: DeliverySink + 'static>(
    source: PostgresSource,
    destination: Dest,
    args: MirrorArgs,
) -> Result<(), Box<dyn Error>> {
    let serializer = RhoTermSerializer::new(args.contract_uri)?;
    let batch_config = BatchConfig::new(args.max_batch_size, Duration::from_millis(args.quiesce_ms))?;
    let publisher_config = PublisherConfig {
        max_in_flight: args.max_in_flight,
        max_retries: args.max_retries,
        dead_letter_dir: args.dead_letter_dir,
        ..Default::default()
    };

    let pipeline = DataPipeline::new(
        source,
        serializer,
        destination,
        batch_config,
        publisher_config,
    );

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            cancel.cancel();
        }
    });

    let stats = pipeline.run().await?;
    info!(
        "mirrored {} changes ({} malformed, {} unserializable)",
        stats.forwarded, stats.malformed, stats.unserializable
    );

    Ok(())
}
