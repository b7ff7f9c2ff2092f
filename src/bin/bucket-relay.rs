//! bucket-relay CLI: run the pipeline and poke at its state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bucket_relay::config::{Config, PipelineSettings};
use bucket_relay::model::{AnnotationEvent, ChangeEvent, Envelope};
use bucket_relay::notifier::{LogNotifier, Notifier, WebhookNotifier};
use bucket_relay::pipeline::Pipeline;
use bucket_relay::store::{PgStore, RecordStore};
use bucket_relay::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "bucket-relay", about = "Storage bucket event routing and delivery")]
struct Cli {
    /// Pipeline settings (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run routers, queue workers and the change-stream poller
    Serve {
        /// Keep store and queues in process memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },
    /// Submit an event to the inbound queue
    Publish {
        #[command(subcommand)]
        event: PublishEvent,
    },
    /// Show an item record
    Item {
        /// Decoded item id
        id: String,
    },
    /// Show depth and in-flight counts per queue
    Queues,
}

#[derive(Subcommand)]
enum PublishEvent {
    /// An object was created in the bucket
    Created {
        /// Item id as the storage system encodes it
        item: String,
        #[arg(long)]
        container: String,
    },
    /// An object was removed from the bucket
    Removed {
        item: String,
        #[arg(long)]
        container: String,
    },
    /// Set an item's description
    Annotate {
        item: String,
        description: String,
        #[arg(long, default_value = "Caption")]
        comment_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let settings = match &cli.config {
        Some(path) => PipelineSettings::load(path)?,
        None => PipelineSettings::default(),
    };

    match cli.command {
        Command::Serve { in_memory } => cmd_serve(config, settings, in_memory).await,
        Command::Publish { event } => cmd_publish(&config, settings, event).await,
        Command::Item { id } => cmd_item(&config, &id).await,
        Command::Queues => cmd_queues(&config, settings).await,
    }
}

fn notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    Ok(match &config.notifier_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone(), WEBHOOK_TIMEOUT)?),
        None => Arc::new(LogNotifier),
    })
}

async fn connect(config: &Config) -> anyhow::Result<PgStore> {
    let store = PgStore::connect(config.database_url()?.expose_secret()).await?;
    store.migrate().await?;
    Ok(store)
}

async fn cmd_serve(config: Config, settings: PipelineSettings, in_memory: bool) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "bucket-relay".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let notifier = notifier(&config)?;
    let pipeline = if in_memory {
        Pipeline::in_memory(settings, notifier).await?
    } else {
        Pipeline::postgres(settings, connect(&config).await?, notifier).await?
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        token.cancel();
    });

    pipeline.run(shutdown).await?;
    Ok(())
}

async fn cmd_publish(config: &Config, settings: PipelineSettings, event: PublishEvent) -> anyhow::Result<()> {
    let envelope = match event {
        PublishEvent::Created { item, container } => {
            Envelope::for_change(ChangeEvent::created(item, container), "Put")
        }
        PublishEvent::Removed { item, container } => {
            Envelope::for_change(ChangeEvent::removed(item, container), "ObjectRemoved")
        }
        PublishEvent::Annotate {
            item,
            description,
            comment_type,
        } => Envelope::for_annotation(AnnotationEvent::description(item, description), &comment_type),
    };

    let pipeline = Pipeline::postgres(settings, connect(config).await?, notifier(config)?).await?;
    let msg_id = pipeline.submit(&envelope).await?;
    println!("Submitted: {} as message {msg_id} ({})", envelope.id, envelope.event_name);
    Ok(())
}

async fn cmd_item(config: &Config, id: &str) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let Some(item) = store.get(id).await? else {
        anyhow::bail!("no item {id:?}");
    };

    println!("Item:        {}", item.item_id);
    println!("Description: {}", item.description.as_deref().unwrap_or("-"));
    println!("Created:     {}", item.created_at);
    println!("Updated:     {}", item.updated_at);
    Ok(())
}

async fn cmd_queues(config: &Config, settings: PipelineSettings) -> anyhow::Result<()> {
    let pipeline = Pipeline::postgres(settings, connect(config).await?, notifier(config)?).await?;

    println!("{:<20}  {:>8}  {:>9}", "QUEUE", "DEPTH", "IN_FLIGHT");
    println!("{}", "-".repeat(41));
    for queue in pipeline.queues() {
        let stats = queue.stats().await?;
        println!("{:<20}  {:>8}  {:>9}", queue.name(), stats.depth, stats.in_flight);
    }
    Ok(())
}
