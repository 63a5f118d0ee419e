use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use memsession::{
    InMemoryCluster, OwnerId, SessionConfig, SessionNode, StoreConfig, StoreConnector,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "session-sim")]
#[command(about = "Simulates processes sharing replicated sessions over an in-memory store")]
struct Cli {
    /// Name of the session map
    #[arg(long, default_value = "session-replication")]
    map: String,

    /// Reconnect rate limit in milliseconds
    #[arg(long, default_value_t = 200)]
    retry_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Two processes share one session, then release it in turn
    Share {
        #[arg(long, default_value = "S1")]
        session: String,
    },
    /// A deferred-write process keeps working through a store outage
    Outage {
        #[arg(long, default_value = "S1")]
        session: String,
        #[arg(long, default_value_t = 3)]
        writes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memsession=info")),
        )
        .init();

    let cli = Cli::parse();
    let store = StoreConfig::new(&cli.map)
        .retry_interval(Duration::from_millis(cli.retry_ms))
        .probe_interval(Duration::from_millis(cli.retry_ms / 2 + 1));
    store.validate().context("invalid store configuration")?;
    let cluster = InMemoryCluster::new();

    match cli.command {
        Command::Share { session } => share(&cluster, store, &session).await,
        Command::Outage { session, writes } => outage(&cluster, store, &session, writes).await,
    }
}

async fn node(
    cluster: &Arc<InMemoryCluster>,
    name: &str,
    store: StoreConfig,
    session: SessionConfig,
) -> Result<SessionNode> {
    let connector: Arc<dyn StoreConnector> = Arc::new(cluster.connector());
    SessionNode::start(OwnerId::new(name), store, session, connector)
        .await
        .with_context(|| format!("starting {}", name))
}

async fn share(cluster: &Arc<InMemoryCluster>, store: StoreConfig, id: &str) -> Result<()> {
    let p1 = node(cluster, "P1", store.clone(), SessionConfig::write_through()).await?;
    let p2 = node(cluster, "P2", store, SessionConfig::write_through()).await?;

    let s1 = p1.manager().attach(id, true).await?;
    let s2 = p2.manager().attach(id, false).await?;

    s1.set_attribute("k", json!("v1")).await?;
    println!("P1 set k = \"v1\"");
    println!("P2 reads k = {:?}", s2.get_attribute("k").await?);

    let released = p1.manager().release(id).await;
    println!("P1 released {} (reached store: {})", id, released);
    println!(
        "P2 sees names {:?}",
        p2.client().get_attribute_names(id).await?
    );

    let released = p2.manager().release(id).await;
    println!("P2 released {} (reached store: {})", id, released);
    let value = p1.client().get_attribute(id, "k").await?;
    println!("k after both releases = {:?}", value);
    if value.is_some() {
        return Err(anyhow!("session {} survived the release of every owner", id));
    }

    p1.shutdown().await?;
    p2.shutdown().await?;
    Ok(())
}

async fn outage(
    cluster: &Arc<InMemoryCluster>,
    store: StoreConfig,
    id: &str,
    writes: usize,
) -> Result<()> {
    let retry = store.retry_interval;
    let p1 = node(cluster, "P1", store, SessionConfig::deferred().transient("csrf")).await?;
    let session = p1.manager().attach(id, true).await?;
    session.set_attribute("csrf", json!("local-only")).await?;
    p1.manager().complete_request(&session).await;

    cluster.set_available(false);
    println!("store down");
    for i in 0..writes {
        session.set_attribute(&format!("attr{}", i), json!(i)).await?;
    }
    let flushed = p1.manager().complete_request(&session).await;
    println!("flush during outage succeeded: {}", flushed);

    session.mark_all_for_reload()?;
    println!(
        "uncached read during outage = {:?}",
        session.get_attribute("never-set").await?
    );
    println!("cached read during outage = {:?}", session.get_attribute("attr0").await?);

    cluster.set_available(true);
    println!("store back");
    tokio::time::sleep(retry * 2).await;

    let flushed = p1.manager().complete_request(&session).await;
    println!("flush after recovery succeeded: {}", flushed);
    println!(
        "replicated names = {:?}",
        p1.client().get_attribute_names(id).await?
    );
    println!("{}", p1.stats()?);

    p1.shutdown().await?;
    Ok(())
}
