use anyhow::Context;
use scylla_rust_models::config::ClusterConfig;
use scylla_rust_models::cql::{self, Replication};
use scylla_rust_models::db::Connections;
use scylla_rust_models::{forge, registry};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

// Apply a stored table model to a cluster:
//   scylla-rust-models <artifact> <model> <keyspace> [replication_factor]
// Connection settings come from SCYLLA_URI, SCYLLA_USER/SCYLLA_PASS and SCYLLA_SSL.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .try_init();

    let mut args = std::env::args().skip(1);
    let (Some(artifact), Some(model_name), Some(keyspace)) = (args.next(), args.next(), args.next())
    else {
        anyhow::bail!("usage: scylla-rust-models <artifact> <model> <keyspace> [replication_factor]");
    };
    let replication_factor: u32 = match args.next() {
        Some(rf) => rf
            .parse()
            .with_context(|| format!("replication_factor must be a positive integer, got '{rf}'"))?,
        None => 1,
    };

    let model = forge::retrieve(&artifact, &model_name)
        .with_context(|| format!("loading model '{model_name}' from {artifact}"))?;
    let config = ClusterConfig::from_env()?;
    let connections = Connections::new();
    let (cluster, connection) = connections.connect_and_register(&config).await?;
    info!(%cluster, "connected");

    cql::create_keyspace(connection.as_ref(), &keyspace, &Replication::simple(replication_factor))
        .await?;
    let binding = connections.bind(keyspace.as_str(), &cluster)?;
    registry::synchronize(&model, &binding).await?;
    info!(model = %model.name, %keyspace, "model synchronized");
    Ok(())
}
