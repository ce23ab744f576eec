//! find-best - print the least-loaded forwarder
//!
//! Reads host descriptors from `MB_SERVER_FINDER_*` env vars (or the prefix
//! in `MB_SERVER_FINDER_PREFIX`), fetches each host's metric once and prints
//! the winner as `host:port`. Exits with an error when no host answered.

use rpc_balancer::EnvConfigLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = if std::env::var("DEBUG").is_ok() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .init();

    let loader = match std::env::var("MB_SERVER_FINDER_PREFIX") {
        Ok(prefix) => EnvConfigLoader::new(prefix),
        Err(_) => EnvConfigLoader::default(),
    };

    let finder = loader.init_metrics_based_server_finder()?;
    tracing::debug!(
        "ranking {} hosts by {}",
        finder.hosts().len(),
        finder.metric_name()
    );

    match finder.fetch_metrics().await {
        Some(best) => {
            println!("{}", best);
            Ok(())
        }
        None => anyhow::bail!("no host reported {}", finder.metric_name()),
    }
}
