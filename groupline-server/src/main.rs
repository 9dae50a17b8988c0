use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (GROUPLINE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("GROUPLINE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("groupline_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = groupline_server::config::ServerConfig::parse();
    tracing::info!("Starting group chat server on {}", config.listen_addr);
    if config.redis_url.is_some() {
        tracing::info!("Redis shared store enabled");
    }
    let server = groupline_server::server::Server::new(config);
    server.run().await
}
