//! Server configuration.

use std::time::Duration;

use clap::Parser;

use crate::types::InstanceId;

#[derive(Parser, Debug, Clone)]
#[command(name = "groupline-server", about = "Group chat WebSocket server")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "GROUPLINE_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path. `:memory:` keeps everything in memory.
    #[arg(long, env = "GROUPLINE_DB", default_value = "groupline.db")]
    pub db_path: String,

    /// Redis URL for the shared membership store and event bus.
    /// Without it the server runs as a single instance with an in-process store.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Secret used to sign and verify bearer tokens.
    #[arg(long, env = "GROUPLINE_TOKEN_SECRET", default_value = "")]
    pub token_secret: String,

    /// Instance ID recorded as the owner of this process's connections.
    /// Random if not set.
    #[arg(long)]
    pub instance_id: Option<InstanceId>,

    /// Per-connection outbound queue capacity.
    #[arg(long, default_value_t = 64)]
    pub outbound_queue: usize,

    /// Capacity of each hub request channel.
    #[arg(long, default_value_t = 256)]
    pub hub_queue: usize,

    /// Maximum inbound WebSocket frame size in bytes.
    #[arg(long, default_value_t = 4096)]
    pub max_frame_bytes: usize,

    /// Seconds a new socket has to send its auth frame.
    #[arg(long, default_value_t = 10)]
    pub auth_timeout_secs: u64,

    /// Per-write deadline in seconds.
    #[arg(long, default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Seconds without any inbound frame before a connection is dropped.
    /// Pings go out every 9/10 of this.
    #[arg(long, default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// TTL of the user → instance ownership record.
    #[arg(long, default_value_t = 90)]
    pub ownership_ttl_secs: u64,

    /// How often ownership TTLs are renewed.
    #[arg(long, default_value_t = 30)]
    pub refresh_interval_secs: u64,
}

impl ServerConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn ownership_ttl(&self) -> Duration {
        Duration::from_secs(self.ownership_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: "groupline.db".to_string(),
            redis_url: None,
            token_secret: String::new(),
            instance_id: None,
            outbound_queue: 64,
            hub_queue: 256,
            max_frame_bytes: 4096,
            auth_timeout_secs: 10,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            ownership_ttl_secs: 90,
            refresh_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_defaults_match_default_impl() {
        let parsed = ServerConfig::parse_from(["groupline-server"]);
        let default = ServerConfig::default();
        assert_eq!(parsed.outbound_queue, default.outbound_queue);
        assert_eq!(parsed.pong_wait_secs, default.pong_wait_secs);
        assert_eq!(parsed.refresh_interval_secs, default.refresh_interval_secs);
    }

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        let config = ServerConfig::default();
        assert_eq!(config.ping_period(), Duration::from_secs(54));
    }
}
