//! Mint a bearer token for a user, creating the user if needed.
//!
//! Usage:
//!   GROUPLINE_TOKEN_SECRET=... \
//!     cargo run --bin issue-token -- --db-path groupline.db --username alice
//!
//! Prints `<user id> <token>` on stdout. The secret must match the one the
//! server verifies with.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use groupline_server::auth::TokenAuthenticator;
use groupline_server::db::SqlitePersistence;
use groupline_server::persistence::Persistence;

#[derive(Parser)]
struct Args {
    /// SQLite database shared with the server.
    #[arg(long, env = "GROUPLINE_DB", default_value = "groupline.db")]
    db_path: String,

    /// Token signing secret.
    #[arg(long, env = "GROUPLINE_TOKEN_SECRET")]
    secret: String,

    /// User to issue the token for.
    #[arg(long)]
    username: String,

    /// Token lifetime in seconds.
    #[arg(long, default_value_t = 86_400)]
    ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let db = SqlitePersistence::open(&args.db_path).context("Failed to open database")?;
    let user = match db.find_user_by_name(&args.username).await? {
        Some(user) => user,
        None => {
            let user = db.create_user(&args.username).await?;
            tracing::info!(user = %user.id, username = %user.username, "Created user");
            user
        }
    };

    let token = TokenAuthenticator::new(&args.secret).issue(user.id, Duration::from_secs(args.ttl_secs));
    println!("{} {token}", user.id);
    Ok(())
}
