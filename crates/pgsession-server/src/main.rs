use clap::Parser;
use pgsession_server::auth::{hash_password, AuthManager};
use pgsession_server::config::Config;
use pgsession_server::scripted::{Script, ScriptedBackend};
use pgsession_server::server::{serve_metrics, Server, ServerOptions};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "pgsession-server", about = "PostgreSQL wire protocol server")]
struct Args {
    #[arg(long, default_value = "pgsession.toml")]
    config: String,
    /// Overrides server.listen_addr.
    #[arg(long)]
    listen: Option<String>,
    /// Prints an argon2 hash for a user's password_hash and exits.
    #[arg(long, value_name = "PASSWORD")]
    hash_password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if let Some(password) = args.hash_password {
        println!("{}", hash_password(&password)?);
        return Ok(());
    }

    let mut config = Config::from_path(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    let level: tracing::Level = config.logging.level.parse()?;
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(addr) = &config.metrics.listen_addr {
        serve_metrics(addr).await?;
    }

    let auth = Arc::new(AuthManager::new(&config.auth)?);
    let script = Arc::new(Script::new(&config.queries));
    let options = ServerOptions {
        max_connections: config.server.max_connections,
        idle_timeout: config.idle_timeout(),
        charset: config.session.charset,
        session: Arc::new(config.session_settings()),
    };
    let server = Server::bind(&config.server.listen_addr, options, move || {
        ScriptedBackend::new(auth.clone(), script.clone())
    })
    .await?;

    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
