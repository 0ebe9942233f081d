use std::sync::Arc;
use anyhow::{Context, Result};
use soe_server::config::ServerConfig;
use soe_server::servers::connection::memory::MemoryProviders;
use soe_server::servers::connection::{ConnectionService, Providers};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/connection.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: connection_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = ServerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {}", conf_file))?;

    let providers = Arc::new(MemoryProviders::new(&config.dev_accounts));
    tracing::info!(
        "[connection] [dev_accounts] count={}",
        config.dev_accounts.len()
    );

    let service = ConnectionService::new(config, Providers::in_memory(providers));
    service.startup().context("Cannot register message handlers")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[connection] [signal] Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!("[connection] [started] Connection Server Started");
    service.run(shutdown_rx).await?;
    Ok(())
}
