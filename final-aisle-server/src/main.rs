//! Final Aisle Server
//!
//! Relay server binary with an operator console on stdin.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use final_aisle::network::auth::AuthConfig;
use final_aisle::network::mail::{LogMailer, Mailer, SmtpConfig, SmtpMailer};
use final_aisle::{AccountDirectory, RelayServer, ServerConfig, StorageConfig, VERSION};

const COMMANDS: &[(&str, &str)] = &[
    ("help", "List console commands"),
    ("status", "Show connection, online and account counts"),
    ("shutdown", "Stop accepting, close sessions and exit"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Final Aisle Server v{}", VERSION);

    let server_config = ServerConfig::from_env();
    let auth_config = AuthConfig::from_env();
    let storage_config = StorageConfig::from_env();

    let accounts = AccountDirectory::open(&storage_config).with_context(|| {
        format!("failed to open account directory {}", storage_config.data_dir.display())
    })?;
    info!(
        accounts = accounts.len(),
        data_dir = %storage_config.data_dir.display(),
        "Account directory loaded"
    );

    let mailer: Arc<dyn Mailer> = match SmtpConfig::from_env() {
        Some(smtp) => {
            info!(host = %smtp.host, port = smtp.port, "Verification mail via SMTP");
            Arc::new(SmtpMailer::new(&smtp).context("invalid SMTP settings")?)
        }
        None => {
            warn!("FINAL_AISLE_SMTP_HOST not set, verification mail is only logged");
            Arc::new(LogMailer)
        }
    };

    let server = Arc::new(RelayServer::new(server_config.clone(), auth_config, accounts, mailer));

    tokio::spawn(console(server.clone(), spawn_stdin_reader()));
    tokio::spawn({
        let server = server.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl-C received");
                    server.shutdown();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        }
    });

    server
        .run()
        .await
        .with_context(|| format!("server failed on {}", server_config.bind_addr))?;

    info!("Goodbye");
    Ok(())
}

/// Forward stdin lines from a dedicated thread.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Console read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

async fn console(server: Arc<RelayServer>, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        match line.trim().to_ascii_lowercase().as_str() {
            "" => {}
            "help" => {
                for (name, description) in COMMANDS {
                    info!("{:<10} {}", name, description);
                }
            }
            "status" => {
                let traffic = server.stats().snapshot();
                let connections = server.connection_count().await;
                let online = server.online_count().await;
                let accounts = server.account_count().await;
                info!(
                    connections,
                    online,
                    accounts,
                    sent = traffic.sent,
                    received = traffic.received,
                    "Status"
                );
            }
            "shutdown" => {
                info!("Shutting down");
                server.shutdown();
                break;
            }
            _ => info!("Unrecognized command! Type \"help\" for a list of commands."),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use final_aisle::network::mail::MemoryMailer;
    use final_aisle::SymmetricKey;

    use super::*;

    #[tokio::test]
    async fn test_console_status_then_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = AccountDirectory::open_with_key(dir.path(), SymmetricKey::generate()).unwrap();
        let server = Arc::new(RelayServer::new(
            ServerConfig::default(),
            AuthConfig::default(),
            accounts,
            Arc::new(MemoryMailer::new()),
        ));

        let (tx, rx) = mpsc::channel(4);
        let running = tokio::spawn(console(server, rx));
        tx.send("status".to_string()).await.unwrap();
        tx.send("shutdown".to_string()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
