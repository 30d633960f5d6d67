use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::Result;
use crate::scheduler::{spawn_aging_task, Scheduler};
use crate::server::connection::handle_connection;

/// The master's TCP front end.
pub struct MasterServer {
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    config: MasterConfig,
}

impl MasterServer {
    /// Bind the listener. `listen_port` in `config` is not consulted; the
    /// caller picks the address so tests can bind an ephemeral port.
    pub async fn bind(addr: impl ToSocketAddrs, config: MasterConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let scheduler = Arc::new(Scheduler::new(config.scheduling_algorithm));
        Ok(Self {
            listener,
            scheduler,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(
            addr = %addr,
            algorithm = %self.config.scheduling_algorithm,
            aging_interval_ms = self.config.aging_interval_ms,
            "Master listening"
        );

        let aging = self
            .config
            .aging_interval()
            .map(|period| spawn_aging_task(self.scheduler.clone(), period, shutdown.child_token()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!(remote = %remote, "Accepted connection");
                        let scheduler = self.scheduler.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            handle_connection(stream, scheduler, token).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        if let Some(aging) = aging {
            let _ = aging.await;
        }
        tracing::info!("Master stopped");
        Ok(())
    }
}
