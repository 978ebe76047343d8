//! TCP accept loop.
//!
//! Each accepted connection is served in its own task until it closes.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::context::AppContext;
use crate::session;

pub struct Server {
    listener: TcpListener,
    ctx: AppContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the configured listen address.
    pub async fn bind(ctx: AppContext) -> anyhow::Result<Self> {
        let addr = ctx.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            ctx,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Accept connections until `shutdown()` is called. Connections already
    /// being served keep running.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        info!(addr = %self.local_addr()?, "Server listening");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                            }
                            tokio::spawn(session::serve(stream, peer_addr, self.ctx.clone()));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
