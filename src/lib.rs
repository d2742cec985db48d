//! protomud - prototype-object MUD server
//!
//! A persistent object runtime: every object is a record with a parent,
//! properties and Lua methods. Reads and method lookups fall through to the
//! parent chain; writes land locally and reach SQLite before the call returns.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod lua;
pub mod objects;
pub mod script;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub use config::{Config, RuntimeConfig};
pub use error::RuntimeError;

use db::Database;
use dispatch::Dispatcher;

/// The protomud server instance
pub struct Server {
    config: Config,
    db: Arc<Database>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Create a new server instance; the world is open and bootstrapped on return
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(config.db_path.as_deref()).await?;
        let dispatcher = Dispatcher::start(db.pool().clone(), config.runtime.clone()).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            db: Arc::new(db),
            dispatcher: Arc::new(dispatcher),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the database handle
    pub fn db(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Build the router
    fn router(&self) -> Router {
        api::router(self.db.clone(), self.dispatcher.clone())
    }

    /// Run the server until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already-bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("protomud listening on {}", local_addr);

        let router = self.router();
        let mut shutdown_rx = self.shutdown_rx.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await?;

        self.dispatcher.join().await;
        self.db.close().await;
        info!("protomud shutdown complete");
        Ok(())
    }

    /// Signal the server to shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }
}
