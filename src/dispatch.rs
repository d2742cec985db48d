//! World thread and top-level dispatch
//!
//! The object runtime is single-threaded, so it lives on a dedicated
//! "world" thread running a current-thread tokio runtime with a `LocalSet`.
//! Connections talk to it over channels. Each connection gets one local
//! task that turns its events into router calls, strictly in order; calls
//! from different connections interleave at await points.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::ServerMessage;
use crate::bootstrap::bootstrap;
use crate::config::RuntimeConfig;
use crate::objects::{CallOptions, ObjectId, ObjectManager, ObjectStore, Value};
use crate::script::SessionContext;

/// Generic reply when a dispatch fails; details stay in the server log
pub const DISPATCH_FAILED: &str = "Something went wrong.";

enum WorldRequest {
    Open {
        session: String,
        outbox: mpsc::UnboundedSender<ServerMessage>,
        lines: mpsc::UnboundedReceiver<String>,
    },
    Shutdown,
}

/// Handle to the world thread, shareable across the HTTP side
pub struct Dispatcher {
    requests: mpsc::UnboundedSender<WorldRequest>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the world thread, open and bootstrap the object space, and wait
    /// until it is ready to accept sessions
    pub async fn start(pool: SqlitePool, config: RuntimeConfig) -> Result<Self> {
        let (requests, inbox) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("world".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, world_main(pool, config, inbox, ready_tx));
            })?;

        ready_rx
            .await
            .map_err(|_| anyhow!("World thread exited during startup"))??;

        Ok(Self {
            requests,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register a connection. Lines sent through the returned handle are
    /// dispatched in order; dropping it ends the session.
    pub fn open_session(
        &self,
        session: &str,
        outbox: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<SessionHandle> {
        let (lines_tx, lines) = mpsc::unbounded_channel();
        self.requests
            .send(WorldRequest::Open {
                session: session.to_string(),
                outbox,
                lines,
            })
            .map_err(|_| anyhow!("World thread is not running"))?;
        Ok(SessionHandle { lines: lines_tx })
    }

    /// Ask the world thread to stop; pending sessions are dropped
    pub fn stop(&self) {
        let _ = self.requests.send(WorldRequest::Shutdown);
    }

    /// Stop the world thread and wait for it to exit
    pub async fn join(&self) {
        self.stop();
        let thread = self.thread.lock().ok().and_then(|mut t| t.take());
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                _ => error!("World thread panicked"),
            }
        }
    }
}

/// Sending side of one connection's input
pub struct SessionHandle {
    lines: mpsc::UnboundedSender<String>,
}

impl SessionHandle {
    /// Queue an input line; false once the world has gone away
    pub fn send_line(&self, line: &str) -> bool {
        self.lines.send(line.to_string()).is_ok()
    }
}

/// Session state visible to method bodies through `context`
pub struct Connection {
    id: String,
    outbox: mpsc::UnboundedSender<ServerMessage>,
    player: Cell<Option<ObjectId>>,
}

impl Connection {
    pub fn new(id: &str, outbox: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: id.to_string(),
            outbox,
            player: Cell::new(None),
        }
    }

    fn push(&self, message: ServerMessage) {
        if self.outbox.send(message).is_err() {
            debug!(session = %self.id, "Dropping output for closed connection");
        }
    }
}

impl SessionContext for Connection {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, text: &str) {
        self.push(ServerMessage::Output {
            text: text.to_string(),
        });
    }

    fn player(&self) -> Option<ObjectId> {
        self.player.get()
    }

    fn set_player(&self, player: Option<ObjectId>) {
        self.player.set(player);
    }
}

async fn world_main(
    pool: SqlitePool,
    config: RuntimeConfig,
    mut inbox: mpsc::UnboundedReceiver<WorldRequest>,
    ready: oneshot::Sender<Result<()>>,
) {
    let manager = match open_world(pool, config).await {
        Ok(manager) => manager,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while let Some(request) = inbox.recv().await {
        match request {
            WorldRequest::Open {
                session,
                outbox,
                lines,
            } => {
                let connection = Rc::new(Connection::new(&session, outbox));
                tokio::task::spawn_local(run_session(manager.clone(), connection, lines));
            }
            WorldRequest::Shutdown => break,
        }
    }

    manager.shutdown();
    info!("World thread stopped");
}

async fn open_world(pool: SqlitePool, config: RuntimeConfig) -> Result<ObjectManager> {
    let preload = config.preload.clone();
    let manager = ObjectManager::open(ObjectStore::new(pool), config).await?;
    bootstrap(&manager, &BTreeMap::new()).await?;

    let loaded = manager.preload(&preload).await?;
    let router = manager.config().router_alias.clone();
    manager.resolve_alias(&router).await?;

    info!(preloaded = loaded, router = %router, "World ready");
    Ok(manager)
}

/// Run one connection's events through the router, in order
pub async fn run_session(
    manager: ObjectManager,
    connection: Rc<Connection>,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    info!(session = %connection.id, "Session opened");
    dispatch(&manager, &connection, "on_connect", vec![], true).await;

    while let Some(line) = lines.recv().await {
        dispatch(&manager, &connection, "on_input", vec![Value::Str(line)], false).await;
    }

    dispatch(&manager, &connection, "on_disconnect", vec![], true).await;
    info!(session = %connection.id, "Session closed");
}

/// One top-level call into the router. Failures are logged and reported to
/// this connection only.
async fn dispatch(
    manager: &ObjectManager,
    connection: &Rc<Connection>,
    method: &str,
    args: Vec<Value>,
    optional: bool,
) {
    let alias = &manager.config().router_alias;
    let router = match manager.resolve_alias(alias).await {
        Ok(router) => router,
        Err(e) => {
            warn!(session = %connection.id, method, error = %e, "No router to dispatch to");
            connection.push(ServerMessage::Error {
                message: DISPATCH_FAILED.to_string(),
            });
            return;
        }
    };

    if optional {
        match router.has_method_async(method).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(session = %connection.id, method, error = %e, "Method lookup failed");
                return;
            }
        }
    }

    let context: Rc<dyn SessionContext> = connection.clone();
    let mut options = CallOptions::default().with_context(context);
    if let Some(player) = connection.player() {
        options = options.with_player(player);
    }
    if let Some(timeout) = manager.config().dispatch_timeout() {
        options = options.with_timeout(timeout);
    }

    match router.call_with(method, args, options).await {
        Ok(Value::Null) => {}
        Ok(Value::Str(text)) => connection.send(&text),
        Ok(other) => connection.send(&other.to_string()),
        Err(e) => {
            warn!(session = %connection.id, method, error = %e, "Dispatch failed");
            connection.push(ServerMessage::Error {
                message: DISPATCH_FAILED.to_string(),
            });
        }
    }
}
