//! World bootstrap
//!
//! Brings a database to a usable state: core aliases, a default router that
//! turns input lines into command calls, and optional library methods on the
//! root. Every step checks before it writes, so running it against an
//! existing world changes nothing.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::db::Database;
use crate::error::RuntimeError;
use crate::objects::{
    MethodDef, MethodOptions, Methods, ObjectId, ObjectManager, ObjectStore, Properties, Value,
    ALIAS_HOLDER_ID, ROOT_ID,
};

/// Reply for input whose verb resolves to no command
pub const UNKNOWN_COMMAND: &str = "I don't understand that.";

const ROUTER_ON_INPUT: &str = r#"
local line = args[1] or ""
local verb, rest = string.match(line, "^%s*(%S+)%s*(.-)%s*$")
if not verb then
  return nil
end
local method = player:command(string.lower(verb))
if method == nil then
  return "I don't understand that."
end
return player:call(method, rest)
"#;

const ROUTER_PING: &str = r#"return "pong""#;

/// What a bootstrap run changed
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub aliases_added: Vec<String>,
    pub router_created: Option<ObjectId>,
    pub libs_attached: Vec<String>,
    pub libs_skipped: Vec<String>,
}

impl BootstrapReport {
    /// True when the run found everything already in place
    pub fn is_noop(&self) -> bool {
        self.aliases_added.is_empty()
            && self.router_created.is_none()
            && self.libs_attached.is_empty()
    }
}

/// Ensure core aliases, the router, and library methods exist
pub async fn bootstrap(
    manager: &ObjectManager,
    libs: &BTreeMap<String, String>,
) -> Result<BootstrapReport, RuntimeError> {
    let mut report = BootstrapReport::default();

    for (name, id) in [("root", ROOT_ID), ("system", ALIAS_HOLDER_ID)] {
        if manager.aliases().contains_key(name) {
            continue;
        }
        let handle = manager.load(id).await?;
        manager.register_alias(name, &handle).await?;
        report.aliases_added.push(name.to_string());
    }

    let router_alias = manager.config().router_alias.clone();
    if !manager.aliases().contains_key(&router_alias) {
        let mut methods = Methods::new();
        methods.insert("on_input".to_string(), MethodDef::new(ROUTER_ON_INPUT));
        methods.insert(
            "ping".to_string(),
            MethodDef::with_options(ROUTER_PING, MethodOptions::command(&[])),
        );
        let mut properties = Properties::new();
        properties.insert("name".to_string(), Value::from("router"));

        let router = manager.create(Some(ROOT_ID), properties, methods).await?;
        manager.register_alias(&router_alias, &router).await?;
        report.router_created = Some(router.id());
        report.aliases_added.push(router_alias);
    }

    let root = manager.load(ROOT_ID).await?;
    for (name, source) in libs {
        if root.own_method(name).is_some() {
            report.libs_skipped.push(name.clone());
            continue;
        }
        root.set_method(name, source, MethodOptions::default()).await?;
        report.libs_attached.push(name.clone());
    }

    if report.is_noop() {
        info!("World already bootstrapped");
    } else {
        info!(
            aliases = ?report.aliases_added,
            router = ?report.router_created,
            libs = ?report.libs_attached,
            "Bootstrapped world"
        );
    }
    Ok(report)
}

/// Open (creating if needed) a database file and bootstrap it
pub async fn init_database(path: &Path, libs: BTreeMap<String, String>) -> Result<BootstrapReport> {
    let path_str = path
        .to_str()
        .with_context(|| format!("Database path is not valid UTF-8: {}", path.display()))?;

    info!("Initializing world database at {}", path.display());
    let db = Database::new(Some(path_str)).await?;
    let store = ObjectStore::new(db.pool().clone());
    let manager = ObjectManager::open(store, RuntimeConfig::default()).await?;

    let report = bootstrap(&manager, &libs).await?;

    manager.shutdown();
    db.close().await;
    info!("Database initialization complete");
    Ok(report)
}
