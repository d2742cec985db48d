//! Call scope carried through a chain of nested method calls
//!
//! A top-level call opens a scope with a fresh chain id. Nested calls made
//! from inside method bodies run in the same task and inherit it, which is
//! how gates recognise re-entry and how `player`, `context` and the deadline
//! flow down without being passed explicitly.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use super::ObjectId;
use crate::script::SessionContext;

tokio::task_local! {
    static SCOPE: CallScope;
}

/// Per-call options supplied by the caller
#[derive(Clone, Default)]
pub struct CallOptions {
    /// Acting player; defaults to the inherited player, then the receiver
    pub player: Option<ObjectId>,
    /// Opaque session context handed to method bodies
    pub context: Option<Rc<dyn SessionContext>>,
    /// Cooperative deadline for the whole chain (top-level calls only)
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_player(mut self, player: ObjectId) -> Self {
        self.player = Some(player);
        self
    }

    pub fn with_context(mut self, context: Rc<dyn SessionContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Ambient state of one call chain
#[derive(Clone)]
pub struct CallScope {
    pub chain: u64,
    pub deadline: Option<Instant>,
    pub player: Option<ObjectId>,
    pub context: Option<Rc<dyn SessionContext>>,
}

impl CallScope {
    /// Scope for a call with no enclosing chain
    pub fn top_level(chain: u64, options: CallOptions) -> Self {
        Self {
            chain,
            deadline: options.timeout.map(|t| Instant::now() + t),
            player: options.player,
            context: options.context,
        }
    }

    /// Scope for a nested call: same chain and deadline, caller overrides win
    pub fn nested(&self, options: CallOptions) -> Self {
        Self {
            chain: self.chain,
            deadline: self.deadline,
            player: options.player.or(self.player),
            context: options.context.or_else(|| self.context.clone()),
        }
    }

    /// The scope of the currently running call, if any
    pub fn current() -> Option<CallScope> {
        SCOPE.try_with(|s| s.clone()).ok()
    }

    /// True when running inside a chain whose deadline has passed
    pub fn deadline_passed() -> bool {
        SCOPE
            .try_with(|s| s.deadline.is_some_and(|d| Instant::now() >= d))
            .unwrap_or(false)
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Run `fut` with this scope installed
    pub async fn enter<F: Future>(self, fut: F) -> F::Output {
        SCOPE.scope(self, fut).await
    }
}
