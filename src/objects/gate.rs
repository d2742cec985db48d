//! Per-object call gate
//!
//! At most one call chain runs methods on an object at a time. A chain that
//! already holds the gate re-enters it (nested calls, `pass()`, calls back
//! into the receiver); other chains wait until it is released or their
//! deadline passes.

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, RuntimeError};

#[derive(Default)]
pub struct CallGate {
    inner: Rc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    /// (chain id, re-entry depth)
    owner: Cell<Option<(u64, u32)>>,
    released: Notify,
}

impl CallGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the gate on behalf of `chain`
    pub async fn enter(&self, chain: u64, deadline: Option<Instant>) -> Result<GateGuard> {
        loop {
            // Register interest before checking so a release in between is not lost
            let released = self.inner.released.notified();

            match self.inner.owner.get() {
                None => {
                    self.inner.owner.set(Some((chain, 1)));
                    return Ok(self.guard());
                }
                Some((owner, depth)) if owner == chain => {
                    self.inner.owner.set(Some((owner, depth + 1)));
                    return Ok(self.guard());
                }
                Some(_) => {}
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return Err(RuntimeError::DeadlineExceeded);
                    }
                }
                None => released.await,
            }
        }
    }

    /// Chain currently holding the gate
    pub fn holder(&self) -> Option<u64> {
        self.inner.owner.get().map(|(chain, _)| chain)
    }

    fn guard(&self) -> GateGuard {
        GateGuard {
            inner: self.inner.clone(),
        }
    }
}

/// Releases one level of the gate on drop
pub struct GateGuard {
    inner: Rc<GateInner>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        match self.inner.owner.get() {
            Some((chain, depth)) if depth > 1 => {
                self.inner.owner.set(Some((chain, depth - 1)));
            }
            _ => {
                self.inner.owner.set(None);
                self.inner.released.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reentry_same_chain() {
        let gate = CallGate::new();
        let outer = gate.enter(1, None).await.unwrap();
        let inner = gate.enter(1, None).await.unwrap();
        assert_eq!(gate.holder(), Some(1));
        drop(inner);
        assert_eq!(gate.holder(), Some(1));
        drop(outer);
        assert_eq!(gate.holder(), None);
    }

    #[tokio::test]
    async fn test_other_chain_waits() {
        let gate = CallGate::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        let first = async {
            let _g = gate.enter(1, None).await.unwrap();
            order.borrow_mut().push("first-in");
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            order.borrow_mut().push("first-out");
        };
        let second = async {
            tokio::task::yield_now().await;
            let _g = gate.enter(2, None).await.unwrap();
            order.borrow_mut().push("second-in");
        };
        tokio::join!(first, second);

        assert_eq!(*order.borrow(), vec!["first-in", "first-out", "second-in"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_respects_deadline() {
        let gate = CallGate::new();
        let _held = gate.enter(1, None).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(20);
        let result = gate.enter(2, Some(deadline)).await;
        assert!(matches!(result, Err(RuntimeError::DeadlineExceeded)));
        assert_eq!(gate.holder(), Some(1));
    }
}
