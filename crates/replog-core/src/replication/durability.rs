//! Durability futures
//!
//! A [`DurabilityFuture`] is handed to the writer as soon as an append hits
//! the master's local log. The matching [`DurabilityPromise`] is held by the
//! quorum tracker and settles the future exactly once. Any number of clones
//! may wait on the same future; waiting never affects the write itself.

use crate::wal::LogOffset;
use crate::{Error, Result};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;

/// Settlement state of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Durability {
    /// Not enough copies yet
    Pending,
    /// Replication factor reached
    Durable,
    /// The write can never become durable
    Failed(String),
}

impl Durability {
    /// True while unsettled
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// True once the replication factor was reached
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable)
    }
}

/// Producer side of a durability future
#[derive(Debug)]
pub struct DurabilityPromise {
    tx: watch::Sender<Durability>,
}

impl DurabilityPromise {
    /// Create a linked promise/future pair for the write at `offset`
    pub fn new(offset: Option<LogOffset>) -> (Self, DurabilityFuture) {
        let (tx, rx) = watch::channel(Durability::Pending);
        (Self { tx }, DurabilityFuture { offset, rx })
    }

    /// Mark the write durable. Returns false if it was already settled.
    pub fn resolve(&self) -> bool {
        self.settle(Durability::Durable)
    }

    /// Mark the write failed. Returns false if it was already settled.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(Durability::Failed(reason.into()))
    }

    /// Current state
    pub fn state(&self) -> Durability {
        self.tx.borrow().clone()
    }

    fn settle(&self, outcome: Durability) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = outcome;
                true
            } else {
                false
            }
        })
    }
}

/// Asynchronous handle on the durability of one write
#[derive(Debug, Clone)]
pub struct DurabilityFuture {
    offset: Option<LogOffset>,
    rx: watch::Receiver<Durability>,
}

impl DurabilityFuture {
    /// A future that is already durable
    pub fn resolved(offset: LogOffset) -> Self {
        let (promise, future) = DurabilityPromise::new(Some(offset));
        promise.resolve();
        future
    }

    /// A future that already failed
    pub fn failed(offset: Option<LogOffset>, reason: impl Into<String>) -> Self {
        let (promise, future) = DurabilityPromise::new(offset);
        promise.fail(reason);
        future
    }

    /// Offset of the write, if it reached the local log
    pub fn offset(&self) -> Option<LogOffset> {
        self.offset
    }

    /// Current state, without waiting
    pub fn state(&self) -> Durability {
        self.rx.borrow().clone()
    }

    /// True once durable
    pub fn is_durable(&self) -> bool {
        self.rx.borrow().is_durable()
    }

    /// Wait up to `timeout` for the write to become durable.
    ///
    /// `false` means "not durable yet" (or failed); a pending write may
    /// still complete after this returns. Once the producer is gone
    /// without settling, the write can no longer complete and this
    /// returns `false` without waiting out the timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        self.settled(timeout).await.is_durable()
    }

    /// Wait up to `timeout` for settlement and return the state observed
    pub async fn settled(&self, timeout: Duration) -> Durability {
        let mut rx = self.rx.clone();
        let waited = tokio::time::timeout(timeout, async move {
            rx.wait_for(|s| !s.is_pending()).await.map(|s| s.clone())
        })
        .await;
        match waited {
            Ok(Ok(state)) => state,
            _ => self.state(),
        }
    }
}

impl IntoFuture for DurabilityFuture {
    type Output = Result<LogOffset>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    /// Wait without bound. Errors if the write failed or can no longer settle.
    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let mut rx = self.rx;
            let offset = self.offset.unwrap_or_default();
            let settled = rx.wait_for(|s| !s.is_pending()).await.map(|s| s.clone());
            let state = match settled {
                Ok(state) => state,
                Err(_) => {
                    return Err(Error::stopped(format!(
                        "write at offset {} abandoned before becoming durable",
                        offset
                    )));
                }
            };
            match state {
                Durability::Durable => Ok(offset),
                Durability::Failed(reason) => Err(Error::replication(reason)),
                Durability::Pending => Err(Error::internal("settled future still pending")),
            }
        })
    }
}
