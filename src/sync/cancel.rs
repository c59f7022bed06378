// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-application cancellation, triggered when an Application is deleted.

use crate::error::{DriftwoodError, Result};
use std::future::Future;
use tokio::sync::watch;

/// Side that requests cancellation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Side observed by in-flight work
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token that is never cancelled, for one-shot CLI operations
    pub fn never() -> Self {
        cancellation().1
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without cancelling
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Run a future unless cancellation is requested first
    pub async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut token = self.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DriftwoodError::Cancelled(what.to_string())),
            result = fut => result,
        }
    }
}
