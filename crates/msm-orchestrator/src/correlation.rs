// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Correlation of asynchronous replies with the command that caused them.
//!
//! A step registers a waiter under its correlation id, publishes its command,
//! then waits (bounded) for the dispatch path to fulfil the waiter. Each
//! waiter is single-shot: it is fulfilled at most once and consumed at most
//! once.
//!
//! Registering a second waiter under an id whose first waiter has not been
//! consumed replaces it; the replaced waiter observes [`Outcome::NoReply`].
//! Callers never pipeline two requests under the same id.

use dashmap::DashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::oneshot;

/// Result of waiting on a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Positive acknowledgement, with whatever the reply carried.
    Success(T),
    /// Negative acknowledgement with its reason.
    Failure(String),
    /// Nothing arrived within the timeout.
    NoReply,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

type Reply<T> = Result<T, String>;

/// Registry of pending single-shot waiters keyed by correlation id.
pub struct CorrelationRegistry<K, T>
where
    K: Eq + Hash,
{
    waiters: DashMap<K, oneshot::Sender<Reply<T>>>,
}

impl<K, T> CorrelationRegistry<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            waiters: DashMap::new(),
        }
    }

    /// Register a waiter for `id`. Must happen before the triggering command
    /// is published.
    pub fn register(&self, id: K) -> Waiter<'_, K, T> {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(id.clone(), tx).is_some() {
            tracing::debug!("correlation {}: replaced an unconsumed waiter", id);
        }
        Waiter {
            registry: self,
            id,
            rx,
        }
    }

    /// Fulfil the waiter for `id`. `Ok` encodes success, `Err(reason)` failure.
    ///
    /// Returns false when no waiter is registered (late, duplicate or
    /// unsolicited reply); this is never an error.
    pub fn fulfill(&self, id: &K, reply: Reply<T>) -> bool {
        let Some((_, tx)) = self.waiters.remove(id) else {
            tracing::debug!("correlation {}: no waiter registered, reply dropped", id);
            return false;
        };
        if tx.send(reply).is_err() {
            tracing::debug!("correlation {}: waiter already gone, reply dropped", id);
            return false;
        }
        true
    }

    /// Fulfil from a reason string: absent or empty means success.
    pub fn fulfill_reason(&self, id: &K, reason: Option<&str>, ack: T) -> bool {
        match reason {
            Some(r) if !r.is_empty() => self.fulfill(id, Err(r.to_string())),
            _ => self.fulfill(id, Ok(ack)),
        }
    }

    /// Whether a waiter is currently registered for `id`.
    pub fn is_pending(&self, id: &K) -> bool {
        self.waiters.contains_key(id)
    }

    /// Number of registered waiters.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

impl<K, T> Default for CorrelationRegistry<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A registered, not yet consumed waiter.
pub struct Waiter<'a, K, T>
where
    K: Eq + Hash,
{
    registry: &'a CorrelationRegistry<K, T>,
    id: K,
    rx: oneshot::Receiver<Reply<T>>,
}

impl<K, T> Waiter<'_, K, T>
where
    K: Eq + Hash,
{
    pub fn id(&self) -> &K {
        &self.id
    }

    /// Block (asynchronously) until the waiter is fulfilled or `timeout`
    /// elapses. No registry lock is held while waiting.
    pub async fn wait(mut self, timeout: Duration) -> Outcome<T> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Ok(value))) => Outcome::Success(value),
            Ok(Ok(Err(reason))) => Outcome::Failure(reason),
            // Sender dropped: the waiter was replaced.
            Ok(Err(_)) => Outcome::NoReply,
            Err(_) => Outcome::NoReply,
        }
        // Drop clears the stale registry entry.
    }
}

impl<K, T> Drop for Waiter<'_, K, T>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.rx.close();
        // Only clear our own entry, never a newer waiter under the same id.
        self.registry
            .waiters
            .remove_if(&self.id, |_, tx| tx.is_closed());
    }
}
