//! In-process hub that accepts every message.
//!
//! Counts traffic instead of sending it, and lets callers inject cloud events
//! and failures. Used for hub-less load runs of the simulator itself and as
//! the transport in simulator tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{ConnectOptions, DeviceCredentials, HubConnection, HubError, HubEvent, HubSession, HubTransport, hub_name};
use crate::sim::datagen::TelemetryMessage;

const EVENT_BUFFER: usize = 16;

#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connects: u64,
    pub closes: u64,
    pub messages: u64,
    pub bytes: u64,
    pub reported: u64,
    pub method_responses: u64,
}

#[derive(Default)]
struct Inner {
    connects: AtomicU64,
    closes: AtomicU64,
    messages: AtomicU64,
    bytes: AtomicU64,
    reported: AtomicU64,
    method_responses: AtomicU64,
    refuse_connects: AtomicU32,
    fail_sends: AtomicBool,
    listeners: Mutex<HashMap<String, mpsc::Sender<HubEvent>>>,
    patches: Mutex<HashMap<String, Vec<Map<String, Value>>>>,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

#[cfg(test)]
impl LoopbackTransport {
    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        let i = &self.inner;
        LoopbackStats {
            connects: i.connects.load(Ordering::Relaxed),
            closes: i.closes.load(Ordering::Relaxed),
            messages: i.messages.load(Ordering::Relaxed),
            bytes: i.bytes.load(Ordering::Relaxed),
            reported: i.reported.load(Ordering::Relaxed),
            method_responses: i.method_responses.load(Ordering::Relaxed),
        }
    }

    /// Refuse the next `count` connects as not authorized.
    pub fn refuse_next_connects(&self, count: u32) {
        self.inner.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Make every telemetry send fail as throttled until cleared.
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver a cloud event to a connected device. False when it is not connected.
    pub fn push_event(&self, device_id: &str, event: HubEvent) -> bool {
        let listeners = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.get(device_id).is_some_and(|tx| tx.try_send(event).is_ok())
    }

    #[must_use]
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner).contains_key(device_id)
    }

    /// Reported-property patches a device has sent, oldest first.
    #[must_use]
    pub fn reported_patches(&self, device_id: &str) -> Vec<Map<String, Value>> {
        let patches = self.inner.patches.lock().unwrap_or_else(PoisonError::into_inner);
        patches.get(device_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HubTransport for LoopbackTransport {
    async fn connect(&self, credentials: &DeviceCredentials, _options: &ConnectOptions) -> Result<HubSession, HubError> {
        let refused = self
            .inner
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(HubError::NotAuthorized);
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(credentials.device_id.clone(), tx);
        self.inner.connects.fetch_add(1, Ordering::Relaxed);

        let connection = LoopbackConnection {
            device_id: credentials.device_id.clone(),
            hub: hub_name(&credentials.host_name),
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        };
        Ok(HubSession { connection: Arc::new(connection), events: rx })
    }
}

struct LoopbackConnection {
    device_id: String,
    hub: String,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn ensure_open(&self) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) { Err(HubError::ConnectionClosed) } else { Ok(()) }
    }
}

#[async_trait]
impl HubConnection for LoopbackConnection {
    fn hub_name(&self) -> &str {
        &self.hub
    }

    async fn send_event(&self, message: &TelemetryMessage, _timeout: Duration) -> Result<(), HubError> {
        self.ensure_open()?;
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(HubError::Throttled("429 too many requests".into()));
        }
        self.inner.messages.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes.fetch_add(message.body.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn update_reported(&self, patch: &Map<String, Value>, _timeout: Duration) -> Result<(), HubError> {
        self.ensure_open()?;
        self.inner.reported.fetch_add(1, Ordering::Relaxed);
        self.inner
            .patches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.device_id.clone())
            .or_default()
            .push(patch.clone());
        Ok(())
    }

    async fn respond_method(&self, _request_id: &str, _status: u16, _body: &Value) -> Result<(), HubError> {
        self.ensure_open()?;
        self.inner.method_responses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.device_id);
        self.inner.closes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[path = "loopback_test.rs"]
mod tests;
