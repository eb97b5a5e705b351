//! Background server sync.
//!
//! Once an online activation exists, a tokio task re-validates it against
//! the backend at the token's sync interval. At most one sync runs at a
//! time; a request arriving while one is in flight is dropped. Results
//! travel over a channel to a single dispatcher task, so the license
//! callback never runs concurrently with itself.

use crate::activation::ActivationMode;
use crate::backend::{BackendError, BackendResult, SyncRequest};
use crate::engine::EngineInner;
use crate::error::LicenseError;
use crate::meter::MeterLedger;
use crate::status::StatusCode;
use crate::token::ActivationToken;
use keyward_types::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback receiving sync outcomes.
pub type StatusCallback = Arc<dyn Fn(StatusCode) + Send + Sync>;

/// Sync bookkeeping for one activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_success: Timestamp,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_attempt: Option<Timestamp>,
    /// Latest wall-clock time observed for this activation.
    pub watermark: Timestamp,
}

impl SyncState {
    pub fn new(now: Timestamp) -> Self {
        Self {
            last_success: now,
            consecutive_failures: 0,
            last_attempt: None,
            watermark: now,
        }
    }

    pub fn record_success(&mut self, now: Timestamp) {
        self.last_success = self.last_success.max(now);
        self.consecutive_failures = 0;
        self.last_attempt = Some(now);
        self.observe(now);
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt = Some(now);
        self.observe(now);
    }

    /// Advances the watermark. Returns true if it moved.
    pub fn observe(&mut self, now: Timestamp) -> bool {
        if now > self.watermark {
            self.watermark = now;
            true
        } else {
            false
        }
    }

    /// True if the clock reads earlier than the watermark by more than `tolerance_secs`.
    pub fn rolled_back(&self, now: Timestamp, tolerance_secs: i64) -> bool {
        now.plus_secs(tolerance_secs) < self.watermark
    }

    /// End of the grace period; `None` when `grace_secs` is 0.
    pub fn grace_expires_at(&self, grace_secs: i64) -> Option<Timestamp> {
        (grace_secs > 0).then(|| self.last_success.plus_secs(grace_secs))
    }

    pub fn grace_lapsed(&self, now: Timestamp, grace_secs: i64) -> bool {
        self.grace_expires_at(grace_secs).is_some_and(|end| now > end)
    }
}

// ── Scheduler ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct SyncScheduler {
    in_flight: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag when dropped.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncScheduler {
    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlight(&self.in_flight))
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Starts the periodic sync loop if an online activation wants one.
pub(crate) fn ensure_sync_task(inner: &Arc<EngineInner>) {
    if inner.scheduler.stopped.load(Ordering::SeqCst) || inner.sync_interval().is_none() {
        return;
    }
    if inner.scheduler.running.swap(true, Ordering::SeqCst) {
        return;
    }
    let Ok(handle) = Handle::try_current() else {
        debug!("no async runtime; background sync deferred");
        inner.scheduler.running.store(false, Ordering::SeqCst);
        return;
    };

    let weak = Arc::downgrade(inner);
    let task = handle.spawn(async move {
        loop {
            let Some(interval) = weak.upgrade().and_then(|inner| inner.sync_interval()) else {
                break;
            };
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.sync_once().await;
        }

        if let Some(inner) = weak.upgrade() {
            debug!("background sync loop stopped");
            inner.scheduler.running.store(false, Ordering::SeqCst);
            if inner.sync_interval().is_some() {
                ensure_sync_task(&inner);
            }
        }
    });

    *inner
        .scheduler
        .task
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
}

/// Requests one sync in the background, unless one is already running or
/// the activation has sync disabled.
pub(crate) fn trigger_sync(inner: &Arc<EngineInner>) {
    if inner.scheduler.stopped.load(Ordering::SeqCst) || inner.sync_interval().is_none() {
        return;
    }
    ensure_sync_task(inner);
    if inner.scheduler.is_in_flight() {
        debug!("sync already in flight; request coalesced");
        return;
    }
    let Ok(handle) = Handle::try_current() else {
        debug!("no async runtime; sync request dropped");
        return;
    };
    let inner = Arc::clone(inner);
    handle.spawn(async move {
        inner.sync_once().await;
    });
}

impl EngineInner {
    /// Interval of the periodic loop; `None` when there is nothing to sync.
    pub(crate) fn sync_interval(&self) -> Option<Duration> {
        let state = self.read_state();
        let record = state.license.activation.as_ref()?;
        if record.mode != ActivationMode::Online || record.terminal.is_some() {
            return None;
        }
        let secs = record.sync_interval_secs;
        (secs > 0).then(|| {
            let secs = secs.max(self.settings.min_sync_interval_secs).max(1);
            Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
        })
    }

    /// Runs one sync attempt and delivers its status to the callback.
    ///
    /// Returns `None` when another sync is in flight, there is no online
    /// activation to sync, or the activation changed while the request
    /// was out.
    pub(crate) async fn sync_once(&self) -> Option<StatusCode> {
        let _in_flight = self.scheduler.try_begin()?;
        let request = self.sync_request()?;

        debug!("syncing activation {}", request.activation_id);
        let result = self.backend.sync_activation(&request).await;
        let status = self.apply_sync_result(&request.activation_id, result)?;

        self.events.deliver(status);
        Some(status)
    }

    fn sync_request(&self) -> Option<SyncRequest> {
        let state = self.read_state();
        let product = state.config.product().ok()?;
        let record = state.license.activation.as_ref()?;
        if record.mode != ActivationMode::Online || record.terminal.is_some() {
            return None;
        }
        Some(SyncRequest {
            product_id: product.product_id,
            activation_id: record.activation_id.clone(),
            license_key: record.license_key.clone(),
            fingerprint: self.fingerprint.as_str().to_string(),
            meter_attributes: record.ledger.snapshot(),
            app_version: state.config.app_version().map(str::to_string),
        })
    }

    fn apply_sync_result(
        &self,
        activation_id: &str,
        result: BackendResult<String>,
    ) -> Option<StatusCode> {
        let now = self.now();
        let tolerance = self.settings.clock_tolerance_secs;
        let mut guard = self.write_state();
        let state = &mut *guard;

        let verifier = self.verifier(&state.config).ok()?;
        let Some(record) = state
            .license
            .activation
            .as_mut()
            .filter(|r| r.activation_id == activation_id)
        else {
            debug!("activation {activation_id} changed during sync; result dropped");
            return None;
        };

        if record.sync.rolled_back(now, tolerance) {
            warn!("clock moved backward during sync of activation {activation_id}");
            return Some(StatusCode::TimeModified);
        }

        let grace = record.grace_period_secs;
        let status = match result {
            Ok(raw) => match verifier.verify_for_machine::<ActivationToken>(&raw, self.fingerprint.as_str()) {
                Ok(token) => {
                    record.sync.record_success(now);
                    record.restriction = None;
                    record.ledger = MeterLedger::from_snapshot(token.meter_attributes.clone());
                    record.sync_interval_secs = token.server_sync_interval_secs;
                    record.grace_period_secs = token.grace_period_secs;
                    record.token = raw;
                    if token.is_expired_at(now) {
                        record.terminal = Some(StatusCode::Expired);
                        StatusCode::Expired
                    } else {
                        info!("activation {activation_id} synced");
                        StatusCode::Ok
                    }
                }
                Err(LicenseError::MachineFingerprint) => {
                    record.terminal = Some(StatusCode::MachineFingerprintChanged);
                    StatusCode::MachineFingerprintChanged
                }
                Err(e) => {
                    warn!("sync returned an unusable token: {e}");
                    record.sync.record_failure(now);
                    failure_status(record.sync.grace_lapsed(now, grace), StatusCode::ServerError)
                }
            },
            Err(BackendError::Network(msg)) => {
                debug!("sync failed: {msg}");
                record.sync.record_failure(now);
                failure_status(record.sync.grace_lapsed(now, grace), StatusCode::NetworkError)
            }
            Err(BackendError::Server(msg)) => {
                debug!("sync failed: {msg}");
                record.sync.record_failure(now);
                failure_status(record.sync.grace_lapsed(now, grace), StatusCode::ServerError)
            }
            Err(BackendError::RateLimited) => {
                record.sync.record_failure(now);
                StatusCode::RateLimited
            }
            Err(BackendError::Rejected(rejection)) => {
                let status = StatusCode::from(&LicenseError::from(BackendError::Rejected(rejection)));
                if status.is_terminal() {
                    warn!("activation {activation_id} rejected by server: {status}");
                    record.terminal = Some(status);
                } else {
                    record.sync.record_failure(now);
                    if status.is_restriction() {
                        warn!("activation {activation_id} restricted by server: {status}");
                        record.restriction = Some(status);
                    }
                }
                status
            }
        };

        if let Err(e) = state.save_activation() {
            warn!("failed to persist sync state: {e}");
        }
        Some(status)
    }
}

fn failure_status(grace_lapsed: bool, status: StatusCode) -> StatusCode {
    if grace_lapsed {
        StatusCode::GracePeriodOver
    } else {
        status
    }
}

// ── Callback dispatch ───────────────────────────────────────────

/// Single-consumer sink in front of the registered license callback.
pub(crate) struct StatusSink {
    callback: Arc<RwLock<Option<StatusCallback>>>,
    tx: mpsc::UnboundedSender<StatusCode>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<StatusCode>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl StatusSink {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            callback: Arc::new(RwLock::new(None)),
            tx,
            rx: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
        }
    }

    pub(crate) fn set_callback(&self, callback: StatusCallback) {
        *self
            .callback
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    pub(crate) fn deliver(&self, status: StatusCode) {
        self.ensure_dispatcher();
        if self.tx.send(status).is_err() {
            debug!("status dispatcher gone; dropping {status}");
        }
    }

    fn ensure_dispatcher(&self) {
        let mut rx_slot = self.rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if rx_slot.is_none() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let Some(mut rx) = rx_slot.take() else {
            return;
        };

        let callback = Arc::clone(&self.callback);
        let task = handle.spawn(async move {
            while let Some(status) = rx.recv().await {
                let current = callback
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                match current {
                    Some(cb) => cb(status),
                    None => debug!("no license callback registered; dropping {status}"),
                }
            }
        });
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
    }

    pub(crate) fn shutdown(&self) {
        let task = self
            .dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
