//! Shared test helpers for license engine tests.

#![allow(dead_code)]

use async_trait::async_trait;
use keyward_crypto::{KdfParams, SigningKey, seal_envelope};
use keyward_license::backend::{
    ActivationRequest, BackendError, BackendResult, DeactivationRequest, LicenseBackend,
    MeterUsesReport, ReleaseInfo, ReleaseQuery, SyncRequest, TrialActivationRequest,
};
use keyward_license::offline::{self, OfflineResponse, RequestBody, ResponseBody};
use keyward_license::{
    ActivationToken, DeviceFingerprint, EngineConfig, LicenseEngine, LicenseType, LicenseUser,
    MeterAttribute, StorageScope, TrialToken,
};
use keyward_types::{Clock, ManualClock, ProductId, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const PRODUCT_ID: &str = "6f1d3a52-5c0e-4b8e-9a55-7d2f3c1b9e01";
pub const OTHER_PRODUCT_ID: &str = "0b8c6e0e-1f3a-4d2b-8c47-2a9d5e6f7a10";
pub const LICENSE_KEY: &str = "KW-TEST-0001-ABCD";
pub const FINGERPRINT: &str = "5c1e0c3b9a7f4d2e8b6a1c0d9e8f7a6b5c4d3e2f1a0b9c8d7e6f5a4b3c2d1e0f";

/// 2025-06-15T00:00:00Z
pub const START: i64 = 1_749_945_600;

/// Routes engine logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Returns a deterministic Ed25519 signing key from a fixed seed.
pub fn test_keypair() -> SigningKey {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    SigningKey::from_bytes(&seed)
}

/// A second key that is not the product key.
pub fn rogue_keypair() -> SigningKey {
    SigningKey::from_bytes(&[9u8; 32])
}

pub fn product_id() -> ProductId {
    ProductId::parse(PRODUCT_ID).unwrap()
}

/// Product descriptor JSON for [`PRODUCT_ID`].
pub fn descriptor_json() -> String {
    format!(
        r#"{{"product_id":"{PRODUCT_ID}","public_key":"{}","metadata":{{"edition":"pro"}}}}"#,
        test_keypair().verifying_key().to_base64()
    )
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        kdf: KdfParams::light(),
        min_sync_interval_secs: 1,
        ..EngineConfig::default()
    }
}

// ── Mock backend ────────────────────────────────────────────────

/// Backend operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Activate,
    Deactivate,
    Sync,
    Trial,
    Meter,
    Release,
}

/// What the mock puts into the tokens it issues.
#[derive(Debug, Clone)]
pub struct TokenPlan {
    pub activation_id: String,
    pub license_type: LicenseType,
    /// `None` issues perpetual licenses.
    pub expires_in_secs: Option<i64>,
    pub sync_interval_secs: i64,
    pub grace_period_secs: i64,
    pub meter_attributes: Vec<MeterAttribute>,
    pub user: LicenseUser,
    pub license_metadata: BTreeMap<String, String>,
    /// Binds issued tokens to another machine.
    pub fingerprint_override: Option<String>,
    /// Issues tokens for another product.
    pub product_override: Option<ProductId>,
    pub trial_days: i64,
}

impl Default for TokenPlan {
    fn default() -> Self {
        Self {
            activation_id: "act-0001".to_string(),
            license_type: LicenseType::NodeLocked,
            expires_in_secs: Some(365 * 86_400),
            sync_interval_secs: 0,
            grace_period_secs: 0,
            meter_attributes: vec![MeterAttribute::new("exports", 10)],
            user: LicenseUser {
                email: "ada@example.com".to_string(),
                name: "Ada".to_string(),
                company: "Analytical Engines Ltd".to_string(),
                metadata: BTreeMap::from([("seat".to_string(), "1".to_string())]),
            },
            license_metadata: BTreeMap::from([("tier".to_string(), "gold".to_string())]),
            fingerprint_override: None,
            product_override: None,
            trial_days: 14,
        }
    }
}

/// In-process backend that signs real tokens with [`test_keypair`].
#[derive(Debug)]
pub struct MockBackend {
    clock: Arc<ManualClock>,
    plan: Mutex<TokenPlan>,
    failures: Mutex<HashMap<Op, BackendError>>,
    calls: Mutex<HashMap<Op, usize>>,
    reports: Mutex<Vec<MeterUsesReport>>,
    syncs: Mutex<Vec<SyncRequest>>,
    activations: Mutex<Vec<ActivationRequest>>,
    release: Mutex<ReleaseInfo>,
    holds: Mutex<HashMap<Op, Arc<Notify>>>,
}

impl MockBackend {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            plan: Mutex::new(TokenPlan::default()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            reports: Mutex::new(Vec::new()),
            syncs: Mutex::new(Vec::new()),
            activations: Mutex::new(Vec::new()),
            release: Mutex::new(ReleaseInfo {
                update_available: false,
                latest_version: None,
            }),
            holds: Mutex::new(HashMap::new()),
        }
    }

    pub fn update_plan(&self, change: impl FnOnce(&mut TokenPlan)) {
        change(&mut self.plan.lock().unwrap());
    }

    /// Makes every call of `op` fail with `err` until cleared.
    pub fn fail(&self, op: Op, err: BackendError) {
        self.failures.lock().unwrap().insert(op, err);
    }

    pub fn recover(&self, op: Op) {
        self.failures.lock().unwrap().remove(&op);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn reports(&self) -> Vec<MeterUsesReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn syncs(&self) -> Vec<SyncRequest> {
        self.syncs.lock().unwrap().clone()
    }

    pub fn activations(&self) -> Vec<ActivationRequest> {
        self.activations.lock().unwrap().clone()
    }

    pub fn set_release(&self, info: ReleaseInfo) {
        *self.release.lock().unwrap() = info;
    }

    /// Parks calls of `op`, after they are counted, until the returned gate
    /// is notified. Each `notify_one` lets one call through.
    pub fn hold(&self, op: Op) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.holds.lock().unwrap().insert(op, Arc::clone(&gate));
        gate
    }

    async fn pass_gate(&self, op: Op) {
        let gate = self.holds.lock().unwrap().get(&op).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn enter(&self, op: Op) -> BackendResult<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        match self.failures.lock().unwrap().get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Signs an activation token for `request` under the current plan.
    pub fn activation_token(&self, request: &ActivationRequest) -> String {
        let plan = self.plan.lock().unwrap().clone();
        let meter_attributes = plan
            .meter_attributes
            .iter()
            .cloned()
            .map(|mut attr| {
                let declared = request
                    .meter_attribute_uses
                    .get(&attr.name)
                    .copied()
                    .unwrap_or(0);
                attr.total_uses += declared;
                attr.uses += declared;
                attr
            })
            .collect();
        self.sign_activation(
            &plan,
            request.product_id,
            &request.license_key,
            &request.fingerprint,
            request.metadata.clone(),
            meter_attributes,
        )
    }

    fn sign_activation(
        &self,
        plan: &TokenPlan,
        product_id: ProductId,
        license_key: &str,
        fingerprint: &str,
        activation_metadata: BTreeMap<String, String>,
        meter_attributes: Vec<MeterAttribute>,
    ) -> String {
        let now = self.clock.now();
        let token = ActivationToken {
            activation_id: plan.activation_id.clone(),
            product_id: plan.product_override.unwrap_or(product_id),
            license_key: license_key.to_string(),
            license_type: plan.license_type,
            fingerprint: plan
                .fingerprint_override
                .clone()
                .unwrap_or_else(|| fingerprint.to_string()),
            issued_at: now,
            expires_at: plan.expires_in_secs.map(|secs| now.plus_secs(secs)),
            server_sync_interval_secs: plan.sync_interval_secs,
            grace_period_secs: plan.grace_period_secs,
            user: plan.user.clone(),
            license_metadata: plan.license_metadata.clone(),
            activation_metadata,
            meter_attributes,
        };
        seal_envelope(&test_keypair(), &token).unwrap()
    }

    /// Signs a trial token for `request` under the current plan.
    pub fn trial_token(&self, request: &TrialActivationRequest) -> String {
        let plan = self.plan.lock().unwrap().clone();
        let now = self.clock.now();
        let token = TrialToken {
            trial_id: "trial-0001".to_string(),
            product_id: plan.product_override.unwrap_or(request.product_id),
            fingerprint: plan
                .fingerprint_override
                .clone()
                .unwrap_or_else(|| request.fingerprint.clone()),
            issued_at: now,
            expires_at: now.plus_secs(plan.trial_days * 86_400),
            metadata: request.metadata.clone(),
        };
        seal_envelope(&test_keypair(), &token).unwrap()
    }
}

#[async_trait]
impl LicenseBackend for MockBackend {
    async fn activate(&self, request: &ActivationRequest) -> BackendResult<String> {
        self.enter(Op::Activate)?;
        self.pass_gate(Op::Activate).await;
        self.activations.lock().unwrap().push(request.clone());
        Ok(self.activation_token(request))
    }

    async fn deactivate(&self, _request: &DeactivationRequest) -> BackendResult<()> {
        self.enter(Op::Deactivate)
    }

    async fn sync_activation(&self, request: &SyncRequest) -> BackendResult<String> {
        self.enter(Op::Sync)?;
        self.pass_gate(Op::Sync).await;
        self.syncs.lock().unwrap().push(request.clone());
        let plan = self.plan.lock().unwrap().clone();
        Ok(self.sign_activation(
            &plan,
            request.product_id,
            &request.license_key,
            &request.fingerprint,
            BTreeMap::new(),
            request.meter_attributes.clone(),
        ))
    }

    async fn activate_trial(&self, request: &TrialActivationRequest) -> BackendResult<String> {
        self.enter(Op::Trial)?;
        Ok(self.trial_token(request))
    }

    async fn report_meter_uses(&self, report: &MeterUsesReport) -> BackendResult<()> {
        self.enter(Op::Meter)?;
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn check_release(&self, _query: &ReleaseQuery) -> BackendResult<ReleaseInfo> {
        self.enter(Op::Release)?;
        Ok(self.release.lock().unwrap().clone())
    }
}

/// Waits until `op` has been called at least `n` times.
pub async fn wait_for_calls(backend: &MockBackend, op: Op, n: usize) {
    for _ in 0..500 {
        if backend.calls(op) >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{op:?} was not called {n} times");
}

// ── Engine harness ──────────────────────────────────────────────

/// An engine wired to a manual clock and the mock backend.
pub struct Harness {
    pub engine: LicenseEngine,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MockBackend>,
}

/// Builds an engine without configuring a product.
pub fn build_engine(
    config: EngineConfig,
    clock: &Arc<ManualClock>,
    backend: &Arc<MockBackend>,
) -> LicenseEngine {
    LicenseEngine::builder()
        .config(config)
        .clock(clock.clone())
        .backend(backend.clone())
        .fingerprint(DeviceFingerprint::from_raw(FINGERPRINT))
        .public_key(test_keypair().verifying_key())
        .build()
        .unwrap()
}

/// In-memory engine with the product and license key configured.
pub fn harness() -> Harness {
    harness_with(engine_config(), StorageScope::InMemory)
}

pub fn harness_with(config: EngineConfig, scope: StorageScope) -> Harness {
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(START)));
    let backend = Arc::new(MockBackend::new(clock.clone()));
    let engine = build_engine(config, &clock, &backend);
    engine.set_product_id(PRODUCT_ID, scope).unwrap();
    engine.set_license_key(LICENSE_KEY).unwrap();
    Harness {
        engine,
        clock,
        backend,
    }
}

/// Engine persisting to `dir`, sharing `clock` and `backend`.
pub fn file_engine(
    dir: &Path,
    clock: &Arc<ManualClock>,
    backend: &Arc<MockBackend>,
) -> LicenseEngine {
    let config = EngineConfig {
        storage_dir: Some(dir.to_path_buf()),
        ..engine_config()
    };
    let engine = build_engine(config, clock, backend);
    engine.set_product_id(PRODUCT_ID, StorageScope::User).unwrap();
    engine.set_license_key(LICENSE_KEY).unwrap();
    engine
}

// ── Offline exchange ────────────────────────────────────────────

/// Plays the backend's side of an offline exchange: reads the request file
/// and writes a signed response file.
pub fn answer_offline_request(
    backend: &MockBackend,
    clock: &ManualClock,
    request_path: &Path,
    response_path: &Path,
) {
    let request = offline::decode_request(&std::fs::read(request_path).unwrap()).unwrap();
    let body = match &request.body {
        RequestBody::Activation(r) => ResponseBody::Activation {
            token: backend.activation_token(r),
        },
        RequestBody::Deactivation(r) => ResponseBody::Deactivation {
            activation_id: r.activation_id.clone(),
        },
        RequestBody::TrialActivation(r) => ResponseBody::TrialActivation {
            token: backend.trial_token(r),
        },
    };
    let response = OfflineResponse {
        product_id: request.body.product_id(),
        nonce: request.nonce,
        issued_at: clock.now(),
        body,
    };
    write_response(&response, &test_keypair(), response_path);
}

pub fn write_response(response: &OfflineResponse, key: &SigningKey, path: &Path) {
    std::fs::write(path, offline::encode_response(response, key).unwrap()).unwrap();
}
