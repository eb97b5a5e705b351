//! Local trials.
//!
//! A local trial is an unsigned trial window tracked only on this machine.
//! It is protected against clock rollback by a watermark that every
//! successful check advances. Once declared expired it stays expired, and
//! resetting the engine leaves it in place.

use crate::engine::LicenseEngine;
use crate::error::{LicenseError, LicenseResult};
use keyward_types::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Persisted local trial window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrialState {
    pub started_at: Timestamp,
    pub length_days: u32,
    /// Latest wall-clock time a check succeeded at.
    pub watermark: Timestamp,
    /// Sticky once set.
    pub expired: bool,
}

impl LocalTrialState {
    pub fn start(now: Timestamp, length_days: u32) -> Self {
        Self {
            started_at: now,
            length_days,
            watermark: now,
            expired: false,
        }
    }

    pub fn expires_at(&self) -> Timestamp {
        self.started_at.plus_days(self.length_days)
    }

    /// Checks the window, declaring expiry and advancing the watermark.
    pub fn check(&mut self, now: Timestamp, tolerance_secs: i64) -> LicenseResult<()> {
        self.guard(now, tolerance_secs)?;
        self.watermark = self.watermark.max(now);
        Ok(())
    }

    /// Lengthens the window. Refused once the trial is expired.
    pub fn extend(&mut self, days: u32, now: Timestamp, tolerance_secs: i64) -> LicenseResult<()> {
        self.guard(now, tolerance_secs)?;
        self.length_days = self.length_days.saturating_add(days);
        Ok(())
    }

    fn guard(&mut self, now: Timestamp, tolerance_secs: i64) -> LicenseResult<()> {
        if self.expired {
            return Err(LicenseError::LocalTrialExpired);
        }
        if now.plus_secs(tolerance_secs) < self.watermark {
            return Err(LicenseError::TimeModified);
        }
        if now > self.expires_at() {
            self.expired = true;
            return Err(LicenseError::LocalTrialExpired);
        }
        Ok(())
    }
}

impl LicenseEngine {
    /// Starts a local trial of `length_days`.
    ///
    /// If a local trial already exists it is checked instead of restarted.
    pub fn activate_local_trial(&self, length_days: u32) -> LicenseResult<()> {
        self.update_local_trial(|trial, now, tolerance| match trial {
            Some(existing) => existing.check(now, tolerance),
            None => {
                *trial = Some(LocalTrialState::start(now, length_days));
                info!("local trial started for {length_days} days");
                Ok(())
            }
        })
    }

    pub fn is_local_trial_genuine(&self) -> LicenseResult<()> {
        self.update_local_trial(|trial, now, tolerance| {
            trial
                .as_mut()
                .ok_or(LicenseError::TrialNotActivated)?
                .check(now, tolerance)
        })
    }

    /// Adds `days` to the local trial without touching its watermark.
    pub fn extend_local_trial(&self, days: u32) -> LicenseResult<()> {
        self.update_local_trial(|trial, now, tolerance| {
            trial
                .as_mut()
                .ok_or(LicenseError::TrialNotActivated)?
                .extend(days, now, tolerance)
        })
    }

    pub fn get_local_trial_expiry_date(&self) -> LicenseResult<Timestamp> {
        let state = self.inner.read_state();
        state.config.product()?;
        state
            .license
            .local_trial
            .as_ref()
            .map(LocalTrialState::expires_at)
            .ok_or(LicenseError::TrialNotActivated)
    }

    /// Applies `op` to the local trial and persists any change it made.
    fn update_local_trial(
        &self,
        op: impl FnOnce(&mut Option<LocalTrialState>, Timestamp, i64) -> LicenseResult<()>,
    ) -> LicenseResult<()> {
        let now = self.inner.now();
        let tolerance = self.inner.settings.local_trial_clock_tolerance_secs;
        let mut guard = self.inner.write_state();
        let state = &mut *guard;
        state.config.product()?;

        let before = state.license.local_trial.clone();
        let result = op(&mut state.license.local_trial, now, tolerance);
        if state.license.local_trial != before {
            state.save_local_trial()?;
        }
        if let Err(LicenseError::TimeModified) = &result {
            warn!("clock is behind the local trial watermark");
        }
        result
    }
}
