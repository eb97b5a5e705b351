//! Meter attribute ledger.
//!
//! Tracks allowed vs. consumed uses per named attribute for the current
//! activation. Consumed uses stay within `[0, allowed_uses]`: increments past
//! the ceiling are refused, decrements below zero saturate.

use crate::error::{LicenseError, LicenseResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One bounded usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterAttribute {
    pub name: String,
    /// Ceiling across all activations of the license.
    pub allowed_uses: u64,
    /// Uses consumed across all activations of the license.
    pub total_uses: u64,
    /// Uses consumed by this activation.
    #[serde(default)]
    pub uses: u64,
}

impl MeterAttribute {
    pub fn new(name: impl Into<String>, allowed_uses: u64) -> Self {
        Self {
            name: name.into(),
            allowed_uses,
            total_uses: 0,
            uses: 0,
        }
    }

    /// Uses still available before the ceiling.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.allowed_uses.saturating_sub(self.total_uses)
    }

    fn clamp(mut self) -> Self {
        self.total_uses = self.total_uses.min(self.allowed_uses);
        self.uses = self.uses.min(self.total_uses);
        self
    }
}

/// Per-activation meter ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterLedger {
    attributes: BTreeMap<String, MeterAttribute>,
}

impl MeterLedger {
    /// Builds a ledger from a token snapshot, clamping out-of-range counters.
    pub fn from_snapshot<I>(snapshot: I) -> Self
    where
        I: IntoIterator<Item = MeterAttribute>,
    {
        let attributes = snapshot
            .into_iter()
            .map(|attr| (attr.name.clone(), attr.clamp()))
            .collect();
        Self { attributes }
    }

    pub fn get(&self, name: &str) -> LicenseResult<&MeterAttribute> {
        self.attributes
            .get(name)
            .ok_or_else(|| LicenseError::MeterAttributeNotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> LicenseResult<&mut MeterAttribute> {
        self.attributes
            .get_mut(name)
            .ok_or_else(|| LicenseError::MeterAttributeNotFound(name.to_string()))
    }

    /// Adds `n` uses. Refuses without mutating if the ceiling would be passed.
    pub fn increment(&mut self, name: &str, n: u64) -> LicenseResult<MeterAttribute> {
        let attr = self.get_mut(name)?;
        if n > attr.remaining() {
            return Err(LicenseError::MeterAttributeUsesLimitReached(name.to_string()));
        }
        attr.total_uses += n;
        attr.uses = attr.uses.saturating_add(n);
        Ok(attr.clone())
    }

    /// Removes `n` uses, saturating at zero.
    pub fn decrement(&mut self, name: &str, n: u64) -> LicenseResult<MeterAttribute> {
        let attr = self.get_mut(name)?;
        attr.total_uses = attr.total_uses.saturating_sub(n);
        attr.uses = attr.uses.saturating_sub(n);
        Ok(attr.clone())
    }

    /// Gives back every use this activation consumed.
    pub fn reset(&mut self, name: &str) -> LicenseResult<MeterAttribute> {
        let attr = self.get_mut(name)?;
        attr.total_uses = attr.total_uses.saturating_sub(attr.uses);
        attr.uses = 0;
        Ok(attr.clone())
    }

    pub fn snapshot(&self) -> Vec<MeterAttribute> {
        self.attributes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
