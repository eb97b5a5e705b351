//! Release update checks.

use crate::backend::{ReleaseInfo, ReleaseQuery};
use crate::engine::LicenseEngine;
use crate::error::{LicenseError, LicenseResult};
use crate::status::StatusCode;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Validates a dotted numeric version such as `1.4.0`.
pub fn validate_release_version(version: &str) -> LicenseResult<()> {
    let parts: Vec<&str> = version.split('.').collect();
    let well_formed = (1..=4).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 9 && p.bytes().all(|b| b.is_ascii_digit()));
    if well_formed {
        Ok(())
    } else {
        Err(LicenseError::ReleaseVersionFormat(version.to_string()))
    }
}

impl LicenseEngine {
    /// Asks the backend whether a release newer than `version` exists.
    pub async fn fetch_release_update(
        &self,
        platform: &str,
        version: &str,
        channel: &str,
    ) -> LicenseResult<ReleaseInfo> {
        let query = self.release_query(platform, version, channel)?;
        Ok(self.inner.backend.check_release(&query).await?)
    }

    /// Checks for a newer release in the background and calls `callback`
    /// once with [`StatusCode::UpdateAvailable`], [`StatusCode::NoUpdateAvailable`]
    /// or the failure status.
    pub fn check_for_release_update<F>(
        &self,
        platform: &str,
        version: &str,
        channel: &str,
        callback: F,
    ) -> LicenseResult<()>
    where
        F: FnOnce(StatusCode) + Send + 'static,
    {
        let query = self.release_query(platform, version, channel)?;
        let handle = Handle::try_current().map_err(|e| LicenseError::Runtime(e.to_string()))?;
        let backend = std::sync::Arc::clone(&self.inner.backend);

        handle.spawn(async move {
            let status = match backend.check_release(&query).await {
                Ok(info) if info.update_available => StatusCode::UpdateAvailable,
                Ok(_) => StatusCode::NoUpdateAvailable,
                Err(e) => {
                    warn!("release check failed: {e}");
                    StatusCode::from(&LicenseError::from(e))
                }
            };
            debug!("release check for {} finished: {status}", query.version);
            callback(status);
        });
        Ok(())
    }

    fn release_query(&self, platform: &str, version: &str, channel: &str) -> LicenseResult<ReleaseQuery> {
        validate_release_version(version)?;
        let state = self.inner.read_state();
        Ok(ReleaseQuery {
            product_id: state.config.product()?.product_id,
            platform: platform.to_string(),
            version: version.to_string(),
            channel: channel.to_string(),
            license_key: state.config.identity().license_key.clone(),
        })
    }
}
