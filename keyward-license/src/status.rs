//! Status codes delivered to license and release callbacks.

use crate::error::LicenseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a background sync or release check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Expired,
    Suspended,
    Revoked,
    GracePeriodOver,
    ActivationNotFound,
    MachineFingerprintChanged,
    AuthenticationFailed,
    CountryRestricted,
    IpRestricted,
    NetworkError,
    ServerError,
    RateLimited,
    TimeModified,
    TrialExpired,
    LocalTrialExpired,
    UpdateAvailable,
    NoUpdateAvailable,
    /// Any other failure; the log carries the detail.
    Failed,
}

impl StatusCode {
    /// True when the status means the activation can no longer be trusted
    /// and must be persisted as such.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Expired
                | Self::Suspended
                | Self::Revoked
                | Self::ActivationNotFound
                | Self::MachineFingerprintChanged
        )
    }

    /// True for refusals tied to the caller's credentials or network origin.
    /// They hold until a later sync succeeds.
    #[must_use]
    pub fn is_restriction(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed | Self::CountryRestricted | Self::IpRestricted
        )
    }

    /// Converts a persisted status back into the error `is_license_valid` reports.
    pub(crate) fn into_error(self) -> Option<LicenseError> {
        match self {
            Self::Expired => Some(LicenseError::Expired("server".to_string())),
            Self::Suspended => Some(LicenseError::Suspended),
            Self::Revoked => Some(LicenseError::Revoked),
            Self::ActivationNotFound => Some(LicenseError::ActivationNotFound),
            Self::MachineFingerprintChanged => Some(LicenseError::MachineFingerprint),
            Self::AuthenticationFailed => Some(LicenseError::AuthenticationFailed),
            Self::CountryRestricted => Some(LicenseError::CountryRestricted),
            Self::IpRestricted => Some(LicenseError::IpRestricted),
            _ => None,
        }
    }
}

impl From<&LicenseError> for StatusCode {
    fn from(err: &LicenseError) -> Self {
        match err {
            LicenseError::Expired(_) => Self::Expired,
            LicenseError::Suspended => Self::Suspended,
            LicenseError::Revoked => Self::Revoked,
            LicenseError::GracePeriodOver => Self::GracePeriodOver,
            LicenseError::ActivationNotFound => Self::ActivationNotFound,
            LicenseError::MachineFingerprint => Self::MachineFingerprintChanged,
            LicenseError::AuthenticationFailed => Self::AuthenticationFailed,
            LicenseError::CountryRestricted => Self::CountryRestricted,
            LicenseError::IpRestricted => Self::IpRestricted,
            LicenseError::Network(_) => Self::NetworkError,
            LicenseError::Server(_) => Self::ServerError,
            LicenseError::RateLimited => Self::RateLimited,
            LicenseError::TimeModified => Self::TimeModified,
            LicenseError::TrialExpired => Self::TrialExpired,
            LicenseError::LocalTrialExpired => Self::LocalTrialExpired,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
            Self::Revoked => "revoked",
            Self::GracePeriodOver => "grace_period_over",
            Self::ActivationNotFound => "activation_not_found",
            Self::MachineFingerprintChanged => "machine_fingerprint_changed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::CountryRestricted => "country_restricted",
            Self::IpRestricted => "ip_restricted",
            Self::NetworkError => "network_error",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::TimeModified => "time_modified",
            Self::TrialExpired => "trial_expired",
            Self::LocalTrialExpired => "local_trial_expired",
            Self::UpdateAvailable => "update_available",
            Self::NoUpdateAvailable => "no_update_available",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
