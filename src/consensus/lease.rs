//! The lease record stored in a register, and the lease timing parameters.

use std::fmt;
use std::time::{Duration, SystemTime};

use crate::utils::SynleaseError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Time-bounded exclusive ownership record; the single value a register
/// holds. A new `Lease` is built for every issuance or renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of the provider node that owns the lease.
    pub owner_identity: Bytes,

    /// Absolute expiry instant, relative to the issuer's clock.
    pub expires_at: SystemTime,

    /// Opaque payload attached by the owner.
    pub owner_payload: Bytes,
}

impl Lease {
    pub fn new(
        owner_identity: Bytes,
        expires_at: SystemTime,
        owner_payload: Bytes,
    ) -> Self {
        Lease {
            owner_identity,
            expires_at,
            owner_payload,
        }
    }

    /// Nominally expired as of `now`.
    #[inline]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at < now
    }

    /// Nominally expired as of `now`, but some participant's clock may still
    /// consider it valid given the `drift` bound.
    #[inline]
    pub fn is_within_drift(&self, now: SystemTime, drift: Duration) -> bool {
        self.expires_at < now && self.expires_at + drift > now
    }

    #[inline]
    pub fn is_owned_by(&self, identity: &[u8]) -> bool {
        self.owner_identity.as_ref() == identity
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Lease{{owner ")?;
        for b in self.owner_identity.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        write!(
            f,
            " exp {:?} payload {}B}}",
            self.expires_at,
            self.owner_payload.len()
        )
    }
}

/// Typed lease timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfiguration {
    /// Validity span of every issued lease.
    pub max_lease_time_span: Duration,

    /// Upper bound on clock disagreement between any two participants.
    pub clock_drift: Duration,
}

impl LeaseConfiguration {
    pub fn new(
        max_lease_time_span: Duration,
        clock_drift: Duration,
    ) -> Result<Self, SynleaseError> {
        if max_lease_time_span.is_zero() {
            return Err(SynleaseError::config("max lease time span is zero"));
        }
        if clock_drift.is_zero() {
            return Err(SynleaseError::config("clock drift is zero"));
        }
        if clock_drift >= max_lease_time_span {
            return Err(SynleaseError::config(format!(
                "clock drift {:?} not smaller than lease span {:?}",
                clock_drift, max_lease_time_span
            )));
        }
        Ok(LeaseConfiguration {
            max_lease_time_span,
            clock_drift,
        })
    }
}

/// Configuration parameters struct of a lease provider, parsable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    /// Validity span of issued leases in millisecs.
    pub max_lease_ms: u64,

    /// Assumed clock drift bound across nodes in millisecs.
    pub clock_drift_ms: u64,

    /// Deadline of a single register round in millisecs.
    pub round_timeout_ms: u64,

    /// Maximum number of drift waits one acquisition may go through before
    /// giving up.
    pub max_drift_retries: u32,

    /// Refuse to issue leases until one lease span has passed since the
    /// provider was created.
    pub startup_guard: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            max_lease_ms: 5000,
            clock_drift_ms: 200,
            round_timeout_ms: 1000,
            max_drift_retries: 3,
            startup_guard: true,
        }
    }
}

impl ProviderConfig {
    /// Parses from an optional TOML string, filling absent fields with
    /// defaults.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, SynleaseError> {
        let config = parsed_config!(config_str => ProviderConfig;
                                    max_lease_ms, clock_drift_ms,
                                    round_timeout_ms, max_drift_retries,
                                    startup_guard)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SynleaseError> {
        self.lease_config()?;
        if self.round_timeout_ms == 0 {
            return Err(SynleaseError::config("round timeout is zero"));
        }
        if self.max_drift_retries == 0 {
            return Err(SynleaseError::config("max drift retries is zero"));
        }
        Ok(())
    }

    pub fn lease_config(&self) -> Result<LeaseConfiguration, SynleaseError> {
        LeaseConfiguration::new(
            Duration::from_millis(self.max_lease_ms),
            Duration::from_millis(self.clock_drift_ms),
        )
    }

    #[inline]
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }
}

#[cfg(test)]
mod lease_tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn lease_expiring_at(secs: u64) -> Lease {
        Lease::new(
            Bytes::from_static(b"owner"),
            UNIX_EPOCH + Duration::from_secs(secs),
            Bytes::new(),
        )
    }

    #[test]
    fn expiry_and_drift_window() {
        let lease = lease_expiring_at(100);
        let drift = Duration::from_millis(200);
        let at = |ms: u64| UNIX_EPOCH + Duration::from_millis(ms);
        // still valid at exact expiry instant
        assert!(!lease.is_expired_at(at(100_000)));
        assert!(!lease.is_within_drift(at(100_000), drift));
        assert!(lease.is_expired_at(at(100_001)));
        assert!(lease.is_within_drift(at(100_001), drift));
        assert!(lease.is_within_drift(at(100_199), drift));
        assert!(!lease.is_within_drift(at(100_200), drift));
        assert!(!lease.is_within_drift(at(100_500), drift));
    }

    #[test]
    fn ownership() {
        let lease = lease_expiring_at(1);
        assert!(lease.is_owned_by(b"owner"));
        assert!(!lease.is_owned_by(b"other"));
    }

    #[test]
    fn lease_config_invalid() {
        let ms = Duration::from_millis;
        assert!(LeaseConfiguration::new(ms(0), ms(10)).is_err());
        assert!(LeaseConfiguration::new(ms(100), ms(0)).is_err());
        assert!(LeaseConfiguration::new(ms(100), ms(100)).is_err());
        assert!(LeaseConfiguration::new(ms(5000), ms(200)).is_ok());
    }

    #[test]
    fn provider_config_parse() -> Result<(), SynleaseError> {
        let config = ProviderConfig::from_toml(None)?;
        assert_eq!(config, ProviderConfig::default());
        let config = ProviderConfig::from_toml(Some(
            "max_lease_ms = 800\nstartup_guard = false",
        ))?;
        assert_eq!(config.max_lease_ms, 800);
        assert!(!config.startup_guard);
        assert_eq!(
            config.lease_config()?,
            LeaseConfiguration {
                max_lease_time_span: Duration::from_millis(800),
                clock_drift: Duration::from_millis(200),
            }
        );
        assert!(matches!(
            ProviderConfig::from_toml(Some("clock_drift_ms = 9000")),
            Err(SynleaseError::Config(_))
        ));
        assert!(ProviderConfig::from_toml(Some("round_timeout_ms = 0")).is_err());
        assert!(ProviderConfig::from_toml(Some("unknown = 1")).is_err());
        Ok(())
    }
}
