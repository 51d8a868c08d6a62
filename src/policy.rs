//! Tier and capability policy.
//!
//! Derives the effective limits from whether privileged venue credentials
//! are configured, and fans a profile change out to the rate limiters,
//! the symbol working set and the upstream sessions. Credential updates
//! are validated against the catalog before they commit; a failed
//! validation rolls back atomically.

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::limits::RateLimiterRegistry;
use crate::models::Market;
use crate::symbols::SymbolManager;
use crate::upstream::{CatalogClient, IngestSupervisor};

/// Sentinel key marking the unauthenticated public tier.
pub const PUBLIC_SENTINEL: &str = "PUBLIC_ACCESS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Public,
    Privileged,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Public => write!(f, "public"),
            Tier::Privileged => write!(f, "privileged"),
        }
    }
}

/// Venue credential triple.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn public() -> Self {
        Self {
            api_key: PUBLIC_SENTINEL.to_string(),
            secret_key: String::new(),
            passphrase: String::new(),
        }
    }

    /// Environment-provided credentials; a missing or sentinel key forces
    /// the public tier.
    pub fn from_parts(api_key: String, secret_key: String, passphrase: String) -> Self {
        let creds = Self {
            api_key,
            secret_key,
            passphrase,
        };
        if creds.is_privileged() {
            creds
        } else {
            Self::public()
        }
    }

    pub fn is_privileged(&self) -> bool {
        !self.api_key.is_empty()
            && !self.secret_key.is_empty()
            && !self.passphrase.is_empty()
            && self.api_key != PUBLIC_SENTINEL
            && self.api_key.len() >= 10
    }
}

/// Effective limits for the current tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityProfile {
    pub tier: Tier,
    pub max_rps: f64,
    pub max_symbols_per_group: usize,
    pub resolutions: Vec<u32>,
    pub max_historical_days: u32,
    pub markets: Vec<Market>,
    pub book_channel: bool,
}

impl CapabilityProfile {
    pub fn public() -> Self {
        Self {
            tier: Tier::Public,
            max_rps: 8.0,
            max_symbols_per_group: 10,
            resolutions: vec![60, 300, 900, 3600],
            max_historical_days: 30,
            markets: vec![Market::Spot, Market::Usdtm],
            book_channel: false,
        }
    }

    pub fn privileged() -> Self {
        Self {
            tier: Tier::Privileged,
            max_rps: 120.0,
            max_symbols_per_group: 100,
            resolutions: vec![1, 5, 15, 60, 300, 900, 3600],
            max_historical_days: 365,
            markets: Market::ALL.to_vec(),
            book_channel: true,
        }
    }

    pub fn for_credentials(credentials: &Credentials) -> Self {
        if credentials.is_privileged() {
            Self::privileged()
        } else {
            Self::public()
        }
    }
}

/// Credential validation against the catalog failed; nothing was changed.
#[derive(Debug)]
pub struct CredentialRejected(pub String);

impl std::fmt::Display for CredentialRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid API credentials: {}", self.0)
    }
}

impl std::error::Error for CredentialRejected {}

pub struct CapabilityPolicy {
    credentials: Mutex<Credentials>,
    /// Serializes credential updates end to end: the catalog credential
    /// swap, the validation probe and the commit/rollback must not
    /// interleave between concurrent updates.
    update_lock: tokio::sync::Mutex<()>,
    profile: Arc<ArcSwap<CapabilityProfile>>,
    catalog: Arc<CatalogClient>,
    limiters: Arc<RateLimiterRegistry>,
    symbols: Arc<SymbolManager>,
    supervisor: Arc<IngestSupervisor>,
}

impl CapabilityPolicy {
    pub fn new(
        initial: Credentials,
        profile: Arc<ArcSwap<CapabilityProfile>>,
        catalog: Arc<CatalogClient>,
        limiters: Arc<RateLimiterRegistry>,
        symbols: Arc<SymbolManager>,
        supervisor: Arc<IngestSupervisor>,
    ) -> Self {
        Self {
            credentials: Mutex::new(initial),
            update_lock: tokio::sync::Mutex::new(()),
            profile,
            catalog,
            limiters,
            symbols,
            supervisor,
        }
    }

    pub fn profile(&self) -> Arc<CapabilityProfile> {
        self.profile.load_full()
    }

    pub fn is_configured(&self) -> bool {
        let creds = self.credentials.lock();
        creds.api_key != PUBLIC_SENTINEL && !creds.api_key.is_empty()
    }

    /// Validates and commits a new credential triple. On validation
    /// failure the previous credentials are restored and the profile and
    /// session topology are untouched.
    pub async fn apply_credentials(
        &self,
        credentials: Credentials,
    ) -> Result<Arc<CapabilityProfile>> {
        let _update = self.update_lock.lock().await;

        info!("Validating venue API credentials");
        let previous = self.credentials.lock().clone();

        self.catalog.set_credentials(credentials.clone());
        if let Err(e) = self.catalog.probe().await {
            self.catalog.set_credentials(previous);
            warn!("❌ Credential validation failed: {}", e);
            return Err(CredentialRejected(e.to_string()).into());
        }

        *self.credentials.lock() = credentials.clone();
        let profile = Arc::new(CapabilityProfile::for_credentials(&credentials));
        self.reconfigure(profile.clone()).await?;

        info!(
            "✅ Credentials committed - {} tier active ({} markets, {} rps)",
            profile.tier,
            profile.markets.len(),
            profile.max_rps
        );
        Ok(profile)
    }

    /// Reverts to the public tier.
    pub async fn reset(&self) -> Result<Arc<CapabilityProfile>> {
        let _update = self.update_lock.lock().await;

        info!("Resetting venue API configuration to public tier");
        let credentials = Credentials::public();
        self.catalog.set_credentials(credentials.clone());
        *self.credentials.lock() = credentials;

        let profile = Arc::new(CapabilityProfile::public());
        self.reconfigure(profile.clone()).await?;
        Ok(profile)
    }

    /// Two catalog calls proving the current credentials work end to end.
    pub async fn test_connection(&self) -> Result<(usize, usize)> {
        let symbols = self.catalog.probe().await?;
        let tickers = self.catalog.tickers_probe().await?;
        Ok((symbols, tickers))
    }

    async fn reconfigure(&self, profile: Arc<CapabilityProfile>) -> Result<()> {
        self.profile.store(profile.clone());
        self.limiters.update_base_rate_all(profile.max_rps);
        self.symbols.reconcile(&profile.markets).await?;
        self.supervisor.rebuild().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_detection() {
        assert!(!Credentials::public().is_privileged());
        assert!(!Credentials::default().is_privileged());

        let short_key = Credentials {
            api_key: "short".to_string(),
            secret_key: "0123456789abcdef".to_string(),
            passphrase: "pass".to_string(),
        };
        assert!(!short_key.is_privileged());

        let missing_passphrase = Credentials {
            api_key: "bg_0123456789".to_string(),
            secret_key: "0123456789abcdef".to_string(),
            passphrase: String::new(),
        };
        assert!(!missing_passphrase.is_privileged());

        let valid = Credentials {
            api_key: "bg_0123456789".to_string(),
            secret_key: "0123456789abcdef".to_string(),
            passphrase: "pass".to_string(),
        };
        assert!(valid.is_privileged());
    }

    #[test]
    fn test_sentinel_key_forces_public() {
        let creds = Credentials {
            api_key: PUBLIC_SENTINEL.to_string(),
            secret_key: "0123456789abcdef".to_string(),
            passphrase: "pass".to_string(),
        };
        assert!(!creds.is_privileged());
        assert_eq!(
            CapabilityProfile::for_credentials(&creds).tier,
            Tier::Public
        );
    }

    #[test]
    fn test_from_parts_normalizes_invalid_to_public() {
        let creds = Credentials::from_parts("x".to_string(), String::new(), String::new());
        assert_eq!(creds.api_key, PUBLIC_SENTINEL);
    }

    #[test]
    fn test_profile_limits() {
        let public = CapabilityProfile::public();
        assert_eq!(public.max_rps, 8.0);
        assert_eq!(public.max_symbols_per_group, 10);
        assert_eq!(public.markets, vec![Market::Spot, Market::Usdtm]);
        assert!(!public.book_channel);

        let privileged = CapabilityProfile::privileged();
        assert_eq!(privileged.max_rps, 120.0);
        assert_eq!(privileged.max_symbols_per_group, 100);
        assert_eq!(privileged.markets.len(), 4);
        assert!(privileged.book_channel);
        assert!(privileged.resolutions.contains(&1));
    }

    #[test]
    fn test_profile_roundtrip_is_identical() {
        let a = CapabilityProfile::public();
        let b = CapabilityProfile::privileged();
        let a_again = CapabilityProfile::public();
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }
}
