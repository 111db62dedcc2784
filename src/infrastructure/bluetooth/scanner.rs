//! Address Resolver
//!
//! Finds the bed's BLE address, either the configured one when an adapter
//! currently sees it, or by matching the advertised name.

use crate::domain::models::MacAddress;
use crate::domain::settings::{lock_settings, SharedSettings};
use crate::infrastructure::bluetooth::transport::BleBackend;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct AddressResolver {
    backend: Arc<dyn BleBackend>,
    settings: SharedSettings,
}

impl AddressResolver {
    pub fn new(backend: Arc<dyn BleBackend>, settings: SharedSettings) -> Self {
        Self { backend, settings }
    }

    /// Resolve the address to talk to.
    ///
    /// Returns `None` when nothing matches this cycle; callers retry on the
    /// next poll.
    pub async fn resolve(&self) -> Option<MacAddress> {
        let (configured, name) = {
            let settings = lock_settings(&self.settings);
            let s = settings.get();
            (s.device_address, s.device_name.clone())
        };

        if let Some(address) = configured {
            if self.backend.is_present(&address).await {
                return Some(address);
            }
            debug!(%address, "Configured address not currently visible");
        }

        let wanted = name.trim();
        if wanted.is_empty() {
            return None;
        }

        let advertisements = match self.backend.discovered().await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                warn!("Could not list advertising devices: {}", e);
                return None;
            }
        };

        let found = advertisements.into_iter().find(|adv| {
            adv.name
                .as_deref()
                .is_some_and(|n| n.trim().eq_ignore_ascii_case(wanted))
        })?;

        if configured != Some(found.address) {
            info!(address = %found.address, name = wanted, "Discovered bed by name");
            let mut settings = lock_settings(&self.settings);
            if let Err(e) = settings.set_address(Some(found.address)) {
                warn!("Failed to persist discovered address: {}", e);
            }
        }
        Some(found.address)
    }

    /// Forget the stored address so the next resolve searches by name.
    pub fn forget(&self) {
        let mut settings = lock_settings(&self.settings);
        if let Err(e) = settings.set_address(None) {
            warn!("Failed to persist address reset: {}", e);
        }
        info!("Stored address cleared");
    }

    /// Whether the configured address is currently visible.
    pub async fn is_present(&self, address: &MacAddress) -> bool {
        self.backend.is_present(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::SettingsService;
    use crate::infrastructure::bluetooth::fake::{bed_address, FakeBed};
    use crate::infrastructure::bluetooth::transport::Advertisement;
    use std::sync::Mutex;

    fn resolver(bed: &FakeBed, dir: &tempfile::TempDir) -> (AddressResolver, SharedSettings) {
        let settings = Arc::new(Mutex::new(SettingsService::with_path(
            dir.path().join("settings.json"),
        )));
        (
            AddressResolver::new(Arc::new(bed.clone()), settings.clone()),
            settings,
        )
    }

    #[tokio::test]
    async fn test_discovers_and_persists_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let bed = FakeBed::new();
        let (resolver, settings) = resolver(&bed, &dir);

        assert_eq!(resolver.resolve().await, Some(bed_address()));
        assert_eq!(
            lock_settings(&settings).get().device_address,
            Some(bed_address())
        );

        let reloaded = SettingsService::with_path(dir.path().join("settings.json"));
        assert_eq!(reloaded.get().device_address, Some(bed_address()));
        assert_eq!(
            reloaded.get().title.as_deref(),
            Some("Octo Bed (F6:21:DD:DD:6F:19)")
        );
    }

    #[tokio::test]
    async fn test_name_match_is_case_insensitive_and_exact() {
        let dir = tempfile::tempdir().unwrap();
        let bed = FakeBed::new();
        let other = MacAddress::new([1, 2, 3, 4, 5, 6]);
        bed.set_advertised(vec![
            Advertisement {
                name: Some("RC2 Remote".to_string()),
                address: other,
            },
            Advertisement {
                name: None,
                address: MacAddress::new([9, 9, 9, 9, 9, 9]),
            },
            Advertisement {
                name: Some("rc2".to_string()),
                address: bed_address(),
            },
        ]);
        let (resolver, _settings) = resolver(&bed, &dir);
        assert_eq!(resolver.resolve().await, Some(bed_address()));
    }

    #[tokio::test]
    async fn test_not_found_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let bed = FakeBed::new();
        bed.set_visible(false);
        let (resolver, settings) = resolver(&bed, &dir);

        assert_eq!(resolver.resolve().await, None);
        assert_eq!(lock_settings(&settings).get().device_address, None);
    }

    #[tokio::test]
    async fn test_configured_address_kept_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let bed = FakeBed::new();
        let (resolver, settings) = resolver(&bed, &dir);
        {
            let mut s = lock_settings(&settings);
            s.get_mut().device_address = Some(bed_address());
            s.get_mut().device_name = "something else".to_string();
            s.get_mut().title = Some("Main bed".to_string());
        }

        assert_eq!(resolver.resolve().await, Some(bed_address()));
        assert_eq!(
            lock_settings(&settings).get().title.as_deref(),
            Some("Main bed")
        );

        resolver.forget();
        assert_eq!(lock_settings(&settings).get().device_address, None);
        assert_eq!(resolver.resolve().await, None);
    }
}
