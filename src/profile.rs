//! Device profile collaborator
//!
//! Child and toy persona context lives in an external profile service; the
//! core only reads it through this narrow seam when assembling prompts.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Child/toy persona context for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Device serial number
    pub device_sn: String,

    /// Child's preferred name, if known
    #[serde(default)]
    pub child_name: Option<String>,

    /// Child's age in years, if known
    #[serde(default)]
    pub child_age: Option<u8>,

    /// Child's interests, used to steer conversation
    #[serde(default)]
    pub interests: Vec<String>,

    /// Topics the parent has ruled out
    #[serde(default)]
    pub forbidden_topics: Vec<String>,

    /// The toy's name as the child knows it
    pub toy_name: String,

    /// Short persona description for the system prompt
    pub toy_persona: String,
}

impl DeviceProfile {
    /// A generic fallback profile for unknown devices
    #[must_use]
    pub fn fallback(device_sn: &str) -> Self {
        Self {
            device_sn: device_sn.to_string(),
            child_name: None,
            child_age: None,
            interests: Vec::new(),
            forbidden_topics: Vec::new(),
            toy_name: "Buddy".to_string(),
            toy_persona: "a gentle, curious companion who listens carefully, \
                          speaks softly, and loves to encourage"
                .to_string(),
        }
    }
}

/// Read-only source of device profiles
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    /// Fetch the profile for a device
    ///
    /// # Errors
    ///
    /// Returns error if the profile backend fails; callers may fall back to
    /// [`DeviceProfile::fallback`].
    async fn profile(&self, device_sn: &str) -> Result<DeviceProfile>;
}

/// In-memory profile source
///
/// Serves preloaded profiles and a fallback for everything else. Stands in
/// for the external profile service in self-contained deployments and tests.
#[derive(Debug, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, DeviceProfile>,
}

impl StaticProfiles {
    /// Create an empty source that serves only fallback profiles
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a profile, replacing any existing one for the device
    pub fn insert(&mut self, profile: DeviceProfile) {
        self.profiles.insert(profile.device_sn.clone(), profile);
    }
}

#[async_trait]
impl ProfileProvider for StaticProfiles {
    async fn profile(&self, device_sn: &str) -> Result<DeviceProfile> {
        Ok(self
            .profiles
            .get(device_sn)
            .cloned()
            .unwrap_or_else(|| DeviceProfile::fallback(device_sn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_device_gets_fallback() {
        let profiles = StaticProfiles::new();
        let profile = profiles.profile("toy-001").await.unwrap();
        assert_eq!(profile.device_sn, "toy-001");
        assert_eq!(profile.toy_name, "Buddy");
    }

    #[tokio::test]
    async fn preloaded_profile_is_served() {
        let mut profiles = StaticProfiles::new();
        profiles.insert(DeviceProfile {
            toy_name: "Yoyo".to_string(),
            ..DeviceProfile::fallback("toy-002")
        });

        let profile = profiles.profile("toy-002").await.unwrap();
        assert_eq!(profile.toy_name, "Yoyo");
    }
}
