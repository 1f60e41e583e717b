use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for lock acquisition inside [`crate::Reconciler`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Bounded wait for each lock acquisition before failing with a conflict.
    #[serde(rename = "lock_timeout_ms", with = "duration_ms")]
    pub lock_timeout: Duration,
    /// How often the cluster lock set may be widened because the cluster grew
    /// between reading it and locking it.
    pub max_lock_rounds: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
            max_lock_rounds: 4,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    #[must_use]
    pub fn with_max_lock_rounds(mut self, max_lock_rounds: u32) -> Self {
        self.max_lock_rounds = max_lock_rounds;
        self
    }

    pub(crate) fn lock_rounds(&self) -> u32 {
        self.max_lock_rounds.max(1)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
