//! Job identity generation.
//!
//! # Design
//! - Ids are 16 lowercase hex digits drawn from 64 random bits.
//! - Randomness is behind [`IdSource`] so tests can force collisions.
//! - The generator never trusts a candidate blindly: each one is checked against a
//!   caller-supplied liveness predicate and redrawn on collision.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{WorkspaceError, WorkspaceResult};

/// Number of hex digits in a rendered job id.
pub const JOB_ID_LEN: usize = 16;

/// Candidates tried before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Opaque job identifier, safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Render a raw token as a job id.
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self(format!("{value:016x}"))
    }

    /// Parse and validate an id received from a caller or read from disk.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::InvalidJobId`] unless `value` is exactly
    /// [`JOB_ID_LEN`] lowercase hex digits.
    pub fn parse(value: &str) -> WorkspaceResult<Self> {
        let valid = value.len() == JOB_ID_LEN
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(WorkspaceError::InvalidJobId {
                value: value.to_string(),
            })
        }
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = WorkspaceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for JobId {
    type Error = WorkspaceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Source of raw id tokens.
pub trait IdSource: Send + Sync {
    /// Draw the next token.
    fn next_token(&self) -> u64;
}

/// Production source backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdSource;

impl IdSource for RandomIdSource {
    fn next_token(&self) -> u64 {
        rand::random::<u64>()
    }
}

/// Collision-checked id generator.
#[derive(Clone)]
pub struct IdentityGenerator {
    source: Arc<dyn IdSource>,
    max_attempts: u32,
}

impl IdentityGenerator {
    /// Generator drawing from `source`.
    #[must_use]
    pub fn new(source: Arc<dyn IdSource>) -> Self {
        Self {
            source,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Generator using [`RandomIdSource`].
    #[must_use]
    pub fn random() -> Self {
        Self::new(Arc::new(RandomIdSource))
    }

    /// Override the retry budget (at least one attempt is always made).
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Produce an id for which `is_live` returns `false`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::IdSpaceExhausted`] when every candidate within
    /// the retry budget collided.
    pub fn new_id(&self, is_live: impl Fn(&JobId) -> bool) -> WorkspaceResult<JobId> {
        for attempt in 1..=self.max_attempts {
            let candidate = JobId::from_u64(self.source.next_token());
            if !is_live(&candidate) {
                return Ok(candidate);
            }
            warn!(
                job_id = %candidate,
                attempt,
                "job id collided with a live job; drawing another"
            );
        }
        Err(WorkspaceError::IdSpaceExhausted {
            attempts: self.max_attempts,
        })
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Fixed(Mutex<Vec<u64>>);

    impl IdSource for Fixed {
        fn next_token(&self) -> u64 {
            let mut tokens = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if tokens.is_empty() { 0 } else { tokens.remove(0) }
        }
    }

    #[test]
    fn ids_are_fixed_width_lowercase_hex() {
        assert_eq!(JobId::from_u64(0xab).as_str(), "00000000000000ab");
        assert_eq!(JobId::from_u64(u64::MAX).as_str(), "ffffffffffffffff");
    }

    #[test]
    fn parse_rejects_unsafe_components() {
        assert!(JobId::parse("00000000000000ab").is_ok());
        for bad in ["", "..", "00000000000000AB", "0000000000000ab", "../../etc/passwd0", "000000000000/0ab"] {
            assert!(JobId::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn serde_round_trip_validates() -> Result<(), serde_json::Error> {
        let id = JobId::from_u64(42);
        let json = serde_json::to_string(&id)?;
        assert_eq!(json, "\"000000000000002a\"");
        let back: JobId = serde_json::from_str(&json)?;
        assert_eq!(back, id);
        assert!(serde_json::from_str::<JobId>("\"nope\"").is_err());
        Ok(())
    }

    #[test]
    fn generator_retries_past_live_ids() -> WorkspaceResult<()> {
        let generator = IdentityGenerator::new(Arc::new(Fixed(Mutex::new(vec![1, 1, 2]))));
        let live = JobId::from_u64(1);
        let id = generator.new_id(|candidate| *candidate == live)?;
        assert_eq!(id, JobId::from_u64(2));
        Ok(())
    }

    #[test]
    fn generator_gives_up_after_budget() {
        let generator = IdentityGenerator::new(Arc::new(Fixed(Mutex::new(Vec::new()))))
            .with_max_attempts(3);
        let result = generator.new_id(|_| true);
        assert!(matches!(
            result,
            Err(WorkspaceError::IdSpaceExhausted { attempts: 3 })
        ));
    }

    #[test]
    fn concurrent_generation_is_unique() {
        struct Counter(AtomicU64);
        impl IdSource for Counter {
            fn next_token(&self) -> u64 {
                self.0.fetch_add(1, Ordering::Relaxed)
            }
        }

        let generator = IdentityGenerator::new(Arc::new(Counter(AtomicU64::new(0))));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..64)
                        .filter_map(|_| generator.new_id(|_| false).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap_or_default() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 8 * 64);
    }

    #[test]
    fn random_source_produces_distinct_ids() -> WorkspaceResult<()> {
        let generator = IdentityGenerator::random();
        let first = generator.new_id(|_| false)?;
        let second = generator.new_id(|candidate| *candidate == first)?;
        assert_ne!(first, second);
        Ok(())
    }
}
