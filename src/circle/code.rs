//! Invite code generation
//!
//! Codes look like `ABCD-EFGH` and avoid glyphs that are easy to misread
//! (0/O and 1/I/L). Uniqueness is only checked against circles that exist at
//! generation time; two circles created at the same moment can still race.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{CircleFilter, CircleStore};

pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const DEFAULT_CODE_ATTEMPTS: u32 = 10;

type CodeSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Draws `n` characters from [`CODE_ALPHABET`] using UUIDv4 entropy
fn random_chars(n: usize) -> String {
    let mut out = String::with_capacity(n);
    while out.len() < n {
        let uuid = Uuid::new_v4();
        // bytes 6 and 8 carry the version and variant bits
        for (i, byte) in uuid.as_bytes().iter().enumerate() {
            if i == 6 || i == 8 || out.len() == n {
                continue;
            }
            out.push(CODE_ALPHABET[*byte as usize % CODE_ALPHABET.len()] as char);
        }
    }
    out
}

pub fn random_code() -> String {
    let chars = random_chars(8);
    format!("{}-{}", &chars[..4], &chars[4..])
}

/// Four alphabet characters derived from a millisecond timestamp
fn time_suffix(millis: i64) -> String {
    let base = CODE_ALPHABET.len() as u64;
    let mut value = millis.unsigned_abs();
    let mut digits = [0u8; 4];
    for slot in digits.iter_mut().rev() {
        *slot = CODE_ALPHABET[(value % base) as usize];
        value /= base;
    }
    digits.iter().map(|b| *b as char).collect()
}

#[derive(Clone)]
pub struct CodeGenerator {
    store: Arc<dyn CircleStore>,
    max_attempts: u32,
    source: CodeSource,
}

impl CodeGenerator {
    pub fn new(store: Arc<dyn CircleStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            source: Arc::new(random_code),
        }
    }

    /// Replace the random candidate source
    pub fn with_source(mut self, source: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// Whether an active circle already uses `code`
    pub async fn is_taken(&self, code: &str) -> Result<bool> {
        let count = self
            .store
            .count_circles(&CircleFilter::active().with_code(code))
            .await?;
        Ok(count > 0)
    }

    /// Produce a code not used by any active circle.
    ///
    /// After `max_attempts` collisions the last candidate's first half is
    /// kept and the second half is replaced with a timestamp-derived suffix,
    /// so this always terminates.
    pub async fn generate(&self) -> Result<String> {
        let mut last = String::new();
        for attempt in 1..=self.max_attempts {
            let candidate = (self.source)();
            if !self.is_taken(&candidate).await? {
                return Ok(candidate);
            }
            tracing::debug!(attempt, code = %candidate, "Invite code collision");
            last = candidate;
        }

        let prefix: String = last.chars().take(4).collect();
        let code = format!("{}-{}", prefix, time_suffix(Utc::now().timestamp_millis()));
        tracing::warn!(
            attempts = self.max_attempts,
            code = %code,
            "Exhausted invite code attempts, using time-derived suffix"
        );
        Ok(code)
    }
}
