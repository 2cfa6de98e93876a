#![forbid(unsafe_code)]

//! Shared helpers for the test suites: deterministic fixture identifiers and
//! property-test case budgets.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Stable hex identifier for a serializable fixture.
pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Property-test case budget: `SJ_PROPTEST_CASES` wins, CI runs deeper.
#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("SJ_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}
