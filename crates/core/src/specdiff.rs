//! Structural comparison of desired spec payloads against observed state.
//!
//! Live objects carry server-populated defaults the caller never asked for,
//! so equality is subset-based: every field the desired payload names must
//! match the observed payload. Arrays compare index-wise and whole (a length
//! difference is a difference).

use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecComparison {
    /// Observed state already satisfies the desired payload.
    Equal,
    /// At least one desired field is missing or different.
    Differs,
    /// The payloads cannot be structurally compared (non-object at the top).
    /// Callers plan a conservative update for these.
    Ambiguous,
}

pub fn compare_specs(desired: &Json, observed: &Json) -> SpecComparison {
    if !desired.is_object() || !observed.is_object() {
        return SpecComparison::Ambiguous;
    }
    if subset_matches(desired, observed) {
        SpecComparison::Equal
    } else {
        SpecComparison::Differs
    }
}

/// True when every field `desired` names exists in `observed` with a
/// matching value. A desired `null` matches a missing field.
fn subset_matches(desired: &Json, observed: &Json) -> bool {
    match (desired, observed) {
        (Json::Object(want), Json::Object(have)) => want.iter().all(|(k, wv)| match have.get(k) {
            Some(hv) => subset_matches(wv, hv),
            None => wv.is_null(),
        }),
        (Json::Array(want), Json::Array(have)) => {
            want.len() == have.len()
                && want.iter().zip(have.iter()).all(|(wv, hv)| subset_matches(wv, hv))
        }
        (wv, hv) => wv == hv,
    }
}
