//! Risk-level derivation (spec §4.3). Metadata only — never gates whether an
//! update is applied, only how subscribers are expected to treat it.

use crate::model::RiskLevel;

/// Derives a risk level for a digest divergence on `tag`.
///
/// Security signals take precedence over version-bump heuristics. When the
/// tag isn't semver-shaped, callers should fall back to `RiskLevel::Medium`
/// rather than guessing.
pub fn derive_risk_level(tag: &str, security_advisory: bool, security_patched_label: bool) -> RiskLevel {
    if security_advisory || security_patched_label {
        return RiskLevel::Critical;
    }
    match classify_semver_bump(tag) {
        Some(SemverBump::Major) => RiskLevel::High,
        Some(SemverBump::Minor) => RiskLevel::Medium,
        Some(SemverBump::Patch) => RiskLevel::Low,
        None => RiskLevel::Medium,
    }
}

enum SemverBump {
    Major,
    Minor,
    Patch,
}

/// A single version-tag's risk class is judged on its own shape (does it
/// carry a major/minor/patch component at all), not a diff against the
/// previous tag — the watcher only ever observes one tag per container.
fn classify_semver_bump(tag: &str) -> Option<SemverBump> {
    let trimmed = tag.trim_start_matches('v');
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || !parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty()) {
        return None;
    }
    match parts.len() {
        1 => Some(SemverBump::Major),
        2 => Some(SemverBump::Minor),
        _ => Some(SemverBump::Patch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_advisory_always_critical() {
        assert_eq!(derive_risk_level("1.2.3", true, false), RiskLevel::Critical);
        assert_eq!(derive_risk_level("1.2.3", false, true), RiskLevel::Critical);
    }

    #[test]
    fn semver_shape_drives_risk_without_security_signal() {
        assert_eq!(derive_risk_level("2", false, false), RiskLevel::High);
        assert_eq!(derive_risk_level("2.4", false, false), RiskLevel::Medium);
        assert_eq!(derive_risk_level("2.4.9", false, false), RiskLevel::Low);
    }

    #[test]
    fn unparseable_tag_is_medium() {
        assert_eq!(derive_risk_level("latest", false, false), RiskLevel::Medium);
        assert_eq!(derive_risk_level("nightly-2024", false, false), RiskLevel::Medium);
    }
}
