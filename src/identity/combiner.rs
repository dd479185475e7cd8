//! Merge of the selector configs implicated by one login into a single constraint set.

use std::collections::BTreeSet;
use std::time::Duration;

use super::selector::SelectorConfig;

/// Constraints handed to the token issuer for one login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveConstraints {
    /// Sorted union of every input's policies
    pub policies: Vec<String>,
    /// `None` lets the issuer apply its default
    pub token_ttl: Option<Duration>,
    /// `None` lets the issuer apply the system maximum
    pub token_max_ttl: Option<Duration>,
    /// Carried from the UserID, not recombined
    pub wrap_ttl: Duration,
}

fn min_positive<'a>(vals: impl Iterator<Item = &'a Duration>) -> Option<Duration> {
    vals.filter(|d| !d.is_zero()).min().copied()
}

/// Policy union plus minimum-wins TTLs. A combined TTL above the combined max is clamped
/// down to the max rather than rejected: each input was already valid on its own.
pub fn combine(configs: &[SelectorConfig], wrap_ttl: Duration) -> EffectiveConstraints {
    let policies: BTreeSet<&String> = configs.iter().flat_map(|c| c.policies.iter()).collect();
    let token_max_ttl = min_positive(configs.iter().map(|c| &c.token_max_ttl));
    let mut token_ttl = min_positive(configs.iter().map(|c| &c.token_ttl));
    if let (Some(ttl), Some(max)) = (token_ttl, token_max_ttl) {
        if ttl > max { token_ttl = Some(max); }
    }
    EffectiveConstraints {
        policies: policies.into_iter().cloned().collect(),
        token_ttl,
        token_max_ttl,
        wrap_ttl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, policies: &[&str], ttl: u64, max: u64) -> SelectorConfig {
        SelectorConfig {
            policies: policies.iter().map(|p| p.to_string()).collect(),
            token_ttl: Duration::from_secs(ttl),
            token_max_ttl: Duration::from_secs(max),
            ..SelectorConfig::empty(name)
        }
    }

    #[test]
    fn union_and_minimums() {
        let out = combine(&[cfg("app", &["p1", "p2"], 300, 0), cfg("g1", &["p2", "p3"], 120, 900)], Duration::ZERO);
        assert_eq!(out.policies, vec!["p1", "p2", "p3"]);
        assert_eq!(out.token_ttl, Some(Duration::from_secs(120)));
        assert_eq!(out.token_max_ttl, Some(Duration::from_secs(900)));
    }

    #[test]
    fn unset_values_do_not_win() {
        let out = combine(&[cfg("app", &[], 0, 0), cfg("g1", &[], 0, 0)], Duration::ZERO);
        assert_eq!(out.token_ttl, None);
        assert_eq!(out.token_max_ttl, None);
        assert!(out.policies.is_empty());
    }

    #[test]
    fn ttl_is_clamped_to_combined_max() {
        // each selector is valid alone; together ttl 600 meets max 60
        let out = combine(&[cfg("app", &[], 600, 0), cfg("g1", &[], 0, 60)], Duration::ZERO);
        assert_eq!(out.token_ttl, Some(Duration::from_secs(60)));
        assert_eq!(out.token_max_ttl, Some(Duration::from_secs(60)));
    }

    #[test]
    fn order_independent_and_idempotent() {
        let app = cfg("app", &["a"], 500, 1000);
        let g1 = cfg("g1", &["b"], 200, 0);
        let g2 = cfg("g2", &["c"], 0, 400);
        let base = combine(&[app.clone(), g1.clone(), g2.clone()], Duration::ZERO);
        assert_eq!(base, combine(&[app.clone(), g2.clone(), g1.clone()], Duration::ZERO));
        assert_eq!(base, combine(&[g2.clone(), g1.clone(), app.clone()], Duration::ZERO));
        assert_eq!(base, combine(&[app.clone(), g1.clone(), g1.clone(), g2.clone(), app], Duration::ZERO));
    }

    #[test]
    fn wrap_ttl_is_passed_through() {
        let mut app = cfg("app", &[], 0, 0);
        app.wrap_ttl = Duration::from_secs(99);
        let out = combine(&[app], Duration::from_secs(30));
        assert_eq!(out.wrap_ttl, Duration::from_secs(30));
    }
}
