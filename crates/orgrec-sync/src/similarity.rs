//! Bounded string similarity for person names.

/// Scores two already-normalized names in `[0, 1]`.
pub trait NameScorer: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Jaro similarity with a Winkler common-prefix boost.
///
/// Unlike `strsim::jaro_winkler` the boost is always applied and both the
/// prefix cap and the scaling factor are configurable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JaroWinkler {
    pub prefix_cap: usize,
    pub scaling: f64,
}

impl Default for JaroWinkler {
    fn default() -> Self {
        Self {
            prefix_cap: 4,
            scaling: 0.1,
        }
    }
}

impl NameScorer for JaroWinkler {
    fn score(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let jaro = strsim::jaro(a, b);
        if jaro <= 0.0 {
            return 0.0;
        }
        let prefix_len = a
            .chars()
            .zip(b.chars())
            .take(self.prefix_cap)
            .take_while(|(x, y)| x == y)
            .count();
        (jaro + prefix_len as f64 * self.scaling * (1.0 - jaro)).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn identical_names_score_one() {
        let jw = JaroWinkler::default();
        for name in ["john smith", "a", "maría josé"] {
            assert_eq!(jw.score(name, name), 1.0);
        }
    }

    #[test]
    fn empty_or_disjoint_inputs_score_zero() {
        let jw = JaroWinkler::default();
        assert_eq!(jw.score("", ""), 0.0);
        assert_eq!(jw.score("smith", ""), 0.0);
        assert_eq!(jw.score("", "smith"), 0.0);
        assert_eq!(jw.score("abc", "xyz"), 0.0);
    }

    #[test]
    fn score_is_symmetric() {
        let jw = JaroWinkler::default();
        for (a, b) in [
            ("martha", "marhta"),
            ("dwayne", "duane"),
            ("john smith", "jon smith"),
            ("smith john", "smyth jon"),
        ] {
            assert!((jw.score(a, b) - jw.score(b, a)).abs() < EPS, "{a} / {b}");
        }
    }

    #[test]
    fn classic_reference_values() {
        let jw = JaroWinkler::default();
        assert!((jw.score("martha", "marhta") - 0.961_111).abs() < 1e-6);
        assert!((jw.score("dwayne", "duane") - 0.84).abs() < 1e-6);
    }

    #[test]
    fn agrees_with_strsim_above_its_boost_floor() {
        let jw = JaroWinkler::default();
        let pairs = [
            ("martha", "marhta"),
            ("jhon smith", "john smith"),
            ("dixon", "dicksonx"),
        ];
        for (a, b) in pairs {
            assert!((jw.score(a, b) - strsim::jaro_winkler(a, b)).abs() < EPS);
        }
    }

    #[test]
    fn prefix_cap_limits_boost() {
        let jaro = strsim::jaro("smithson", "smithsen");
        let capped = JaroWinkler {
            prefix_cap: 2,
            scaling: 0.1,
        };
        let capped_score = capped.score("smithson", "smithsen");
        assert!((capped_score - (jaro + 0.2 * (1.0 - jaro))).abs() < EPS);
        assert!(JaroWinkler::default().score("smithson", "smithsen") > capped_score);
    }

    #[test]
    fn scores_stay_bounded() {
        let aggressive = JaroWinkler {
            prefix_cap: 8,
            scaling: 0.125,
        };
        for (a, b) in [("abcdefgh", "abcdefgx"), ("ab", "abc"), ("x", "y")] {
            let score = aggressive.score(a, b);
            assert!((0.0..=1.0).contains(&score));
        }
    }
}
