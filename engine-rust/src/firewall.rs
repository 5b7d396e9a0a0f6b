//! Stream allow/deny filtering with wildcard patterns.
//!
//! Patterns match the dotted four-segment identifier (`NET.STA.LOC.CHA`) with
//! `*` (any run, including across dots) and `?` (any single character). A
//! stream passes when it matches at least one allow pattern (or the allow set
//! is empty) and no deny pattern.

#[derive(Debug, Default, Clone)]
pub struct StreamFirewall {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl StreamFirewall {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        Self {
            allow: allow.to_vec(),
            deny: deny.to_vec(),
        }
    }

    pub fn is_allowed(&self, id: &str) -> bool {
        if !self.allow.is_empty() && !self.allow.iter().any(|p| wildcard_match(p, id)) {
            return false;
        }
        !self.is_denied(id)
    }

    pub fn is_denied(&self, id: &str) -> bool {
        self.deny.iter().any(|p| wildcard_match(p, id))
    }

    pub fn rule_counts(&self) -> (usize, usize) {
        (self.allow.len(), self.deny.len())
    }
}

/// Iterative `*`/`?` glob match with single-star backtracking.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Let the star swallow one more character
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_grammar() {
        assert!(wildcard_match("CH.*", "CH.HASLI..HHZ"));
        assert!(wildcard_match("*.HH?", "CH.HASLI..HHZ"));
        assert!(wildcard_match("CH.HASLI..HHZ", "CH.HASLI..HHZ"));
        assert!(wildcard_match("*", "anything.at.all"));
        assert!(!wildcard_match("CH.?.HHZ", "CH.HASLI..HHZ"));
        assert!(!wildcard_match("XX.*", "CH.HASLI..HHZ"));
        assert!(wildcard_match("CH.HAS*Z", "CH.HASLI..HHZ"));
        assert!(!wildcard_match("CH.HAS", "CH.HASLI..HHZ"));
    }

    #[test]
    fn empty_whitelist_allows_everything_not_denied() {
        let fw = StreamFirewall::new(&[], &["XX.*".into()]);
        assert!(fw.is_allowed("CH.HASLI..HHZ"));
        assert!(!fw.is_allowed("XX.BAD..HHZ"));
    }

    #[test]
    fn whitelist_restricts_and_blacklist_wins() {
        let fw = StreamFirewall::new(
            &["CH.*".into(), "GR.*.HH?".into()],
            &["CH.NOISY.*".into()],
        );
        assert!(fw.is_allowed("CH.HASLI..HHZ"));
        assert!(fw.is_allowed("GR.GRA1..HHN"));
        assert!(!fw.is_allowed("IU.ANMO..BHZ"));
        // Matches the whitelist but also the blacklist
        assert!(!fw.is_allowed("CH.NOISY..HHZ"));
    }
}
