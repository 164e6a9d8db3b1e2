//! Compiled multi-pattern matcher over connection payload bytes.
//!
//! All patterns of all enabled rules are compiled together: a
//! `regex::bytes::RegexSet` answers "which patterns hit this buffer" in one
//! pass, and the per-pattern regexes then enumerate occurrence offsets for
//! the patterns that did. Matching runs on raw bytes; payloads are never
//! assumed to be valid UTF-8.
//!
//! An index is an immutable snapshot. Rebuilds compile a fresh snapshot with
//! a bumped version and publish it through `ArcSwap`, so scans in flight
//! always finish against the version they started with.

use log::debug;
use regex::bytes::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use uuid::Uuid;

use crate::error_handling::types::RuleError;
use crate::rules::types::{PatternOrigin, Rule};

/// Minimum cross-chunk overlap granted to regex patterns, whose match length
/// cannot be bounded at compile time.
const MIN_OVERLAP: usize = 256;

/// One pattern occurrence reported by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub rule_id: Uuid,
    pub pattern_index: usize,
    /// Absolute offset in the side's byte stream
    pub offset: u64,
    pub length: usize,
}

struct CompiledPattern {
    rule_id: Uuid,
    pattern_index: usize,
    origin: PatternOrigin,
    regex: Regex,
}

/// An immutable compiled snapshot of the whole rule set.
pub struct PatternIndex {
    version: u64,
    rules: Vec<Rule>,
    set: RegexSet,
    patterns: Vec<CompiledPattern>,
    overlap_hint: usize,
}

impl PatternIndex {
    /// Compile every pattern of every enabled rule.
    ///
    /// Disabled rules are carried in the snapshot (so queries see them) but
    /// contribute no patterns. Fails with the offending rule id and pattern
    /// position when a regex does not compile or a literal is empty.
    pub fn compile(rules: Vec<Rule>, version: u64) -> Result<Self, RuleError> {
        let mut expressions = Vec::new();
        let mut patterns = Vec::new();
        let mut overlap_hint = MIN_OVERLAP;

        for rule in rules.iter().filter(|rule| rule.enabled) {
            for (pattern_index, pattern) in rule.patterns.iter().enumerate() {
                if pattern.is_literal && pattern.regex.is_empty() {
                    return Err(RuleError::Compile {
                        rule_id: rule.id,
                        pattern_index,
                        reason: "literal pattern is empty".to_string(),
                    });
                }
                let base = if pattern.is_literal {
                    regex::escape(&pattern.regex)
                } else {
                    pattern.regex.clone()
                };
                // inline flag so the prefilter set and the per-pattern regex
                // agree on case folding
                let expression = if pattern.case_sensitive {
                    base
                } else {
                    format!("(?i){}", base)
                };
                let regex = RegexBuilder::new(&expression)
                    .unicode(false)
                    .build()
                    .map_err(|e| RuleError::Compile {
                        rule_id: rule.id,
                        pattern_index,
                        reason: e.to_string(),
                    })?;
                if pattern.is_literal {
                    overlap_hint = overlap_hint.max(pattern.regex.len().saturating_sub(1));
                }
                // The rule-level direction narrows Both-origin patterns.
                let origin = match (pattern.origin, rule.filter.direction) {
                    (PatternOrigin::Both, narrowed) => narrowed,
                    (origin, _) => origin,
                };
                expressions.push(expression);
                patterns.push(CompiledPattern {
                    rule_id: rule.id,
                    pattern_index,
                    origin,
                    regex,
                });
            }
        }

        let set = RegexSetBuilder::new(&expressions)
            .unicode(false)
            .build()
            .map_err(|e| RuleError::Compile {
                rule_id: Uuid::nil(),
                pattern_index: 0,
                reason: e.to_string(),
            })?;

        debug!(
            "compiled pattern index v{}: {} patterns from {} rules",
            version,
            patterns.len(),
            rules.len()
        );

        Ok(Self {
            version,
            rules,
            set,
            patterns,
            overlap_hint,
        })
    }

    /// Compiled rule-set version; bumped on every publish.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rules this snapshot was compiled from, disabled ones included.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// How many trailing bytes a streaming caller must rescan so that
    /// matches spanning a chunk boundary are not lost.
    pub fn overlap_hint(&self) -> usize {
        self.overlap_hint
    }

    /// Scan `bytes` coming from one side of a flow.
    ///
    /// `from_client` selects which pattern origins apply; `base_offset` is
    /// the absolute stream offset of `bytes[0]`, carried through into the
    /// reported match offsets. Matches come back grouped by pattern, each
    /// group in start-offset order with non-overlapping occurrences
    /// (leftmost-first per pattern); distinct patterns may overlap freely.
    pub fn scan(&self, from_client: bool, bytes: &[u8], base_offset: u64) -> Vec<PatternMatch> {
        let mut matches = Vec::new();
        if bytes.is_empty() || self.patterns.is_empty() {
            return matches;
        }
        for index in self.set.matches(bytes) {
            let compiled = &self.patterns[index];
            if !compiled.origin.accepts(from_client) {
                continue;
            }
            for hit in compiled.regex.find_iter(bytes) {
                matches.push(PatternMatch {
                    rule_id: compiled.rule_id,
                    pattern_index: compiled.pattern_index,
                    offset: base_offset + hit.start() as u64,
                    length: hit.len(),
                });
            }
        }
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::{Pattern, RuleFilter};

    fn rule_with(patterns: Vec<Pattern>) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            patterns,
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_rejects_bad_regex_and_empty_literal() {
        let rule = rule_with(vec![Pattern {
            regex: "(".to_string(),
            ..Default::default()
        }]);
        let rule_id = rule.id;
        match PatternIndex::compile(vec![rule], 1) {
            Err(RuleError::Compile {
                rule_id: id,
                pattern_index,
                ..
            }) => {
                assert_eq!(id, rule_id);
                assert_eq!(pattern_index, 0);
            }
            other => panic!("expected compile error, got {:?}", other.is_ok()),
        }

        let rule = rule_with(vec![Pattern {
            regex: String::new(),
            is_literal: true,
            ..Default::default()
        }]);
        assert!(PatternIndex::compile(vec![rule], 1).is_err());
    }

    #[test]
    fn test_scan_reports_absolute_offsets_in_order() {
        let rule = rule_with(vec![Pattern {
            regex: "flag{".to_string(),
            is_literal: true,
            ..Default::default()
        }]);
        let rule_id = rule.id;
        let index = PatternIndex::compile(vec![rule], 1).unwrap();

        let hits = index.scan(true, b"xxflag{a}yyflag{b}", 100);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rule_id, rule_id);
        assert_eq!(hits[0].offset, 102);
        assert_eq!(hits[1].offset, 111);
        assert_eq!(hits[0].length, 5);
    }

    #[test]
    fn test_literal_is_escaped_and_case_flag_respected() {
        let rule = rule_with(vec![
            Pattern {
                regex: "a.b".to_string(),
                is_literal: true,
                ..Default::default()
            },
            Pattern {
                regex: "admin".to_string(),
                is_literal: true,
                case_sensitive: false,
                ..Default::default()
            },
        ]);
        let index = PatternIndex::compile(vec![rule], 1).unwrap();

        // dot must not act as a wildcard
        assert!(index.scan(true, b"axb", 0).is_empty());
        assert_eq!(index.scan(true, b"a.b", 0).len(), 1);
        assert_eq!(index.scan(true, b"ADMIN", 0).len(), 1);
    }

    #[test]
    fn test_origin_filtering_at_emission() {
        let rule = rule_with(vec![Pattern {
            regex: "secret".to_string(),
            is_literal: true,
            origin: PatternOrigin::Server,
            ..Default::default()
        }]);
        let index = PatternIndex::compile(vec![rule], 1).unwrap();

        assert!(index.scan(true, b"secret", 0).is_empty());
        assert_eq!(index.scan(false, b"secret", 0).len(), 1);
    }

    #[test]
    fn test_rule_direction_narrows_both_origin_patterns() {
        let mut rule = rule_with(vec![Pattern {
            regex: "token".to_string(),
            is_literal: true,
            origin: PatternOrigin::Both,
            ..Default::default()
        }]);
        rule.filter = RuleFilter {
            direction: PatternOrigin::Client,
            ..Default::default()
        };
        let index = PatternIndex::compile(vec![rule], 1).unwrap();

        assert_eq!(index.scan(true, b"token", 0).len(), 1);
        assert!(index.scan(false, b"token", 0).is_empty());
    }

    #[test]
    fn test_disabled_rules_contribute_no_patterns() {
        let mut rule = rule_with(vec![Pattern {
            regex: "x".to_string(),
            is_literal: true,
            ..Default::default()
        }]);
        rule.enabled = false;
        let index = PatternIndex::compile(vec![rule], 3).unwrap();
        assert!(index.scan(true, b"xxx", 0).is_empty());
        assert_eq!(index.rules().len(), 1);
        assert_eq!(index.version(), 3);
    }

    #[test]
    fn test_overlapping_distinct_patterns_all_surface() {
        let rule = rule_with(vec![
            Pattern {
                regex: "abcd".to_string(),
                is_literal: true,
                ..Default::default()
            },
            Pattern {
                regex: "bc".to_string(),
                is_literal: true,
                ..Default::default()
            },
        ]);
        let index = PatternIndex::compile(vec![rule], 1).unwrap();
        let hits = index.scan(true, b"abcd", 0);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_overlap_hint_tracks_longest_literal() {
        let rule = rule_with(vec![Pattern {
            regex: "a".repeat(1000),
            is_literal: true,
            ..Default::default()
        }]);
        let index = PatternIndex::compile(vec![rule], 1).unwrap();
        assert_eq!(index.overlap_hint(), 999);
    }
}
