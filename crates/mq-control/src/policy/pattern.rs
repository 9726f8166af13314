//! Wildcard address patterns
//!
//! A pattern is split on the configured delimiter. `*` matches exactly one
//! segment, `#` matches zero or more trailing segments and must be last.

use std::cmp::Ordering;

use mq_common::WildcardConfig;

use crate::error::ControlError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// `*`
    AnyWord,
    /// `#`
    AnyWords,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPattern {
    text: String,
    segments: Vec<Segment>,
}

/// Ranking used when several patterns match one address. Fields compare in
/// declaration order; greater is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    literal_prefix: usize,
    literal_count: usize,
    without_any_words: bool,
    segment_count: usize,
}

impl AddressPattern {
    pub fn parse(text: &str, wildcard: &WildcardConfig) -> Result<Self> {
        if text.is_empty() {
            return Err(ControlError::InvalidPattern("empty pattern".to_string()));
        }

        let single = wildcard.single_word.to_string();
        let any = wildcard.any_words.to_string();
        let raw: Vec<&str> = text.split(wildcard.delimiter).collect();
        let last = raw.len() - 1;

        let mut segments = Vec::with_capacity(raw.len());
        for (i, part) in raw.into_iter().enumerate() {
            let segment = if part == any {
                if i != last {
                    return Err(ControlError::InvalidPattern(format!(
                        "'{}' may only appear as the last segment: {}",
                        wildcard.any_words, text
                    )));
                }
                Segment::AnyWords
            } else if part == single {
                Segment::AnyWord
            } else if part.is_empty() {
                return Err(ControlError::InvalidPattern(format!("empty segment in {}", text)));
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_catch_all(&self) -> bool {
        matches!(self.segments.as_slice(), [Segment::AnyWords])
    }

    pub fn matches(&self, address: &[&str]) -> bool {
        matches_from(&self.segments, address)
    }

    pub fn specificity(&self) -> Specificity {
        let literal_prefix = self
            .segments
            .iter()
            .take_while(|s| matches!(s, Segment::Literal(_)))
            .count();
        let literal_count = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();

        Specificity {
            literal_prefix,
            literal_count,
            without_any_words: !self.segments.contains(&Segment::AnyWords),
            segment_count: self.segments.len(),
        }
    }

    /// Total order over patterns; ties on specificity fall back to the text
    /// so resolution is deterministic.
    pub fn compare_specificity(&self, other: &AddressPattern) -> Ordering {
        self.specificity()
            .cmp(&other.specificity())
            .then_with(|| other.text.cmp(&self.text))
    }
}

fn matches_from(pattern: &[Segment], address: &[&str]) -> bool {
    match (pattern.first(), address.first()) {
        (None, None) => true,
        (Some(Segment::AnyWords), _) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(Segment::AnyWord), Some(_)) => matches_from(&pattern[1..], &address[1..]),
        (Some(Segment::Literal(lit)), Some(word)) => {
            lit == word && matches_from(&pattern[1..], &address[1..])
        }
    }
}

pub(crate) fn split_address<'a>(address: &'a str, wildcard: &WildcardConfig) -> Vec<&'a str> {
    address.split(wildcard.delimiter).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(text: &str) -> AddressPattern {
        AddressPattern::parse(text, &WildcardConfig::default()).unwrap()
    }

    fn matches(p: &str, address: &str) -> bool {
        let wildcard = WildcardConfig::default();
        pattern(p).matches(&split_address(address, &wildcard))
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches("#", "a.b.c"));
        assert!(matches("a.#", "a"));
        assert!(matches("a.#", "a.b.c"));
        assert!(matches("a.*", "a.b"));
        assert!(!matches("a.*", "a"));
        assert!(!matches("a.*", "a.b.c"));
        assert!(matches("a.*.c", "a.b.c"));
        assert!(!matches("a.b", "a.c"));
        assert!(matches("a.b", "a.b"));
    }

    #[test]
    fn test_hash_must_be_terminal() {
        let wildcard = WildcardConfig::default();
        assert!(matches!(
            AddressPattern::parse("a.#.c", &wildcard),
            Err(ControlError::InvalidPattern(_))
        ));
        assert!(AddressPattern::parse("", &wildcard).is_err());
        assert!(AddressPattern::parse("a..b", &wildcard).is_err());
    }

    #[test]
    fn test_specificity_ordering() {
        // longer literal prefix wins
        assert!(pattern("a.b.#").specificity() > pattern("a.*.c").specificity());
        // equal prefix: '*' beats '#'
        assert!(pattern("a.*").specificity() > pattern("a.#").specificity());
        // exact beats everything
        assert!(pattern("a.b.c").specificity() > pattern("a.b.*").specificity());
        // root is lowest
        assert!(pattern("*").specificity() > pattern("#").specificity());
        assert!(pattern("#").is_catch_all());
    }

    #[test]
    fn test_custom_delimiter() {
        let wildcard = WildcardConfig {
            delimiter: '/',
            single_word: '+',
            any_words: '>',
        };
        let p = AddressPattern::parse("news/+/>", &wildcard).unwrap();
        assert!(p.matches(&split_address("news/eu/sport/football", &wildcard)));
        assert!(!p.matches(&split_address("news", &wildcard)));
    }
}
