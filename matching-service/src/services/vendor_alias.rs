//! Vendor alias lookup and pattern extraction.
//!
//! Aliases map a normalized vendor pattern (as it appears in card
//! descriptions) to a canonical vendor identity and default coding. Lookups
//! try pattern matches first and fall back to fuzzy comparison; learning
//! happens through the store when a match is confirmed.

use crate::models::VendorAlias;
use crate::services::scoring::{normalize_vendor, similarity, FUZZY_VENDOR_THRESHOLD};
use once_cell::sync::Lazy;
use regex::Regex;

// Aggregator/marketplace prefixes that carry the real vendor after them.
// Truncating these would collapse every Square or PayPal charge into one key.
static COMPOUND_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(SQ\s*\*|TST\s*\*|PAYPAL\s*\*|PP\s*\*|[A-Z][A-Z0-9]*\.COM\s*\*)").unwrap()
});

// Trailing reference/confirmation numbers: runs of digits (with #, x, * or
// dash filler) at least three characters long at the end of the description.
static TRAILING_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\s+[#-]?[\dXx*-]{3,})+\s*$").unwrap());

/// Derive a stable vendor key from a raw transaction or group description.
///
/// Trailing reference numbers are stripped and the result is truncated to
/// the leading words; known compound prefixes are preserved together with
/// the vendor segment that follows them.
pub fn extract_vendor_pattern(description: &str) -> String {
    let stripped = TRAILING_REF.replace(description.trim(), "");
    let stripped = stripped.trim();

    if let Some(m) = COMPOUND_PREFIX.find(stripped) {
        let prefix: String = m.as_str().to_uppercase().split_whitespace().collect();
        let rest = normalize_vendor(&stripped[m.end()..]);
        let rest: Vec<&str> = rest.split_whitespace().take(2).collect();
        return format!("{}{}", prefix, rest.join(" ")).trim().to_string();
    }

    let normalized = normalize_vendor(stripped);
    normalized
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Default canonical vendor name for a newly learned alias: the vendor
/// segment of the description, without any aggregator prefix.
pub fn default_canonical_name(description: &str) -> String {
    let pattern = extract_vendor_pattern(description);
    match pattern.rsplit_once('*') {
        Some((_, vendor)) if !vendor.trim().is_empty() => vendor.trim().to_string(),
        _ => pattern,
    }
}

/// How a lookup found its alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasMatchKind {
    /// The alias pattern matched exactly or as a prefix/substring.
    Pattern,
    /// Best fuzzy candidate at or above the similarity threshold.
    Fuzzy,
}

/// A successful alias lookup.
#[derive(Debug, Clone, Copy)]
pub struct AliasHit<'a> {
    pub alias: &'a VendorAlias,
    pub kind: AliasMatchKind,
    pub similarity: f64,
}

/// Per-run snapshot of one user's aliases, so a batch scores hundreds of
/// candidates without going back to the store.
#[derive(Debug, Clone, Default)]
pub struct AliasSnapshot {
    aliases: Vec<VendorAlias>,
}

impl AliasSnapshot {
    pub fn new(aliases: Vec<VendorAlias>) -> Self {
        Self { aliases }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Find the alias for a vendor string: exact/prefix/substring pattern
    /// match first, then the best fuzzy candidate at >= 0.70 similarity.
    pub fn lookup(&self, vendor_text: &str) -> Option<AliasHit<'_>> {
        let query = normalize_vendor(vendor_text);
        if query.is_empty() {
            return None;
        }

        for alias in &self.aliases {
            let pattern = normalize_vendor(&alias.pattern);
            if pattern.is_empty() {
                continue;
            }
            if query == pattern || query.starts_with(&pattern) || query.contains(&pattern) {
                return Some(AliasHit {
                    alias,
                    kind: AliasMatchKind::Pattern,
                    similarity: 1.0,
                });
            }
        }

        let mut best: Option<(&VendorAlias, f64)> = None;
        for alias in &self.aliases {
            let score = similarity(vendor_text, &alias.pattern)
                .max(similarity(vendor_text, &alias.canonical_name));
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((alias, score));
            }
        }

        match best {
            Some((alias, score)) if score >= FUZZY_VENDOR_THRESHOLD => Some(AliasHit {
                alias,
                kind: AliasMatchKind::Fuzzy,
                similarity: score,
            }),
            _ => None,
        }
    }
}
