//! Semantic version parsing and constraint matching for Butler Registry.
//!
//! This crate provides the version arithmetic the registry core relies on:
//! - Parsing `vMAJOR.MINOR.PATCH[-PRERELEASE]` tags into ordered versions
//! - The patch-bump predicate driving auto-approval
//! - Terraform-style constraint expressions (`~>`, `=`, `>=`, ...) translated
//!   into version ranges, with an exact-string fallback for anything that
//!   does not parse
//!
//! # Example
//!
//! ```
//! use butler_semver::{Version, Constraint};
//!
//! let prev = Version::parse("v1.2.3").unwrap();
//! let next = Version::parse("1.2.4").unwrap();
//! assert!(next.is_patch_bump_of(&prev));
//!
//! let pin = Constraint::parse("~> 1.2");
//! assert!(pin.matches(&next));
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version: {input:?}: {reason}")]
pub struct InvalidVersion {
    /// The rejected input, as received.
    pub input: String,
    /// Why the input was rejected.
    pub reason: String,
}

impl InvalidVersion {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed semantic version.
///
/// `raw` preserves the input with any leading `v` stripped; equality and
/// ordering ignore it and compare the logical components only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Prerelease suffix without the leading `-`, if any.
    pub prerelease: Option<String>,
    /// The prefix-stripped input string.
    pub raw: String,
}

impl Version {
    /// Parse a version string, accepting an optional leading `v`.
    ///
    /// The shape is `MAJOR.MINOR.PATCH[-PRERELEASE]`; all three numeric
    /// components are required.
    pub fn parse(input: &str) -> Result<Self, InvalidVersion> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(InvalidVersion::new(input, "empty input"));
        }
        let stripped = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let (core, prerelease) = match stripped.split_once('-') {
            Some((_, pre)) if pre.is_empty() => {
                return Err(InvalidVersion::new(input, "empty prerelease"));
            }
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (stripped, None),
        };

        let mut parts = core.split('.');
        let major = parse_component(input, parts.next())?;
        let minor = parse_component(input, parts.next())?;
        let patch = parse_component(input, parts.next())?;
        if parts.next().is_some() {
            return Err(InvalidVersion::new(input, "too many components"));
        }

        Ok(Self {
            major,
            minor,
            patch,
            prerelease,
            raw: stripped.to_string(),
        })
    }

    /// Render the version back to its canonical string (the stripped raw).
    pub fn render(&self) -> &str {
        &self.raw
    }

    /// True when `self` is a patch bump over `prev`: same major and minor,
    /// strictly greater patch, and no prerelease suffix.
    pub fn is_patch_bump_of(&self, prev: &Version) -> bool {
        self.major == prev.major
            && self.minor == prev.minor
            && self.patch > prev.patch
            && self.prerelease.is_none()
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

fn parse_component(input: &str, part: Option<&str>) -> Result<u64, InvalidVersion> {
    let part = part.ok_or_else(|| InvalidVersion::new(input, "missing component"))?;
    if part.is_empty() {
        return Err(InvalidVersion::new(input, "empty component"));
    }
    part.parse::<u64>()
        .map_err(|_| InvalidVersion::new(input, format!("non-numeric component {part:?}")))
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple()).then_with(|| {
            match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A release sorts above any prerelease of the same triple.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.as_bytes().cmp(b.as_bytes()),
            }
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Comparison operator inside a constraint range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A single bound in a constraint range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparator {
    pub op: Op,
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Comparator {
    fn bound(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    fn matches(&self, v: &Version) -> bool {
        // Prerelease versions sort below their release triple, so a
        // comparator against the bare triple treats `1.2.4-rc.1 >= 1.2.4`
        // as false and `1.2.4-rc.1 < 1.2.4` as true.
        let ord = v
            .triple()
            .cmp(&self.bound())
            .then(if v.prerelease.is_some() {
                Ordering::Less
            } else {
                Ordering::Equal
            });
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Gte => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Lte => ord != Ordering::Greater,
        }
    }
}

/// A parsed version constraint.
///
/// `Range` is the normal case; `Exact` is the fallback when the expression
/// does not parse as any supported syntax, in which case matching degrades
/// to exact string comparison against the pinned text. An unknown form never
/// over-matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    Range(Vec<Comparator>),
    Exact(String),
}

impl Constraint {
    /// Parse a Terraform-style constraint expression.
    ///
    /// Supported forms: `~> X.Y`, `~> X.Y.Z`, `= X.Y.Z`, `=X.Y.Z`, plain
    /// `X.Y.Z`, and `>=`/`>`/`<=`/`<` bounds. Commas are equivalent to
    /// spaces and combine as logical AND. Anything else yields the
    /// exact-string fallback.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        match parse_range(trimmed) {
            Some(comparators) if !comparators.is_empty() => Self::Range(comparators),
            _ => Self::Exact(trimmed.to_string()),
        }
    }

    /// Test whether a version satisfies this constraint.
    pub fn matches(&self, v: &Version) -> bool {
        match self {
            Self::Range(comparators) => comparators.iter().all(|c| c.matches(v)),
            Self::Exact(pin) => pin == &v.raw,
        }
    }
}

fn parse_range(input: &str) -> Option<Vec<Comparator>> {
    let mut comparators = Vec::new();
    let mut tokens = input.split([',', ' ', '\t']).filter(|t| !t.is_empty());

    while let Some(token) = tokens.next() {
        let (op, rest) = split_operator(token);
        let version_text = if rest.is_empty() {
            match op {
                // A bare version token carries no trailing operand.
                RangeOp::Plain => return None,
                _ => tokens.next()?,
            }
        } else {
            rest
        };
        let parts = parse_partial(version_text)?;
        comparators.extend(expand(op, parts)?);
    }

    Some(comparators)
}

/// Operator tokens accepted at the head of a constraint term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOp {
    Pessimistic,
    Eq,
    Gte,
    Gt,
    Lte,
    Lt,
    /// No operator: the term must be a full `X.Y.Z` and matches exactly.
    Plain,
}

fn split_operator(token: &str) -> (RangeOp, &str) {
    for (prefix, op) in [
        ("~>", RangeOp::Pessimistic),
        (">=", RangeOp::Gte),
        ("<=", RangeOp::Lte),
        (">", RangeOp::Gt),
        ("<", RangeOp::Lt),
        ("=", RangeOp::Eq),
    ] {
        if let Some(rest) = token.strip_prefix(prefix) {
            return (op, rest);
        }
    }
    (RangeOp::Plain, token)
}

/// Parsed partial version: the numeric components that were present.
struct Partial {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
}

fn parse_partial(text: &str) -> Option<Partial> {
    let text = text.strip_prefix('v').unwrap_or(text);
    let mut parts = text.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(p) => Some(p.parse().ok()?),
        None => None,
    };
    let patch = match parts.next() {
        Some(p) => Some(p.parse().ok()?),
        None => None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(Partial {
        major,
        minor,
        patch,
    })
}

fn expand(op: RangeOp, p: Partial) -> Option<Vec<Comparator>> {
    let cmp = |op, major, minor, patch| Comparator {
        op,
        major,
        minor,
        patch,
    };
    match op {
        RangeOp::Pessimistic => match (p.minor, p.patch) {
            // ~> X.Y  =>  >=X.Y.0 <(X+1).0.0
            (Some(minor), None) => Some(vec![
                cmp(Op::Gte, p.major, minor, 0),
                cmp(Op::Lt, p.major.checked_add(1)?, 0, 0),
            ]),
            // ~> X.Y.Z  =>  >=X.Y.Z <X.(Y+1).0
            (Some(minor), Some(patch)) => Some(vec![
                cmp(Op::Gte, p.major, minor, patch),
                cmp(Op::Lt, p.major, minor.checked_add(1)?, 0),
            ]),
            (None, _) => None,
        },
        RangeOp::Eq | RangeOp::Plain => {
            // Exact forms require all three components.
            Some(vec![cmp(Op::Eq, p.major, p.minor?, p.patch?)])
        }
        RangeOp::Gte => Some(vec![cmp(
            Op::Gte,
            p.major,
            p.minor.unwrap_or(0),
            p.patch.unwrap_or(0),
        )]),
        RangeOp::Gt => Some(vec![cmp(
            Op::Gt,
            p.major,
            p.minor.unwrap_or(0),
            p.patch.unwrap_or(0),
        )]),
        RangeOp::Lte => Some(vec![cmp(
            Op::Lte,
            p.major,
            p.minor.unwrap_or(0),
            p.patch.unwrap_or(0),
        )]),
        RangeOp::Lt => Some(vec![cmp(
            Op::Lt,
            p.major,
            p.minor.unwrap_or(0),
            p.patch.unwrap_or(0),
        )]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_parse_basic() {
        let parsed = v("1.2.3");
        assert_eq!(parsed.major, 1);
        assert_eq!(parsed.minor, 2);
        assert_eq!(parsed.patch, 3);
        assert_eq!(parsed.prerelease, None);
        assert_eq!(parsed.raw, "1.2.3");
    }

    #[test]
    fn test_parse_strips_v_prefix() {
        let parsed = v("v10.0.1");
        assert_eq!(parsed.major, 10);
        assert_eq!(parsed.raw, "10.0.1");
    }

    #[test]
    fn test_parse_prerelease() {
        let parsed = v("1.2.3-rc.1");
        assert_eq!(parsed.prerelease.as_deref(), Some("rc.1"));
        assert_eq!(parsed.raw, "1.2.3-rc.1");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in ["", "1", "1.2", "1.2.x", "1..3", "1.2.3.4", "1.2.3-", "abc"] {
            assert!(Version::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.2.3") < v("1.2.4"));
        assert!(v("1.2.10") > v("1.2.9"));
        assert!(v("2.0.0") > v("1.99.99"));
        // Release beats prerelease of the same triple.
        assert!(v("1.2.3") > v("1.2.3-rc.1"));
        // Prereleases compare lexicographically (ASCII).
        assert!(v("1.2.3-alpha") < v("1.2.3-beta"));
        assert_eq!(v("1.2.3"), v("v1.2.3"));
    }

    #[test]
    fn test_patch_bump() {
        assert!(v("1.2.4").is_patch_bump_of(&v("1.2.3")));
        assert!(!v("1.3.0").is_patch_bump_of(&v("1.2.3")));
        assert!(!v("2.2.4").is_patch_bump_of(&v("1.2.3")));
        assert!(!v("1.2.3").is_patch_bump_of(&v("1.2.3")));
        assert!(!v("1.2.2").is_patch_bump_of(&v("1.2.3")));
        assert!(!v("1.2.4-rc.1").is_patch_bump_of(&v("1.2.3")));
    }

    #[test]
    fn test_pessimistic_two_component() {
        let c = Constraint::parse("~> 1.2");
        assert!(c.matches(&v("1.2.0")));
        assert!(c.matches(&v("1.2.4")));
        assert!(c.matches(&v("1.9.0")));
        assert!(!c.matches(&v("2.0.0")));
        assert!(!c.matches(&v("1.1.9")));
    }

    #[test]
    fn test_pessimistic_three_component() {
        let c = Constraint::parse("~> 1.2.3");
        assert!(c.matches(&v("1.2.3")));
        assert!(c.matches(&v("1.2.9")));
        assert!(!c.matches(&v("1.3.0")));
        assert!(!c.matches(&v("1.2.2")));
    }

    #[test]
    fn test_exact_forms() {
        for expr in ["= 1.2.3", "=1.2.3", "1.2.3"] {
            let c = Constraint::parse(expr);
            assert!(c.matches(&v("1.2.3")), "{expr} rejected 1.2.3");
            assert!(!c.matches(&v("1.2.4")), "{expr} accepted 1.2.4");
        }
    }

    #[test]
    fn test_combined_bounds() {
        let c = Constraint::parse(">= 1.0, < 2.0");
        assert!(c.matches(&v("1.0.0")));
        assert!(c.matches(&v("1.9.9")));
        assert!(!c.matches(&v("2.0.0")));
        assert!(!c.matches(&v("0.9.9")));
        // Commas and spaces are interchangeable.
        assert_eq!(c, Constraint::parse(">= 1.0 < 2.0"));
    }

    #[test]
    fn test_operator_with_detached_operand() {
        let c = Constraint::parse("~> 1.2.0");
        assert_eq!(c, Constraint::parse("~>1.2.0"));
    }

    #[test]
    fn test_unparseable_falls_back_to_exact_string() {
        let c = Constraint::parse("latest-stable");
        assert_eq!(c, Constraint::Exact("latest-stable".to_string()));
        assert!(!c.matches(&v("1.2.3")));

        // A bare two-component pin is not a supported plain form.
        let c = Constraint::parse("1.2");
        assert_eq!(c, Constraint::Exact("1.2".to_string()));
    }

    #[test]
    fn test_prerelease_excluded_from_lower_bound() {
        let c = Constraint::parse(">= 1.2.4");
        assert!(!c.matches(&v("1.2.4-rc.1")));
        assert!(c.matches(&v("1.2.4")));
    }

    proptest! {
        /// Parsing the rendered form of a parsed version yields an equal version.
        #[test]
        fn prop_parse_render_roundtrip(
            major in 0u64..1000,
            minor in 0u64..1000,
            patch in 0u64..1000,
            pre in proptest::option::of("[0-9a-zA-Z.]{1,8}"),
        ) {
            let raw = match &pre {
                Some(p) => format!("{major}.{minor}.{patch}-{p}"),
                None => format!("{major}.{minor}.{patch}"),
            };
            let first = Version::parse(&raw).unwrap();
            let second = Version::parse(first.render()).unwrap();
            prop_assert_eq!(first, second);
        }

        /// A `v` prefix never changes the parse.
        #[test]
        fn prop_v_prefix_irrelevant(major in 0u64..1000, minor in 0u64..1000, patch in 0u64..1000) {
            let bare = format!("{major}.{minor}.{patch}");
            let prefixed = format!("v{bare}");
            prop_assert_eq!(Version::parse(&bare).unwrap(), Version::parse(&prefixed).unwrap());
        }

        /// Pessimistic two-component ranges accept exactly the same-major,
        /// at-least-minor releases.
        #[test]
        fn prop_pessimistic_two(major in 0u64..100, minor in 0u64..100, t_major in 0u64..100, t_minor in 0u64..100, t_patch in 0u64..100) {
            let c = Constraint::parse(&format!("~> {major}.{minor}"));
            let candidate = Version::parse(&format!("{t_major}.{t_minor}.{t_patch}")).unwrap();
            let expected = t_major == major && (t_minor, t_patch) >= (minor, 0);
            prop_assert_eq!(c.matches(&candidate), expected);
        }
    }
}
