//! Semantic versioning for configuration and parameter versions

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::schema::SchemaDiff;

static SEMVER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-([0-9A-Za-z\-\.]+))?(?:\+([0-9A-Za-z\-\.]+))?$")
        .unwrap()
});

/// A single pre-release identifier
///
/// Identifiers consisting solely of digits compare numerically; all other
/// identifiers compare lexicographically, and numeric identifiers always
/// have lower precedence than alphanumeric ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    /// Purely numeric identifier
    Numeric(u64),
    /// Alphanumeric identifier
    Alphanumeric(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(n) => write!(f, "{}", n),
            Identifier::Alphanumeric(s) => write!(f, "{}", s),
        }
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Identifier::Numeric(a), Identifier::Numeric(b)) => a.cmp(b),
            (Identifier::Numeric(_), Identifier::Alphanumeric(_)) => Ordering::Less,
            (Identifier::Alphanumeric(_), Identifier::Numeric(_)) => Ordering::Greater,
            (Identifier::Alphanumeric(a), Identifier::Alphanumeric(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Semantic version per SemVer 2.0
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version (breaking changes)
    pub major: u64,
    /// Minor version (backward-compatible additions)
    pub minor: u64,
    /// Patch version (backward-compatible bug fixes)
    pub patch: u64,
    /// Pre-release identifiers (empty for a release version)
    pub prerelease: Vec<Identifier>,
    /// Build metadata; preserved but ignored in precedence
    pub build: Option<String>,
}

impl Version {
    /// Create a new release version
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: Vec::new(),
            build: None,
        }
    }

    /// Check if this is a pre-release version
    pub fn is_prerelease(&self) -> bool {
        !self.prerelease.is_empty()
    }

    /// Minimum bump required for a schema change relative to the previous
    /// published version
    pub fn satisfies_bump(&self, previous: &Version, diff: SchemaDiff) -> bool {
        match diff {
            SchemaDiff::Breaking => self.major > previous.major,
            SchemaDiff::Additive => {
                self.major > previous.major
                    || (self.major == previous.major && self.minor > previous.minor)
            }
            // Identical shapes only demand that the version moves forward.
            SchemaDiff::Identical => self > previous,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;

        if !self.prerelease.is_empty() {
            let joined = self
                .prerelease
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(".");
            write!(f, "-{}", joined)?;
        }

        if let Some(ref build) = self.build {
            write!(f, "+{}", build)?;
        }

        Ok(())
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let captures = SEMVER_RE
            .captures(s)
            .ok_or_else(|| Error::Validation(format!("invalid semantic version: {}", s)))?;

        let prerelease = match captures.get(4) {
            Some(m) => m
                .as_str()
                .split('.')
                .map(parse_identifier)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let component = |index: usize| -> Result<u64> {
            captures[index]
                .parse()
                .map_err(|_| Error::Validation(format!("version component overflows: {}", s)))
        };

        Ok(Self {
            major: component(1)?,
            minor: component(2)?,
            patch: component(3)?,
            prerelease,
            build: captures.get(5).map(|m| m.as_str().to_string()),
        })
    }
}

fn parse_identifier(raw: &str) -> Result<Identifier> {
    if raw.is_empty() {
        return Err(Error::Validation("empty pre-release identifier".into()));
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        // Leading zeros are not valid for numeric identifiers.
        if raw.len() > 1 && raw.starts_with('0') {
            return Err(Error::Validation(format!(
                "numeric pre-release identifier has leading zero: {}",
                raw
            )));
        }
        let n = raw
            .parse::<u64>()
            .map_err(|_| Error::Validation(format!("pre-release identifier overflows: {}", raw)))?;
        Ok(Identifier::Numeric(n))
    } else {
        Ok(Identifier::Alphanumeric(raw.to_string()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.major.cmp(&other.major) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match self.minor.cmp(&other.minor) {
            Ordering::Equal => {}
            ord => return ord,
        }

        match self.patch.cmp(&other.patch) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // A pre-release version precedes its release counterpart.
        match (self.prerelease.is_empty(), other.prerelease.is_empty()) {
            (true, true) => return Ordering::Equal,
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            (false, false) => {}
        }

        // Identifiers compare left-to-right; a longer list wins over an
        // otherwise-equal prefix.
        for (a, b) in self.prerelease.iter().zip(other.prerelease.iter()) {
            match a.cmp(b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.prerelease.len().cmp(&other.prerelease.len())
        // Build metadata is ignored in precedence
    }
}

/// A candidate for latest-version selection
#[derive(Debug, Clone)]
pub struct VersionCandidate {
    /// Parsed version
    pub version: Version,
    /// Draft versions are never selectable
    pub is_draft: bool,
    /// Archived versions are never selectable
    pub is_archived: bool,
}

/// Select the latest published version from a candidate set
///
/// Drafts and archived versions are always filtered out. Pre-release
/// versions are excluded unless `include_prerelease` is set.
pub fn latest(candidates: &[VersionCandidate], include_prerelease: bool) -> Result<Version> {
    candidates
        .iter()
        .filter(|c| !c.is_draft && !c.is_archived)
        .filter(|c| include_prerelease || !c.version.is_prerelease())
        .map(|c| &c.version)
        .max()
        .cloned()
        .ok_or_else(|| Error::NotFound("no published version".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_display_roundtrip() {
        for s in ["1.2.3", "1.2.3-alpha.1", "1.2.3-alpha.1+build.123", "0.0.0", "10.0.0-rc.1"] {
            assert_eq!(v(s).to_string(), s);
        }
    }

    #[test]
    fn test_version_parse_rejects_garbage() {
        for s in ["1.2", "1.2.3.4", "v1.2.3", "1.2.3-", "1.2.3-01", "01.2.3", ""] {
            assert!(s.parse::<Version>().is_err(), "accepted {:?}", s);
        }
    }

    #[test]
    fn test_core_ordering() {
        assert!(v("1.0.0") < v("2.0.0"));
        assert!(v("1.0.0") < v("1.1.0"));
        assert!(v("1.0.0") < v("1.0.1"));
        assert!(v("2.1.0") > v("2.0.9"));
    }

    #[test]
    fn test_prerelease_precedes_release() {
        assert!(v("1.0.0-alpha") < v("1.0.0"));
        assert!(v("1.0.0") > v("1.0.0-rc.1"));
    }

    #[test]
    fn test_prerelease_identifier_ordering() {
        // The canonical SemVer 2.0 precedence chain.
        let chain = [
            "1.0.0-alpha",
            "1.0.0-alpha.1",
            "1.0.0-alpha.beta",
            "1.0.0-beta",
            "1.0.0-beta.2",
            "1.0.0-beta.11",
            "1.0.0-rc.1",
            "1.0.0",
        ];
        for pair in chain.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_build_metadata_ignored_in_precedence() {
        assert_eq!(v("1.0.0+build.1").cmp(&v("1.0.0+build.2")), Ordering::Equal);
        assert_eq!(v("1.0.0-rc.1+a").cmp(&v("1.0.0-rc.1+b")), Ordering::Equal);
    }

    #[test]
    fn test_latest_excludes_drafts_and_prereleases() {
        let candidates = vec![
            VersionCandidate { version: v("1.0.0"), is_draft: false, is_archived: false },
            VersionCandidate { version: v("2.0.0"), is_draft: true, is_archived: false },
            VersionCandidate { version: v("1.5.0-rc.1"), is_draft: false, is_archived: false },
            VersionCandidate { version: v("1.2.0"), is_draft: false, is_archived: true },
        ];

        assert_eq!(latest(&candidates, false).unwrap(), v("1.0.0"));
        assert_eq!(latest(&candidates, true).unwrap(), v("1.5.0-rc.1"));
    }

    #[test]
    fn test_latest_empty_set_fails() {
        let candidates = vec![VersionCandidate {
            version: v("1.0.0"),
            is_draft: true,
            is_archived: false,
        }];
        assert!(latest(&candidates, true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_satisfies_bump() {
        let prev = v("1.4.2");
        assert!(v("2.0.0").satisfies_bump(&prev, SchemaDiff::Breaking));
        assert!(!v("1.5.0").satisfies_bump(&prev, SchemaDiff::Breaking));
        assert!(v("1.5.0").satisfies_bump(&prev, SchemaDiff::Additive));
        assert!(!v("1.4.3").satisfies_bump(&prev, SchemaDiff::Additive));
        assert!(v("1.4.3").satisfies_bump(&prev, SchemaDiff::Identical));
        assert!(!v("1.4.2").satisfies_bump(&prev, SchemaDiff::Identical));
    }

    proptest! {
        #[test]
        fn prop_ordering_is_total(a in r"(0|[1-9][0-9]{0,3})\.(0|[1-9][0-9]{0,3})\.(0|[1-9][0-9]{0,3})",
                                  b in r"(0|[1-9][0-9]{0,3})\.(0|[1-9][0-9]{0,3})\.(0|[1-9][0-9]{0,3})") {
            let va = v(&a);
            let vb = v(&b);
            let lt = va < vb;
            let gt = va > vb;
            let eq = va.cmp(&vb) == Ordering::Equal;
            prop_assert_eq!([lt, eq, gt].iter().filter(|x| **x).count(), 1);
        }
    }
}
