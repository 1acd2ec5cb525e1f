//! Four-component module versions and the boost merge used for package versions.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `Major.Minor.Build.Revision` version whose components may be absent
///
/// Absence is distinct from zero: `1.2` and `1.2.0.0` are different versions.
/// Well-formed versions only ever have absent components as a suffix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionSpec {
    /// Major component
    pub major: Option<u32>,
    /// Minor component
    pub minor: Option<u32>,
    /// Build component
    pub build: Option<u32>,
    /// Revision component
    pub revision: Option<u32>,
}

impl VersionSpec {
    /// A version with every component absent
    pub const EMPTY: VersionSpec = VersionSpec {
        major: None,
        minor: None,
        build: None,
        revision: None,
    };

    /// Creates a version from its four optional components
    pub const fn new(
        major: Option<u32>,
        minor: Option<u32>,
        build: Option<u32>,
        revision: Option<u32>,
    ) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Creates a fully specified four-component version
    pub const fn full(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self::new(Some(major), Some(minor), Some(build), Some(revision))
    }

    /// Creates a `Major.Minor` version
    pub const fn major_minor(major: u32, minor: u32) -> Self {
        Self::new(Some(major), Some(minor), None, None)
    }

    /// Components in `Major, Minor, Build, Revision` order
    pub fn components(&self) -> [Option<u32>; 4] {
        [self.major, self.minor, self.build, self.revision]
    }

    fn from_components(components: [Option<u32>; 4]) -> Self {
        let [major, minor, build, revision] = components;
        Self::new(major, minor, build, revision)
    }

    /// Number of leading components that are present
    pub fn defined_len(&self) -> usize {
        self.components().iter().take_while(|c| c.is_some()).count()
    }

    /// Drops every component after the first absent one
    pub fn truncated(&self) -> Self {
        let len = self.defined_len();
        let mut components = self.components();
        for component in components.iter_mut().skip(len) {
            *component = None;
        }
        Self::from_components(components)
    }

    /// Returns true if at least `Major.Minor` is present and absence only occurs as a suffix
    pub fn is_well_formed(&self) -> bool {
        let len = self.defined_len();
        len >= 2 && self.components()[len..].iter().all(Option::is_none)
    }

    /// Merges `boost` into `primary` component by component
    ///
    /// A component absent on one side takes the other side's value, two present
    /// components are added. The result is truncated to its longest present
    /// prefix and must keep at least `Major.Minor`.
    pub fn combine(primary: &VersionSpec, boost: &VersionSpec) -> Result<VersionSpec> {
        let mut merged = [None; 4];
        for (slot, (p, b)) in merged
            .iter_mut()
            .zip(primary.components().into_iter().zip(boost.components()))
        {
            *slot = match (p, b) {
                (p, None) => p,
                (None, b) => b,
                (Some(p), Some(b)) => Some(p.checked_add(b).ok_or_else(|| {
                    Error::invalid_version(
                        format!("{primary} + {boost}"),
                        "component overflows when boosted",
                    )
                })?),
            };
        }

        let result = Self::from_components(merged).truncated();
        if result.defined_len() < 2 {
            return Err(Error::invalid_version(
                format!("{primary} + {boost}"),
                "need at least two components in version",
            ));
        }
        Ok(result)
    }

    /// Renders the version with an optional pre-release label (`1.2.3-beta`)
    pub fn to_package_version(&self, release_label: &str) -> String {
        let label = release_label.trim();
        if label.is_empty() {
            self.to_string()
        } else {
            format!("{}-{}", self, label.trim_start_matches('-'))
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for component in self.components().into_iter().map_while(|c| c) {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{component}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for VersionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::EMPTY);
        }

        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() > 4 {
            return Err(Error::invalid_version(s, "more than four components"));
        }

        let mut components = [None; 4];
        for (slot, part) in components.iter_mut().zip(&parts) {
            let value = part
                .parse::<u32>()
                .map_err(|e| Error::invalid_version(s, format!("component '{part}': {e}")))?;
            *slot = Some(value);
        }
        Ok(Self::from_components(components))
    }
}

impl TryFrom<String> for VersionSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<VersionSpec> for String {
    fn from(value: VersionSpec) -> Self {
        value.to_string()
    }
}
