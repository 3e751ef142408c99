//! Sub-protocol capability pairs.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A capability advertised during the protocol handshake: the name and
/// version of a sub-protocol the node speaks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cap {
    /// Sub-protocol name.
    pub name: String,
    /// Sub-protocol version.
    pub version: u32,
}

impl Cap {
    /// Build a capability pair.
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

// Capability ordering drives message-code offset assignment during
// protocol matching: name first, then version.
impl Ord for Cap {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then(self.version.cmp(&other.version))
    }
}

impl PartialOrd for Cap {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Number of capabilities present in both lists, counting each shared
/// name/version pair once.
#[must_use]
pub fn count_matching(ours: &[Cap], theirs: &[Cap]) -> usize {
    ours.iter().filter(|c| theirs.contains(c)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_name_slash_version() {
        assert_eq!(Cap::new("mesh", 3).to_string(), "mesh/3");
    }

    #[test]
    fn ordering_is_name_then_version() {
        let mut caps = vec![
            Cap::new("sync", 2),
            Cap::new("mesh", 9),
            Cap::new("mesh", 1),
        ];
        caps.sort();
        assert_eq!(
            caps,
            vec![
                Cap::new("mesh", 1),
                Cap::new("mesh", 9),
                Cap::new("sync", 2),
            ]
        );
    }

    #[test]
    fn count_matching_requires_same_version() {
        let ours = [Cap::new("mesh", 1), Cap::new("sync", 2)];
        let theirs = [Cap::new("mesh", 1), Cap::new("sync", 3)];
        assert_eq!(count_matching(&ours, &theirs), 1);
        assert_eq!(count_matching(&ours, &[]), 0);
    }
}
