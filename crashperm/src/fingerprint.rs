//! Order-sensitive identity of a crash state, used to avoid handing out the same state twice.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use serde::Serialize;

/// The absolute log positions of a crash state's writes, in crash-state order.
///
/// Equality compares the full sequence. `Hash` only feeds [`Fingerprint::mix`]
/// to the hasher, so sets built on it still fall back to full equality on a
/// bucket hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(Vec<usize>);

impl Fingerprint {
    pub fn new(positions: Vec<usize>) -> Self {
        Fingerprint(positions)
    }

    pub fn positions(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold the positions into a seed that starts at the sequence length.
    pub fn mix(&self) -> u64 {
        self.0.iter().fold(self.0.len() as u64, |seed, &pos| {
            seed ^ (pos as u64)
                .wrapping_add(0x9e37_79b9)
                .wrapping_add(seed << 6)
                .wrapping_add(seed >> 2)
        })
    }
}

impl FromIterator<usize> for Fingerprint {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Fingerprint(iter.into_iter().collect())
    }
}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.mix());
    }
}

/// Fingerprints already handed out by one permuter.
#[derive(Debug, Default)]
pub struct FingerprintSet {
    seen: HashSet<Fingerprint>,
}

impl FingerprintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Returns false if the fingerprint was already present.
    pub fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        self.seen.insert(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.seen.iter()
    }
}
