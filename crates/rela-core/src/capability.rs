// SPDX-License-Identifier: Apache-2.0

//! Capability flags reported per engine.
//!
//! Generic callers branch on these instead of on engine names.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single feature an engine may or may not offer through this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// BEGIN / COMMIT / ROLLBACK on a single connection
    Transactions,
    /// Parameters travel to the server out-of-band instead of being inlined
    NativeParameters,
    /// Results can be streamed from a server-side cursor or paged protocol
    ServerSideCursors,
    /// An in-flight statement can be aborted on the server
    Cancellation,
    /// The session time zone can be pinned to UTC at connect time
    SessionTimezone,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Transactions,
        Capability::NativeParameters,
        Capability::ServerSideCursors,
        Capability::Cancellation,
        Capability::SessionTimezone,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Transactions => "transactions",
            Capability::NativeParameters => "native_parameters",
            Capability::ServerSideCursors => "server_side_cursors",
            Capability::Cancellation => "cancellation",
            Capability::SessionTimezone => "session_timezone",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of [`Capability`] flags. Cheap to copy, usable in `const` descriptors.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub const fn without(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bit())
    }

    pub const fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, |set, c| set.with(c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let flags = Vec::<Capability>::deserialize(deserializer)?;
        Ok(flags.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let set = CapabilitySet::EMPTY
            .with(Capability::Transactions)
            .with(Capability::Cancellation);
        assert!(set.contains(Capability::Transactions));
        assert!(!set.contains(Capability::SessionTimezone));
        assert_eq!(set.len(), 2);

        let set = set.without(Capability::Transactions);
        assert!(!set.contains(Capability::Transactions));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Capability::Cancellation]);
    }

    #[test]
    fn test_serde_as_list() {
        let set: CapabilitySet = [Capability::NativeParameters, Capability::Transactions]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["transactions","native_parameters"]"#);

        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
