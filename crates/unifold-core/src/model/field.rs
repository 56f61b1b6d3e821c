// ── Device fields and typed field writes ──
//
// `DeviceField` names every attribute a record carries, including the
// bookkeeping ones that never leave the record. `DeviceUpdate` is a typed
// write to a single settable field; it is both what callers pass to
// `DeviceRecord::set` and what the registry broadcasts to other maps.

use std::collections::BTreeMap;

use serde_json::Value;
use strum::{Display, EnumIter, IntoEnumIterator};

use super::descriptor::{Capability, StatusMap, StatusRange, StrategyTable};

/// Every attribute of a [`DeviceRecord`](super::DeviceRecord).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceField {
    Id,
    Name,
    Category,
    ProductId,
    ProductName,
    Online,
    OnlineStates,
    Status,
    Capabilities,
    StatusRanges,
    LocalStrategy,
    ForceCompatibility,
    Preferences,
    Source,
    SourcePriority,
    Owner,
    Origin,
    CodeToId,
    IdToCode,
    StrategyVersion,
    CacheVersion,
}

/// Bookkeeping fields that stay local to one record: never mirrored to the
/// origin record and never propagated to other maps.
pub const EXCLUDED_FROM_SYNC: &[DeviceField] = &[
    DeviceField::Id,
    DeviceField::Owner,
    DeviceField::SourcePriority,
    DeviceField::Source,
    DeviceField::Origin,
    DeviceField::CodeToId,
    DeviceField::IdToCode,
    DeviceField::StrategyVersion,
    DeviceField::CacheVersion,
];

impl DeviceField {
    pub fn is_synced(self) -> bool {
        !EXCLUDED_FROM_SYNC.contains(&self)
    }

    /// Fields subject to cross-map propagation.
    pub fn synced() -> impl Iterator<Item = DeviceField> {
        Self::iter().filter(|f| f.is_synced())
    }

    /// Fields a merge must leave alone on a `force_compatibility` record.
    pub fn is_functional(self) -> bool {
        matches!(
            self,
            Self::Capabilities | Self::StatusRanges | Self::LocalStrategy
        )
    }
}

/// A typed write to one settable field.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceUpdate {
    Name(String),
    Category(String),
    ProductId(String),
    ProductName(String),
    Online(bool),
    OnlineStates(BTreeMap<String, bool>),
    Status(StatusMap),
    Capabilities(BTreeMap<String, Capability>),
    StatusRanges(BTreeMap<String, StatusRange>),
    LocalStrategy(StrategyTable),
    ForceCompatibility(bool),
    Preferences(BTreeMap<String, Value>),
    Source(String),
    SourcePriority(Option<i32>),
}

impl DeviceUpdate {
    pub fn field(&self) -> DeviceField {
        match self {
            Self::Name(_) => DeviceField::Name,
            Self::Category(_) => DeviceField::Category,
            Self::ProductId(_) => DeviceField::ProductId,
            Self::ProductName(_) => DeviceField::ProductName,
            Self::Online(_) => DeviceField::Online,
            Self::OnlineStates(_) => DeviceField::OnlineStates,
            Self::Status(_) => DeviceField::Status,
            Self::Capabilities(_) => DeviceField::Capabilities,
            Self::StatusRanges(_) => DeviceField::StatusRanges,
            Self::LocalStrategy(_) => DeviceField::LocalStrategy,
            Self::ForceCompatibility(_) => DeviceField::ForceCompatibility,
            Self::Preferences(_) => DeviceField::Preferences,
            Self::Source(_) => DeviceField::Source,
            Self::SourcePriority(_) => DeviceField::SourcePriority,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.field().is_synced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bookkeeping_fields_are_not_synced() {
        for field in EXCLUDED_FROM_SYNC {
            assert!(!field.is_synced(), "{field} should be excluded");
        }
        assert!(DeviceField::Status.is_synced());
        assert!(!DeviceUpdate::Source("cloud".into()).is_synced());
        assert!(!DeviceUpdate::SourcePriority(Some(3)).is_synced());
    }

    #[test]
    fn synced_fields_cover_every_update_kind() {
        let synced: Vec<_> = DeviceField::synced().collect();
        assert_eq!(synced.len(), 12);
        assert!(synced.contains(&DeviceField::LocalStrategy));
        assert!(!synced.contains(&DeviceField::CodeToId));
    }

    #[test]
    fn field_names_render_snake_case() {
        assert_eq!(DeviceField::LocalStrategy.to_string(), "local_strategy");
    }
}
