use enum_map::{enum_map, Enum, EnumMap};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// The kinds of collection, from cheapest to most thorough.
#[repr(u32)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enum, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum GcType {
    /// Only objects allocated since the last collection.
    Sticky,
    /// Every space except the long-lived ones.
    Partial,
    /// The whole heap except spaces that are never collected.
    Full,
}

impl GcType {
    pub fn from_u32(value: u32) -> Option<GcType> {
        match value {
            0 => Some(GcType::Sticky),
            1 => Some(GcType::Partial),
            2 => Some(GcType::Full),
            _ => None,
        }
    }

    /// The next kind to try when a collection of this kind did not free enough memory.
    pub fn escalation(self) -> Option<GcType> {
        match self {
            GcType::Sticky => Some(GcType::Partial),
            GcType::Partial => Some(GcType::Full),
            GcType::Full => None,
        }
    }

    pub fn config(self) -> &'static CollectorConfig {
        &COLLECTOR_CONFIGS[self]
    }
}

/// How a kind of collection treats the spaces of the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CollectorConfig {
    pub gc_type: GcType,
    /// Spaces with [`GcRetentionPolicy::FullCollect`] keep their objects and join the immune
    /// range.
    pub retains_long_lived_spaces: bool,
    /// Every continuous space has its mark bitmap bound to its live bitmap, so only objects
    /// allocated since the last collection can be found dead.
    pub binds_all_spaces: bool,
}

impl CollectorConfig {
    /// Whether a space with `policy` keeps all its objects in this kind of collection.
    pub fn is_bound(&self, policy: GcRetentionPolicy) -> bool {
        match policy {
            GcRetentionPolicy::NeverCollect => true,
            GcRetentionPolicy::FullCollect => self.retains_long_lived_spaces || self.binds_all_spaces,
            GcRetentionPolicy::AlwaysCollect => self.binds_all_spaces,
        }
    }

    /// Whether a space with `policy` is part of the immune range.
    pub fn is_immune(&self, policy: GcRetentionPolicy) -> bool {
        match policy {
            GcRetentionPolicy::NeverCollect => true,
            GcRetentionPolicy::FullCollect => self.retains_long_lived_spaces,
            GcRetentionPolicy::AlwaysCollect => false,
        }
    }
}

lazy_static! {
    pub static ref COLLECTOR_CONFIGS: EnumMap<GcType, CollectorConfig> = enum_map! {
        GcType::Sticky => CollectorConfig {
            gc_type: GcType::Sticky,
            retains_long_lived_spaces: true,
            binds_all_spaces: true,
        },
        GcType::Partial => CollectorConfig {
            gc_type: GcType::Partial,
            retains_long_lived_spaces: true,
            binds_all_spaces: false,
        },
        GcType::Full => CollectorConfig {
            gc_type: GcType::Full,
            retains_long_lived_spaces: false,
            binds_all_spaces: false,
        },
    };
}

/// When the objects of a space may be reclaimed.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum GcRetentionPolicy {
    /// Boot-image-like spaces. Objects are never reclaimed.
    NeverCollect,
    /// Collected by every collection except sticky ones.
    AlwaysCollect,
    /// Long-lived spaces, only collected by full collections.
    FullCollect,
}

impl GcRetentionPolicy {
    pub fn from_u8(value: u8) -> Option<GcRetentionPolicy> {
        match value {
            0 => Some(GcRetentionPolicy::NeverCollect),
            1 => Some(GcRetentionPolicy::AlwaysCollect),
            2 => Some(GcRetentionPolicy::FullCollect),
            _ => None,
        }
    }
}
