use strum_macros::{Display, EnumIter};

/// The phases of one collection cycle, in the order a cycle visits them.
///
/// Stored in shared memory as a 4-byte value, so both processes must agree on the discriminants.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GcPhase {
    None = 0,
    PreInit,
    Init,
    RootMark,
    RootConcMark,
    PreConcRootMark,
    ConcMark,
    MarkRecursive,
    MarkReachables,
    Finish,
}

static_assertions::assert_eq_size!(GcPhase, u32);

impl GcPhase {
    pub const ALL: [GcPhase; 10] = [
        GcPhase::None,
        GcPhase::PreInit,
        GcPhase::Init,
        GcPhase::RootMark,
        GcPhase::RootConcMark,
        GcPhase::PreConcRootMark,
        GcPhase::ConcMark,
        GcPhase::MarkRecursive,
        GcPhase::MarkReachables,
        GcPhase::Finish,
    ];

    /// The only phase that may follow this one.
    pub fn next(self) -> GcPhase {
        match self {
            GcPhase::None => GcPhase::PreInit,
            GcPhase::PreInit => GcPhase::Init,
            GcPhase::Init => GcPhase::RootMark,
            GcPhase::RootMark => GcPhase::RootConcMark,
            GcPhase::RootConcMark => GcPhase::PreConcRootMark,
            GcPhase::PreConcRootMark => GcPhase::ConcMark,
            GcPhase::ConcMark => GcPhase::MarkRecursive,
            GcPhase::MarkRecursive => GcPhase::MarkReachables,
            GcPhase::MarkReachables => GcPhase::Finish,
            GcPhase::Finish => GcPhase::None,
        }
    }

    pub fn from_u32(value: u32) -> Option<GcPhase> {
        Self::ALL.get(value as usize).copied()
    }

    /// Decode a phase read from shared memory. An unknown value means the record is corrupt.
    pub fn from_shared(value: u32) -> GcPhase {
        Self::from_u32(value).unwrap_or_else(|| fatal!("Invalid GC phase {} in shared memory", value))
    }
}
