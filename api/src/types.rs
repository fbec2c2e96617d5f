use bitflags::bitflags;

/// An independent hardware execution lane.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueType {
    Main,
    Compute,
    Transfer,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Main, QueueType::Compute, QueueType::Transfer];

    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        match self {
            QueueType::Main => 0,
            QueueType::Compute => 1,
            QueueType::Transfer => 2,
        }
    }
}

bitflags! {
    /// Pipeline stages a wait applies at, or a timestamp is written after.
    pub struct PipelineStage: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
        const ALL_COMMANDS = 1 << 11;
    }
}

/// Kind of counters held by a query pool. Pools never mix kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Occlusion,
    Timestamp,
}

impl QueryKind {
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        match self {
            QueryKind::Occlusion => 0,
            QueryKind::Timestamp => 1,
        }
    }
}

/// One slot as read back from the device.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct QueryReadback {
    pub value: u64,
    /// `false` when the device never wrote the slot since its last reset.
    pub available: bool,
}
