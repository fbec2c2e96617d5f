/// Work recorded into a simulated command buffer. Executed when the owning submission
/// completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// Appends the value to the device's execution log.
    Marker(u64),
    /// Rasterizes `samples` passing samples. Counted by every active occlusion query.
    Draw { samples: u64 },
    ResetQueries { pool: u64, first: u32, count: u32 },
    BeginQuery { pool: u64, index: u32 },
    EndQuery { pool: u64, index: u32 },
    WriteTimestamp { pool: u64, index: u32 },
    /// Writes `value` straight into a query slot.
    WriteValue { pool: u64, index: u32, value: u64 },
}

pub struct SimCommandBuffer {
    pub(crate) id: u64,
    pub(crate) commands: Vec<Command>,
    pub(crate) recording: bool,
}

impl SimCommandBuffer {
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline(always)]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Records `command`. Recording into a closed buffer is a usage error.
    pub fn record(&mut self, command: Command) {
        debug_assert!(self.recording, "recorded into a closed command buffer");
        self.commands.push(command);
    }

    #[inline(always)]
    pub fn marker(&mut self, value: u64) {
        self.record(Command::Marker(value));
    }

    #[inline(always)]
    pub fn draw(&mut self, samples: u64) {
        self.record(Command::Draw { samples });
    }
}
