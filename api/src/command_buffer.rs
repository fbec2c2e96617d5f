use crate::{error::DeviceError, Backend};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Open for recording.
    Recording,
    /// Closed. Nothing more may be recorded until the buffer is recycled.
    Ended,
}

/// A native command buffer owned by exactly one payload at a time.
pub struct CommandBuffer<B: Backend> {
    pub(crate) raw: B::CommandBuffer,
    state: CommandBufferState,
    serial: u64,
}

impl<B: Backend> CommandBuffer<B> {
    /// Begins `raw` for recording. `serial` is the order the owning context opened it in.
    pub(crate) fn begin(
        backend: &B,
        mut raw: B::CommandBuffer,
        serial: u64,
    ) -> Result<Self, (B::CommandBuffer, DeviceError)> {
        match unsafe { backend.begin_command_buffer(&mut raw) } {
            Ok(()) => Ok(Self {
                raw,
                state: CommandBufferState::Recording,
                serial,
            }),
            Err(err) => Err((raw, err)),
        }
    }

    pub(crate) fn end(&mut self, backend: &B) -> Result<(), DeviceError> {
        if self.state == CommandBufferState::Recording {
            unsafe { backend.end_command_buffer(&mut self.raw)? };
            self.state = CommandBufferState::Ended;
        }
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn into_raw(self) -> B::CommandBuffer {
        self.raw
    }

    #[inline(always)]
    pub fn internal(&self) -> &B::CommandBuffer {
        &self.raw
    }

    /// Native handle for backend-specific encoding.
    #[inline(always)]
    pub fn internal_mut(&mut self) -> &mut B::CommandBuffer {
        &mut self.raw
    }

    #[inline(always)]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    #[inline(always)]
    pub fn is_recording(&self) -> bool {
        self.state == CommandBufferState::Recording
    }

    #[inline(always)]
    pub fn serial(&self) -> u64 {
        self.serial
    }
}
