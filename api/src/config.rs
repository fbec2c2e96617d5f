use std::time::Duration;

use log::warn;

/// Settings for [`Pipeline::new`](crate::pipeline::Pipeline::new).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run submission on a dedicated thread. When `false`, enqueueing submits inline.
    pub submission_thread: bool,
    /// Run completion on a dedicated thread. When `false`, completion is pumped by whichever
    /// thread needs progress.
    pub interrupt_thread: bool,
    /// Upper bound on any single device wait or worker sleep.
    pub wait_timeout: Duration,
    /// Maximum number of payloads coalesced into one native submit.
    pub max_payloads_per_submit: usize,
    pub occlusion_pool_size: u32,
    pub timestamp_pool_size: u32,
    /// Free query pools idle for more than this many frames are destroyed.
    pub max_unused_pool_frames: u32,
    /// Bracket every payload with timestamps and collect its GPU duration.
    pub payload_timing: bool,
}

impl Default for PipelineConfig {
    #[inline(always)]
    fn default() -> Self {
        Self {
            submission_thread: true,
            interrupt_thread: true,
            wait_timeout: Duration::from_millis(10),
            max_payloads_per_submit: 32,
            occlusion_pool_size: 256,
            timestamp_pool_size: 128,
            max_unused_pool_frames: 10,
            payload_timing: false,
        }
    }
}

impl PipelineConfig {
    /// Configuration with both workers disabled. Every operation makes progress on the
    /// calling thread.
    pub fn inline() -> Self {
        Self {
            submission_thread: false,
            interrupt_thread: false,
            ..Default::default()
        }
    }

    /// Defaults overridden by `GPU_PIPE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = parse_flag(&lookup, "GPU_PIPE_SUBMISSION_THREAD") {
            self.submission_thread = value;
        }
        if let Some(value) = parse_flag(&lookup, "GPU_PIPE_INTERRUPT_THREAD") {
            self.interrupt_thread = value;
        }
        if let Some(value) = parse_flag(&lookup, "GPU_PIPE_PAYLOAD_TIMING") {
            self.payload_timing = value;
        }
        if let Some(raw) = lookup("GPU_PIPE_WAIT_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.wait_timeout = Duration::from_millis(ms),
                _ => warn!("ignoring GPU_PIPE_WAIT_TIMEOUT_MS={raw:?}: expected a positive integer"),
            }
        }
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => {
            warn!("ignoring {key}={raw:?}: expected 0 or 1");
            None
        }
    }
}
