#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use api::{config::PipelineConfig, pipeline::Pipeline, sync_point::SyncPoint};
use sim::{CompletionMode, SimBackend};

pub type SimPipeline = Pipeline<SimBackend>;

/// Both workers disabled; the device completes nothing until told to.
pub fn manual() -> SimPipeline {
    manual_with(PipelineConfig::inline())
}

pub fn manual_with(config: PipelineConfig) -> SimPipeline {
    Pipeline::new(SimBackend::new(CompletionMode::Manual), config).unwrap()
}

/// The device completes work as it is submitted.
pub fn immediate(config: PipelineConfig) -> SimPipeline {
    Pipeline::new(SimBackend::new(CompletionMode::Immediate), config).unwrap()
}

/// Records the order in which continuations fire.
#[derive(Clone, Default)]
pub struct Order(Arc<Mutex<Vec<u64>>>);

impl Order {
    pub fn track(&self, point: &SyncPoint, tag: u64) {
        let order = self.0.clone();
        point.add_continuation(move || order.lock().unwrap().push(tag));
    }

    pub fn get(&self) -> Vec<u64> {
        self.0.lock().unwrap().clone()
    }
}
