mod common;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use api::{
    config::PipelineConfig,
    error::{DeviceError, PipelineError},
    sync_point::SyncPoint,
    types::{PipelineStage, QueueType},
};
use common::{immediate, manual, manual_with, Order, SimPipeline};
use crossbeam_channel::RecvTimeoutError;

fn try_submit_marker(
    pipeline: &SimPipeline,
    queue: QueueType,
    marker: u64,
) -> Result<SyncPoint, PipelineError> {
    let mut ctx = pipeline.context(queue)?;
    ctx.command_buffer()?.internal_mut().marker(marker);
    ctx.submit()
}

fn submit_marker(pipeline: &SimPipeline, queue: QueueType, marker: u64) -> SyncPoint {
    try_submit_marker(pipeline, queue, marker).unwrap()
}

#[test]
fn completions_are_held_back_until_earlier_work_finishes() {
    let pipeline = manual();
    let order = Order::default();
    let first = submit_marker(&pipeline, QueueType::Main, 1);
    let second = submit_marker(&pipeline, QueueType::Main, 2);
    order.track(&first, 1);
    order.track(&second, 2);

    let tokens = pipeline.backend().pending_tokens(QueueType::Main);
    assert_eq!(tokens.len(), 2);

    // The device finishes the later submission first.
    assert!(pipeline.backend().complete(tokens[1]));
    assert!(!pipeline.process_completions().unwrap());
    assert!(!second.is_complete());
    assert!(order.get().is_empty());

    assert!(pipeline.backend().complete(tokens[0]));
    assert!(pipeline.process_completions().unwrap());
    assert!(first.is_complete());
    assert!(second.is_complete());
    assert_eq!(order.get(), vec![1, 2]);
}

#[test]
fn queues_complete_independently() {
    let pipeline = manual();
    let main = submit_marker(&pipeline, QueueType::Main, 1);
    let compute = submit_marker(&pipeline, QueueType::Compute, 2);

    pipeline.backend().complete_next(QueueType::Compute).unwrap();
    assert!(pipeline.process_completions().unwrap());
    assert!(compute.is_complete());
    assert!(!main.is_complete());
    assert!(pipeline.wait_for_any(Duration::from_millis(1)).is_ok());

    // Shutdown on drop waits for the main queue too.
    pipeline.backend().complete_all();
    pipeline.block_until(&main).unwrap();
}

#[test]
fn workers_and_inline_processing_agree() {
    let run = |config: PipelineConfig| {
        let pipeline = immediate(config);
        let order = Order::default();
        let mut last = None;
        for marker in 0..5 {
            let point = submit_marker(&pipeline, QueueType::Main, marker);
            order.track(&point, marker);
            last = Some(point);
        }
        if let Some(point) = last {
            pipeline.block_until(&point).unwrap();
        }
        pipeline.shutdown().unwrap();
        (pipeline.backend().markers(), order.get())
    };

    let inline = run(PipelineConfig::inline());
    let threaded = run(PipelineConfig::default());
    assert_eq!(inline.0, vec![0, 1, 2, 3, 4]);
    assert_eq!(inline, threaded);
}

#[test]
fn shutdown_drains_outstanding_work() {
    let pipeline = manual_with(PipelineConfig::default());
    let points = (0..4)
        .map(|marker| {
            let queue = if marker % 2 == 0 {
                QueueType::Main
            } else {
                QueueType::Transfer
            };
            submit_marker(&pipeline, queue, marker)
        })
        .collect::<Vec<_>>();

    let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
    thread::scope(|scope| {
        let backend = pipeline.backend();
        scope.spawn(move || loop {
            backend.complete_all();
            match stopped.recv_timeout(Duration::from_millis(1)) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });

        pipeline.shutdown().unwrap();
        drop(stop);
    });

    assert!(points.iter().all(|point| point.is_complete()));
    let mut markers = pipeline.backend().markers();
    markers.sort_unstable();
    assert_eq!(markers, vec![0, 1, 2, 3]);
    assert_eq!(pipeline.backend().live_command_buffers(), 0);
    assert_eq!(pipeline.backend().live_query_pools(), 0);

    assert!(matches!(
        pipeline.context(QueueType::Main),
        Err(PipelineError::ShutDown)
    ));
    assert!(matches!(pipeline.end_frame(), Err(PipelineError::ShutDown)));
    assert!(pipeline.shutdown().is_ok());
}

#[test]
fn work_accepted_during_shutdown_is_drained() {
    const PRODUCERS: u64 = 4;

    let pipeline = immediate(PipelineConfig::default());
    let accepted = Mutex::new(Vec::default());
    thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let (pipeline, accepted) = (&pipeline, &accepted);
            scope.spawn(move || {
                for i in 0.. {
                    match try_submit_marker(pipeline, QueueType::Main, producer * 100_000 + i) {
                        Ok(point) => accepted.lock().unwrap().push(point),
                        Err(PipelineError::ShutDown) => break,
                        Err(err) => panic!("producer {producer} failed: {err}"),
                    }
                }
            });
        }

        thread::sleep(Duration::from_millis(10));
        pipeline.shutdown().unwrap();
    });

    let accepted = accepted.into_inner().unwrap();
    assert!(!accepted.is_empty());
    assert!(accepted.iter().all(|point| point.is_complete()));
    assert_eq!(pipeline.backend().markers().len(), accepted.len());
}

#[test]
fn failed_submit_latches_device_loss() {
    let pipeline = manual();
    let point = SyncPoint::new(Some("lost"));
    pipeline.backend().fail_next_submit();

    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    ctx.command_buffer().unwrap().internal_mut().marker(1);
    ctx.signal_sync_point(&point).unwrap();
    assert!(matches!(
        ctx.submit(),
        Err(PipelineError::Device(DeviceError::Lost(_)))
    ));

    assert!(pipeline.is_device_lost());
    assert!(matches!(
        pipeline.context(QueueType::Main),
        Err(PipelineError::DeviceLost)
    ));
    assert!(matches!(
        pipeline.process_submissions(),
        Err(PipelineError::DeviceLost)
    ));
    assert!(matches!(
        pipeline.block_until(&point),
        Err(PipelineError::DeviceLost)
    ));
    assert!(!point.is_complete());

    // Nothing can complete on a lost device, so shutdown releases the waiters.
    assert!(matches!(pipeline.shutdown(), Err(PipelineError::DeviceLost)));
    assert!(point.is_complete());
    assert_eq!(pipeline.backend().live_command_buffers(), 0);
}

#[test]
fn failed_readback_still_releases_the_payload() {
    let pipeline = manual();
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    ctx.command_buffer().unwrap().internal_mut().marker(1);
    let stamp = ctx.write_timestamp(PipelineStage::BOTTOM_OF_PIPE).unwrap();
    let done = ctx.submit().unwrap();

    pipeline.backend().complete_all();
    pipeline.backend().fail_next_readback();
    assert!(matches!(
        pipeline.block_until(&done),
        Err(PipelineError::Device(DeviceError::Lost(_)))
    ));
    assert!(done.is_complete());
    assert!(stamp.result().is_none());

    assert!(matches!(pipeline.shutdown(), Err(PipelineError::DeviceLost)));
    assert_eq!(pipeline.backend().live_command_buffers(), 0);
    assert_eq!(pipeline.backend().live_query_pools(), 0);
}

#[test]
fn device_loss_while_blocked_is_reported() {
    let pipeline = manual();
    let point = submit_marker(&pipeline, QueueType::Main, 1);

    thread::scope(|scope| {
        let backend = pipeline.backend();
        scope.spawn(move || {
            thread::sleep(Duration::from_millis(20));
            backend.lose_device("hung");
        });
        assert!(matches!(
            pipeline.block_until(&point),
            Err(PipelineError::Device(DeviceError::Lost(_)))
        ));
    });

    assert!(matches!(
        pipeline.block_until(&point),
        Err(PipelineError::DeviceLost)
    ));
    assert!(pipeline.shutdown().is_err());
    assert!(point.is_complete());
}

#[test]
fn end_of_pipe_task_waits_for_every_queue() {
    let pipeline = manual();
    submit_marker(&pipeline, QueueType::Main, 1);
    submit_marker(&pipeline, QueueType::Compute, 2);

    let ran = Arc::new(AtomicBool::new(false));
    let done = {
        let ran = ran.clone();
        pipeline
            .enqueue_end_of_pipe(move || ran.store(true, Ordering::SeqCst))
            .unwrap()
    };

    // Main and its marker finish, compute is still busy.
    while pipeline.backend().complete_next(QueueType::Main).is_some() {}
    pipeline.process_completions().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!done.is_complete());

    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(pipeline.backend().markers(), vec![1, 2]);
}

#[test]
fn payload_timing_reports_gpu_duration() {
    let pipeline = manual_with(PipelineConfig {
        payload_timing: true,
        ..PipelineConfig::inline()
    });
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(100);
    let done = ctx.submit().unwrap();
    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();

    let timings = pipeline.take_gpu_timings();
    assert_eq!(timings.len(), 1);
    assert_eq!(timings[0].queue, QueueType::Main);
    assert!(timings[0].duration >= Duration::from_nanos(100));
    assert!(pipeline.take_gpu_timings().is_empty());
}

#[test]
fn producers_keep_their_own_order() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 10;

    let pipeline = immediate(PipelineConfig::default());
    thread::scope(|scope| {
        for producer in 0..THREADS {
            let pipeline = &pipeline;
            scope.spawn(move || {
                let mut last = None;
                for i in 0..PER_THREAD {
                    last = Some(submit_marker(pipeline, QueueType::Main, producer * 100 + i));
                }
                if let Some(point) = last {
                    pipeline.block_until(&point).unwrap();
                }
            });
        }
    });

    let markers = pipeline.backend().markers();
    assert_eq!(markers.len() as u64, THREADS * PER_THREAD);
    for producer in 0..THREADS {
        let own = markers
            .iter()
            .filter(|marker| *marker / 100 == producer)
            .map(|marker| marker % 100)
            .collect::<Vec<_>>();
        assert_eq!(own, (0..PER_THREAD).collect::<Vec<_>>());
    }
}

#[test]
fn frame_markers_fall_back_to_the_first_queue() {
    let pipeline = api::pipeline::Pipeline::new(
        sim::SimBackend::with_queues(sim::CompletionMode::Immediate, &[QueueType::Compute]),
        PipelineConfig::inline(),
    )
    .unwrap();

    // Frame markers fall back to the first queue the device exposes.
    pipeline.end_frame().unwrap();
    let submits = pipeline.backend().submits();
    assert_eq!(submits.len(), 1);
    assert_eq!(submits[0].queue, QueueType::Compute);

    assert!(matches!(
        pipeline.context(QueueType::Main),
        Err(PipelineError::UnsupportedQueue(QueueType::Main))
    ));
}
