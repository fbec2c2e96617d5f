mod common;

use api::{
    config::PipelineConfig,
    error::QueryError,
    query::Query,
    sync_point::SyncPoint,
    types::{PipelineStage, QueryKind, QueueType},
};
use common::{immediate, manual, manual_with};
use sim::Command;

#[test]
fn attached_pool_resolves_into_its_targets() {
    let pipeline = manual_with(PipelineConfig {
        timestamp_pool_size: 4,
        ..PipelineConfig::inline()
    });
    let manager = pipeline.query_pools();
    let mut pool = manager.acquire(QueryKind::Timestamp, 4).unwrap();
    assert_eq!(pool.capacity(), 4);
    assert!(pool.needs_reset());

    let targets = (0..4)
        .map(|_| Query::new(QueryKind::Timestamp))
        .collect::<Vec<_>>();
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    let cb = ctx.command_buffer().unwrap();
    manager.reset(&mut pool, cb);
    for (target, value) in targets.iter().zip([11, 7, 42, 3]) {
        let slot = pool.reserve_slot(target.clone()).unwrap();
        cb.internal_mut().record(Command::WriteValue {
            pool: pool.internal().id(),
            index: slot,
            value,
        });
    }
    assert!(pool.is_full());
    ctx.attach_query_pool(pool);
    let done = ctx.submit().unwrap();

    assert!(targets.iter().all(|target| target.result().is_none()));
    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();

    let results = targets
        .iter()
        .map(|target| target.result())
        .collect::<Vec<_>>();
    assert_eq!(results, vec![Some(11), Some(7), Some(42), Some(3)]);
    assert_eq!(manager.free_count(QueryKind::Timestamp), 1);
}

#[test]
fn query_results_are_visible_to_continuations() {
    let pipeline = manual();
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    let stamp = ctx.write_timestamp(PipelineStage::BOTTOM_OF_PIPE).unwrap();
    let done = ctx.submit().unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let stamp = stamp.clone();
        done.add_continuation(move || {
            let _ = tx.send(stamp.result());
        });
    }
    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();
    assert!(rx.recv().unwrap().is_some());
}

#[test]
fn queries_resolve_before_the_sync_point_that_follows_them() {
    let pipeline = manual();
    let early = SyncPoint::new(Some("early"));
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    let stamp = ctx.write_timestamp(PipelineStage::BOTTOM_OF_PIPE).unwrap();
    let occlusion = ctx.begin_occlusion_query().unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(6);
    ctx.end_occlusion_query(&occlusion).unwrap();
    ctx.signal_sync_point(&early).unwrap();

    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let stamp = stamp.clone();
        let occlusion = occlusion.clone();
        early.add_continuation(move || {
            let _ = tx.send((stamp.result(), occlusion.result()));
        });
    }

    // Later work lands in a second payload with pools of its own.
    let late = ctx.write_timestamp(PipelineStage::BOTTOM_OF_PIPE).unwrap();
    let done = ctx.submit().unwrap();
    let payloads = pipeline.backend().submits();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].batches, 2);

    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();
    let (seen_stamp, seen_samples) = rx.recv().unwrap();
    assert!(seen_stamp.is_some());
    assert_eq!(seen_samples, Some(6));
    assert!(late.result().unwrap() > seen_stamp.unwrap());
}

#[test]
fn reserve_slot_rejects_misuse() {
    let pipeline = manual_with(PipelineConfig {
        occlusion_pool_size: 2,
        ..PipelineConfig::inline()
    });
    let manager = pipeline.query_pools();
    let mut pool = manager.acquire(QueryKind::Occlusion, 1).unwrap();

    assert!(matches!(
        pool.reserve_slot(Query::new(QueryKind::Occlusion)),
        Err(QueryError::NeedsReset)
    ));

    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    manager.reset(&mut pool, ctx.command_buffer().unwrap());
    assert!(matches!(
        pool.reserve_slot(Query::new(QueryKind::Timestamp)),
        Err(QueryError::KindMismatch {
            expected: QueryKind::Occlusion,
            found: QueryKind::Timestamp,
        })
    ));

    let targets = [
        Query::new(QueryKind::Occlusion),
        Query::new(QueryKind::Occlusion),
    ];
    assert_eq!(pool.reserve_slot(targets[0].clone()).unwrap(), 0);
    assert_eq!(pool.reserve_slot(targets[1].clone()).unwrap(), 1);
    assert!(matches!(
        pool.reserve_slot(Query::new(QueryKind::Occlusion)),
        Err(QueryError::PoolFull { capacity: 2 })
    ));

    // Nothing was written, so both destinations stay unresolved.
    ctx.attach_query_pool(pool);
    let done = ctx.submit().unwrap();
    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();
    assert!(targets.iter().all(|target| target.result().is_none()));
    assert_eq!(manager.free_count(QueryKind::Occlusion), 1);
}

#[test]
fn resolve_all_reports_unavailable_slots() {
    let pipeline = manual();
    let manager = pipeline.query_pools();
    let mut pool = manager.acquire(QueryKind::Timestamp, 2).unwrap();

    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    let cb = ctx.command_buffer().unwrap();
    manager.reset(&mut pool, cb);
    let first = pool.reserve_slot(Query::new(QueryKind::Timestamp)).unwrap();
    pool.reserve_slot(Query::new(QueryKind::Timestamp)).unwrap();
    cb.internal_mut().record(Command::WriteValue {
        pool: pool.internal().id(),
        index: first,
        value: 99,
    });
    let done = ctx.submit().unwrap();
    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();

    let results = manager.resolve_all(&mut pool).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().ok(), Some(&99));
    assert!(matches!(results[1], Err(QueryError::Unavailable { slot: 1 })));
    manager.release(pool);
}

#[test]
fn acquire_prefers_the_smallest_sufficient_pool() {
    let pipeline = manual_with(PipelineConfig {
        occlusion_pool_size: 8,
        ..PipelineConfig::inline()
    });
    let manager = pipeline.query_pools();

    let large = manager.acquire(QueryKind::Occlusion, 20).unwrap();
    assert_eq!(large.capacity(), 20);
    let small = manager.acquire(QueryKind::Occlusion, 1).unwrap();
    assert_eq!(small.capacity(), 8);
    manager.release(large);
    manager.release(small);
    assert_eq!(manager.free_count(QueryKind::Occlusion), 2);
    assert_eq!(pipeline.backend().live_query_pools(), 2);

    let reused = manager.acquire(QueryKind::Occlusion, 5).unwrap();
    assert_eq!(reused.capacity(), 8);
    manager.release(reused);

    // An exact fit is still sufficient.
    let exact = manager.acquire(QueryKind::Occlusion, 8).unwrap();
    assert_eq!(exact.capacity(), 8);
    let next = manager.acquire(QueryKind::Occlusion, 6).unwrap();
    assert_eq!(next.capacity(), 20);
    assert_eq!(manager.free_count(QueryKind::Occlusion), 0);

    // Zero is treated as one and falls back to a fresh default-sized pool.
    let fresh = manager.acquire(QueryKind::Occlusion, 0).unwrap();
    assert_eq!(fresh.capacity(), 8);
    assert_eq!(pipeline.backend().live_query_pools(), 3);

    // Kinds never share free lists.
    manager.release(exact);
    assert_eq!(manager.free_count(QueryKind::Timestamp), 0);
    manager.release(next);
    manager.release(fresh);

    // Larger than every free pool, so a new one is created.
    assert_eq!(manager.free_count(QueryKind::Occlusion), 3);
    let oversized = manager.acquire(QueryKind::Occlusion, 30).unwrap();
    assert!(oversized.capacity() >= 30);
    assert_eq!(manager.free_count(QueryKind::Occlusion), 3);
    assert_eq!(pipeline.backend().live_query_pools(), 4);

    // A pool nobody returns is destroyed with its handle.
    drop(oversized);
    assert_eq!(pipeline.backend().live_query_pools(), 3);
}

#[test]
fn idle_pools_expire_after_the_configured_frames() {
    let pipeline = manual_with(PipelineConfig {
        max_unused_pool_frames: 2,
        ..PipelineConfig::inline()
    });
    let manager = pipeline.query_pools();
    let pool = manager.acquire(QueryKind::Timestamp, 1).unwrap();
    manager.release(pool);

    assert_eq!(manager.end_frame(), 0);
    assert_eq!(manager.end_frame(), 0);
    assert_eq!(manager.free_count(QueryKind::Timestamp), 1);
    assert_eq!(manager.end_frame(), 1);
    assert_eq!(manager.free_count(QueryKind::Timestamp), 0);
    assert_eq!(pipeline.backend().live_query_pools(), 0);
}

#[test]
fn reuse_restarts_the_idle_count() {
    let pipeline = manual_with(PipelineConfig {
        max_unused_pool_frames: 1,
        ..PipelineConfig::inline()
    });
    let manager = pipeline.query_pools();
    manager.release(manager.acquire(QueryKind::Occlusion, 1).unwrap());

    assert_eq!(manager.end_frame(), 0);
    let pool = manager.acquire(QueryKind::Occlusion, 1).unwrap();
    manager.release(pool);
    assert_eq!(manager.end_frame(), 0);
    assert_eq!(manager.end_frame(), 1);
}

#[test]
fn frame_markers_age_the_free_lists() {
    let pipeline = immediate(PipelineConfig {
        max_unused_pool_frames: 2,
        ..PipelineConfig::inline()
    });
    let manager = pipeline.query_pools();
    manager.release(manager.acquire(QueryKind::Timestamp, 1).unwrap());
    assert_eq!(pipeline.backend().live_query_pools(), 1);

    pipeline.end_frame().unwrap();
    pipeline.end_frame().unwrap();
    assert_eq!(manager.free_count(QueryKind::Timestamp), 1);
    pipeline.end_frame().unwrap();
    assert_eq!(manager.free_count(QueryKind::Timestamp), 0);
    assert_eq!(pipeline.backend().live_query_pools(), 0);
}

#[test]
fn occlusion_query_counts_samples_while_active() {
    let pipeline = manual();
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(5);
    let query = ctx.begin_occlusion_query().unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(25);
    ctx.end_occlusion_query(&query).unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(3);
    let done = ctx.submit().unwrap();

    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();
    assert_eq!(query.result(), Some(25));
    assert_eq!(pipeline.query_pools().free_count(QueryKind::Occlusion), 1);
}

#[test]
fn occlusion_query_ends_with_its_payload() {
    let pipeline = manual();
    let semaphore = pipeline.create_semaphore().unwrap();
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    let query = ctx.begin_occlusion_query().unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(4);
    // Signalling closes the payload, which ends the query.
    ctx.add_signal(&semaphore).unwrap();
    ctx.command_buffer().unwrap().internal_mut().draw(50);
    let done = ctx.submit().unwrap();

    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();
    assert_eq!(query.result(), Some(4));
}

#[test]
fn timestamps_spill_into_fresh_pools() {
    let pipeline = manual_with(PipelineConfig {
        timestamp_pool_size: 2,
        ..PipelineConfig::inline()
    });
    let mut ctx = pipeline.context(QueueType::Main).unwrap();
    let mut stamps = Vec::default();
    for marker in 0..5 {
        ctx.command_buffer().unwrap().internal_mut().marker(marker);
        stamps.push(ctx.write_timestamp(PipelineStage::BOTTOM_OF_PIPE).unwrap());
    }
    let done = ctx.submit().unwrap();

    assert_eq!(pipeline.backend().submits().len(), 1);
    pipeline.backend().complete_all();
    pipeline.block_until(&done).unwrap();

    let values = stamps
        .iter()
        .map(|stamp| stamp.result().unwrap())
        .collect::<Vec<_>>();
    assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(pipeline.query_pools().free_count(QueryKind::Timestamp), 3);
    assert_eq!(pipeline.backend().markers(), vec![0, 1, 2, 3, 4]);
}
