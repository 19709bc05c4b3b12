//! Randomized lane schedules over the three-stage hand-off pattern

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uniseq_runtime::*;

/// Three-stage chain: input lane doubles, compute lane adds one, output lane
/// collects by chunk index.
fn run_chain(lanes: &LaneSet, chunks: usize, audit: &Arc<BufferAudit>) -> Vec<u64> {
    let mut input: BufferPool<u64> = BufferPool::new("input", chunks, Arc::clone(audit));
    let mut output: BufferPool<u64> = BufferPool::new("output", chunks, Arc::clone(audit));
    let results = Arc::new(Mutex::new(vec![None; chunks]));

    for i in 0..chunks {
        let writer = input.writer(i).unwrap();
        lanes
            .input()
            .enqueue("produce", move || {
                writer.put(i as u64 * 2);
                Ok(())
            })
            .unwrap();
        let token = lanes.input().record().unwrap();
        input.publish(i, token).unwrap();
    }

    for i in 0..chunks {
        let reader = input.reader(i).unwrap();
        lanes.compute().wait(reader.token()).unwrap();
        let writer = output.writer(i).unwrap();
        lanes
            .compute()
            .enqueue("compute", move || {
                writer.put(reader.take()? + 1);
                Ok(())
            })
            .unwrap();
        let token = lanes.compute().record().unwrap();
        output.publish(i, token).unwrap();
        input.release(i).unwrap();
    }

    for i in 0..chunks {
        let reader = output.reader(i).unwrap();
        lanes.output().wait(reader.token()).unwrap();
        let results = Arc::clone(&results);
        lanes
            .output()
            .enqueue("collect", move || {
                results.lock()[i] = Some(reader.take()?);
                Ok(())
            })
            .unwrap();
        output.release(i).unwrap();
    }

    lanes.synchronize_all().unwrap();
    let collected = results.lock().iter().map(|v| v.unwrap()).collect();
    collected
}

#[test]
fn randomized_schedules_never_violate_hand_off() {
    for seed in 0..12u64 {
        let lanes = LaneSet::with_options(LaneOptions::jittered(Duration::from_micros(300), seed)).unwrap();
        let audit = BufferAudit::new();
        let values = run_chain(&lanes, 6, &audit);

        assert_eq!(values, (0..6u64).map(|i| i * 2 + 1).collect::<Vec<_>>(), "seed {}", seed);
        assert!(audit.is_clean(), "seed {} violations {}", seed, audit.violations());
    }
}

#[test]
fn missing_wait_is_detected() {
    let lanes = LaneSet::new().unwrap();
    let audit = BufferAudit::new();
    let mut pool: BufferPool<u64> = BufferPool::new("input", 1, Arc::clone(&audit));

    // Producer is held back by a gate, so its token cannot be ready
    let gate = CompletionToken::pending();
    lanes.input().wait(&gate).unwrap();
    lanes.input().enqueue("noop", || Ok(())).unwrap();
    let token = lanes.input().record().unwrap();

    pool.writer(0).unwrap().put(42);
    pool.publish(0, token).unwrap();

    // Consumer skips the wait on the producer token
    let reader = pool.reader(0).unwrap();
    lanes
        .compute()
        .enqueue("unsynchronized read", move || reader.take().map(|_| ()))
        .unwrap();
    lanes.compute().synchronize().unwrap();

    assert_eq!(audit.early_reads(), 1);
    gate.signal();
    lanes.synchronize_all().unwrap();
}
