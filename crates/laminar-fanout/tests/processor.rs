//! End-to-end tests for the partitioned processor.
//!
//! Every test drives real lane and coordinator threads. Callbacks record into
//! a shared log so ordering across lanes and checkpoints can be asserted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use laminar_fanout::event::row;
use laminar_fanout::{
    CallbackError, ChangeEvent, ChangeKind, FanoutConfig, FanoutError, FieldKeySelector,
    HashPartitioner, KeyVector, PartitionedProcessor,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
enum Record {
    Batch { lane: usize, events: Vec<ChangeEvent> },
    Flush(ChangeEvent),
}

type Hook = Box<dyn Fn(&[ChangeEvent]) -> Result<(), CallbackError> + Send + Sync>;

struct Harness {
    processor: PartitionedProcessor,
    log: Arc<Mutex<Vec<Record>>>,
    errors: Arc<Mutex<Vec<(String, String)>>>,
}

fn config(lanes: usize, batch_size: usize) -> FanoutConfig {
    FanoutConfig::builder()
        .lane_count(lanes)
        .batch_size(batch_size)
        .poll_timeout(POLL)
        .shutdown_grace(Duration::from_secs(2))
        .name("test")
        .build()
        .unwrap()
}

/// Routes keys "A", "B", "C"... to lanes 0, 1, 2... (mod lane count).
fn letter_partitioner(lanes: usize, _event: &ChangeEvent, key: &KeyVector) -> Option<usize> {
    key.first()
        .and_then(Value::as_str)
        .and_then(|s| s.bytes().next())
        .map(|b| usize::from(b - b'A') % lanes)
}

fn current_lane() -> usize {
    thread::current()
        .name()
        .and_then(|name| name.rsplit('-').next())
        .and_then(|lane| lane.parse().ok())
        .expect("batch processor runs on a lane thread")
}

fn harness(lanes: usize, batch_size: usize) -> Harness {
    harness_with(
        lanes,
        batch_size,
        Box::new(|_: &[ChangeEvent]| -> Result<(), CallbackError> { Ok(()) }),
    )
}

fn harness_with(lanes: usize, batch_size: usize, hook: Hook) -> Harness {
    let log = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));

    let batch_log = Arc::clone(&log);
    let flush_log = Arc::clone(&log);
    let error_log = Arc::clone(&errors);

    let processor = PartitionedProcessor::builder(config(lanes, batch_size))
        .key_selector(FieldKeySelector::new(["id"]))
        .partitioner(letter_partitioner)
        .batch_processor(move |events: Vec<ChangeEvent>| -> Result<(), CallbackError> {
            hook(events.as_slice())?;
            batch_log.lock().push(Record::Batch {
                lane: current_lane(),
                events,
            });
            Ok(())
        })
        .offset_flusher(move |event: &ChangeEvent| -> Result<(), CallbackError> {
            flush_log.lock().push(Record::Flush(event.clone()));
            Ok(())
        })
        .error_handler(move |error: &FanoutError, context: &str| {
            error_log.lock().push((error.to_string(), context.to_string()));
        })
        .build()
        .unwrap();
    processor.start().unwrap();

    Harness {
        processor,
        log,
        errors,
    }
}

impl Harness {
    fn batches(&self) -> Vec<(usize, Vec<ChangeEvent>)> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Batch { lane, events } => Some((*lane, events.clone())),
                Record::Flush(_) => None,
            })
            .collect()
    }

    fn lane_events(&self, lane: usize) -> Vec<ChangeEvent> {
        self.batches()
            .into_iter()
            .filter(|(l, _)| *l == lane)
            .flat_map(|(_, events)| events)
            .collect()
    }

    fn processed(&self) -> usize {
        self.batches().iter().map(|(_, events)| events.len()).sum()
    }

    fn flushes(&self) -> Vec<ChangeEvent> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Flush(event) => Some(event.clone()),
                Record::Batch { .. } => None,
            })
            .collect()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn insert(key: &str, n: i64) -> ChangeEvent {
    ChangeEvent::insert(row([("id", json!(key)), ("n", json!(n))]))
}

fn delete(key: &str, n: i64) -> ChangeEvent {
    ChangeEvent::delete(row([("id", json!(key)), ("n", json!(n))]))
}

fn key_of(event: &ChangeEvent) -> &str {
    event
        .after_row()
        .or(event.before_row())
        .and_then(|r| r["id"].as_str())
        .unwrap_or("")
}

// ── Scenario: three lanes, synchronous batch ──

#[test]
fn test_three_lane_synchronous_batch() {
    let h = harness(3, 2);
    let events = vec![insert("A", 1), insert("B", 2), delete("A", 3)];

    let outcome = h.processor.submit(events, true).unwrap();
    assert_eq!(outcome.accepted, 3);
    assert!(!outcome.stopped_early);

    // Synchronous submit returns only after every lane processed its share.
    assert_eq!(h.processed(), 3);
    let lane0 = h.lane_events(0);
    assert_eq!(lane0.len(), 2);
    assert_eq!(lane0[0].kind, ChangeKind::Insert);
    assert_eq!(lane0[1].kind, ChangeKind::Delete);
    assert!(lane0.iter().all(|e| key_of(e) == "A"));
    let lane1 = h.lane_events(1);
    assert_eq!(lane1.len(), 1);
    assert_eq!(key_of(&lane1[0]), "B");
    assert!(h.lane_events(2).is_empty());

    wait_until(|| h.flushes().len() == 1);
    let flushes = h.flushes();
    let reference = &flushes[0];
    assert_eq!(reference.kind, ChangeKind::Delete);
    assert_eq!(key_of(reference), "A");
    assert_eq!(reference.seq, 3);

    let metrics = h.processor.metrics();
    assert_eq!(metrics.events_submitted, 3);
    assert_eq!(metrics.watermarks, 1);
    assert_eq!(metrics.barriers, 1);
    h.processor.stop();
}

// ── Scenario: update that changes the partition key ──

#[test]
fn test_key_changing_update_routes_by_before_row() {
    let h = harness(3, 4);
    let update = ChangeEvent::update(
        row([("id", json!("A")), ("v", json!(1))]),
        row([("id", json!("C")), ("v", json!(2))]),
    );

    h.processor.submit(vec![update.clone()], false).unwrap();
    assert_eq!(h.processor.metrics().barriers, 1);

    wait_until(|| h.processed() == 1);
    let lane0 = h.lane_events(0);
    assert_eq!(lane0.len(), 1);
    assert_eq!(lane0[0].before, update.before);
    assert_eq!(lane0[0].after, update.after);
    assert!(h.lane_events(2).is_empty());
    h.processor.stop();
}

#[test]
fn test_key_changing_update_waits_for_earlier_events_on_other_lanes() {
    let h = harness_with(
        3,
        4,
        Box::new(|events: &[ChangeEvent]| -> Result<(), CallbackError> {
            // Lane 1 lags behind the others.
            if events.iter().any(|e| key_of(e) == "B") {
                thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        }),
    );
    let update = ChangeEvent::update(row([("id", json!("A"))]), row([("id", json!("C"))]));
    let events = vec![
        insert("B", 1),
        insert("B", 2),
        insert("C", 3),
        insert("B", 4),
        update,
    ];

    h.processor.submit(events, false).unwrap();
    wait_until(|| h.processed() == 5);

    let batches = h.batches();
    let update_index = batches
        .iter()
        .position(|(_, events)| events.iter().any(|e| e.kind == ChangeKind::Update))
        .unwrap();
    let (update_lane, _) = &batches[update_index];
    assert_eq!(*update_lane, 0);
    let last_insert = batches
        .iter()
        .rposition(|(_, events)| events.iter().any(|e| e.kind == ChangeKind::Insert))
        .unwrap();
    assert!(
        last_insert < update_index,
        "update processed before earlier inserts: {batches:?}"
    );
    h.processor.stop();
}

#[test]
fn test_same_key_update_routes_by_after_row_without_barrier() {
    let h = harness(3, 4);
    let update = ChangeEvent::update(
        row([("id", json!("B")), ("v", json!(1))]),
        row([("id", json!("B")), ("v", json!(2))]),
    );

    h.processor.submit(vec![update], false).unwrap();
    assert_eq!(h.processor.metrics().barriers, 0);

    wait_until(|| h.processed() == 1);
    assert_eq!(h.lane_events(1).len(), 1);
    h.processor.stop();
}

#[test]
fn test_update_missing_before_image_is_not_fenced() {
    let h = harness(3, 4);
    let update = ChangeEvent::update(Default::default(), row([("id", json!("C"))]));

    h.processor.submit(vec![update], false).unwrap();
    assert_eq!(h.processor.metrics().barriers, 0);

    wait_until(|| h.processed() == 1);
    assert_eq!(h.lane_events(2).len(), 1);
    h.processor.stop();
}

// ── Scenario: schema change among row changes ──

#[test]
fn test_ddl_is_fenced_and_routed_to_lane_zero() {
    let h = harness(3, 4);
    let events = vec![
        insert("B", 1),
        ChangeEvent::ddl().with_table("public.users"),
        insert("C", 2),
    ];

    h.processor.submit(events, true).unwrap();
    assert_eq!(h.processor.metrics().barriers, 2);

    let ddl_lane: Vec<_> = h
        .lane_events(0)
        .into_iter()
        .filter(|e| e.kind == ChangeKind::Ddl)
        .collect();
    assert_eq!(ddl_lane.len(), 1);

    // Lane 0 cannot pass the barrier before lane 1 has processed "B".
    let batches = h.batches();
    let b_index = batches
        .iter()
        .position(|(_, events)| events.iter().any(|e| key_of(e) == "B"))
        .unwrap();
    let ddl_index = batches
        .iter()
        .position(|(_, events)| events.iter().any(|e| e.kind == ChangeKind::Ddl))
        .unwrap();
    assert!(b_index < ddl_index);
    h.processor.stop();
}

#[test]
fn test_heartbeat_is_fenced_like_ddl() {
    let h = harness(3, 4);
    let events = vec![insert("C", 1), ChangeEvent::heartbeat(), insert("B", 2)];

    h.processor.submit(events, true).unwrap();
    assert_eq!(h.processor.metrics().barriers, 2);

    let lane0 = h.lane_events(0);
    assert_eq!(lane0.len(), 1);
    assert_eq!(lane0[0].kind, ChangeKind::Heartbeat);
    assert_eq!(lane0[0].seq, 2);

    let batches = h.batches();
    let c_index = batches
        .iter()
        .position(|(_, events)| events.iter().any(|e| key_of(e) == "C"))
        .unwrap();
    let heartbeat_index = batches
        .iter()
        .position(|(_, events)| events.iter().any(|e| e.kind == ChangeKind::Heartbeat))
        .unwrap();
    assert!(c_index < heartbeat_index);
    h.processor.stop();
}

// ── Ordering ──

#[test]
fn test_fifo_per_lane() {
    let h = harness(4, 8);
    let keys = ["A", "B", "C", "D"];
    for chunk in 0..10 {
        let events = (0..20)
            .map(|i| insert(keys[i % keys.len()], (chunk * 20 + i) as i64))
            .collect();
        h.processor.submit(events, false).unwrap();
    }

    wait_until(|| h.processed() == 200);
    for lane in 0..4 {
        let seqs: Vec<u64> = h.lane_events(lane).iter().map(|e| e.seq).collect();
        assert_eq!(seqs.len(), 50);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "lane {lane} out of order");
    }
    h.processor.stop();
}

#[test]
fn test_hash_partitioner_keeps_keys_on_one_lane() {
    let lanes_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lanes_seen);
    let processor = PartitionedProcessor::builder(config(4, 16))
        .key_selector(FieldKeySelector::new(["id"]))
        .partitioner(HashPartitioner)
        .batch_processor(move |events: Vec<ChangeEvent>| -> Result<(), CallbackError> {
            let lane = current_lane();
            let mut seen = sink.lock();
            for event in &events {
                seen.push((key_of(event).to_string(), lane));
            }
            Ok(())
        })
        .offset_flusher(|_: &ChangeEvent| -> Result<(), CallbackError> { Ok(()) })
        .build()
        .unwrap();
    processor.start().unwrap();

    let events = (0..100)
        .map(|i| insert(&format!("user-{}", i % 10), i))
        .collect();
    processor.submit(events, true).unwrap();
    processor.stop();

    let seen = lanes_seen.lock();
    assert_eq!(seen.len(), 100);
    for key in 0..10 {
        let name = format!("user-{key}");
        let lanes: HashSet<usize> = seen
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, lane)| *lane)
            .collect();
        assert_eq!(lanes.len(), 1, "{name} spread over {lanes:?}");
    }
}

// ── Checkpoints ──

#[test]
fn test_checkpoint_never_precedes_processing() {
    let processed = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(AtomicUsize::new(0));
    let flushes = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&processed);
    let checked = Arc::clone(&processed);
    let violated = Arc::clone(&violations);
    let flushed = Arc::clone(&flushes);

    let processor = PartitionedProcessor::builder(config(4, 4))
        .key_selector(FieldKeySelector::new(["id"]))
        .partitioner(letter_partitioner)
        .batch_processor(move |events: Vec<ChangeEvent>| -> Result<(), CallbackError> {
            // Lanes progress at different speeds.
            thread::sleep(Duration::from_millis(current_lane() as u64 * 2));
            seen.lock().extend(events.iter().map(|e| e.seq));
            Ok(())
        })
        .offset_flusher(move |event: &ChangeEvent| -> Result<(), CallbackError> {
            let done = checked.lock();
            if (1..=event.seq).any(|seq| !done.contains(&seq)) {
                violated.fetch_add(1, Ordering::SeqCst);
            }
            flushed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();
    processor.start().unwrap();

    let keys = ["A", "B", "C", "D"];
    for chunk in 0..20 {
        let events = (0..7)
            .map(|i| insert(keys[(chunk + i) % keys.len()], i as i64))
            .collect();
        processor.submit(events, false).unwrap();
    }

    wait_until(|| flushes.load(Ordering::SeqCst) == 20);
    processor.stop();
    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(processed.lock().len(), 140);
}

#[test]
fn test_flushes_follow_submission_order() {
    let h = harness(3, 2);
    for i in 0..5 {
        let events = vec![insert("A", i), insert("C", i)];
        h.processor.submit(events, false).unwrap();
    }

    wait_until(|| h.flushes().len() == 5);
    let seqs: Vec<u64> = h.flushes().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![2, 4, 6, 8, 10]);
    assert_eq!(h.processor.metrics().checkpoints_flushed, 5);
    h.processor.stop();
}

#[test]
fn test_empty_batch_is_noop() {
    let h = harness(2, 2);
    let outcome = h.processor.submit(Vec::new(), true).unwrap();
    assert_eq!(outcome.accepted, 0);
    assert!(!outcome.stopped_early);

    let metrics = h.processor.metrics();
    assert_eq!(metrics.watermarks, 0);
    assert_eq!(metrics.barriers, 0);
    h.processor.stop();
}

// ── Backpressure ──

#[test]
fn test_backpressure_blocks_without_dropping() {
    let gate = Arc::new(AtomicBool::new(false));
    let open = Arc::clone(&gate);
    let h = Arc::new(harness_with(
        2,
        2,
        Box::new(move |_: &[ChangeEvent]| -> Result<(), CallbackError> {
            while !open.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        }),
    ));
    let max_resident = h.processor.config().max_resident_markers();
    let lane_capacity = h.processor.config().lane_queue_capacity();

    let done = Arc::new(AtomicBool::new(false));
    let submitter = {
        let h = Arc::clone(&h);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..10 {
                let events = (0..5).map(|j| insert("A", i * 5 + j)).collect();
                h.processor.submit(events, false).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    // Lane 0 stalls, so the submitter must stall on its full queue.
    thread::sleep(Duration::from_millis(200));
    assert!(!done.load(Ordering::Acquire));
    let depths = h.processor.queue_depths();
    assert!(depths.iter().all(|d| *d <= lane_capacity));
    assert!(depths.iter().sum::<usize>() <= max_resident);
    assert!(h.processor.metrics().enqueue_timeouts > 0);

    gate.store(true, Ordering::Release);
    submitter.join().unwrap();
    wait_until(|| h.processed() == 50);
    h.processor.stop();
}

// ── Lifecycle ──

#[test]
fn test_stop_drains_queued_events() {
    let h = harness_with(
        3,
        4,
        Box::new(|_: &[ChangeEvent]| -> Result<(), CallbackError> {
            thread::sleep(Duration::from_millis(5));
            Ok(())
        }),
    );
    let events = (0..60)
        .map(|i| insert(["A", "B", "C"][i % 3], i as i64))
        .collect();
    h.processor.submit(events, false).unwrap();

    h.processor.stop();
    assert!(!h.processor.is_running());
    assert_eq!(h.processed(), 60);

    let count = h.log.lock().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.log.lock().len(), count, "callback ran after stop returned");
}

#[test]
fn test_force_stop_starts_no_new_batches() {
    let h = Arc::new(harness_with(
        2,
        2,
        Box::new(|_: &[ChangeEvent]| -> Result<(), CallbackError> {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        }),
    ));

    let submitter = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let events = (0..200).map(|i| insert(["A", "B"][i % 2], i as i64)).collect();
            h.processor.submit(events, false).unwrap()
        })
    };
    wait_until(|| h.processed() > 0);

    let started = Instant::now();
    h.processor.force_stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!h.processor.is_running());

    let outcome = submitter.join().unwrap();
    assert!(outcome.stopped_early);
    assert!(outcome.accepted < 200);

    let count = h.log.lock().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(h.log.lock().len(), count);
    assert!(h.processed() < 200);
}

#[test]
fn test_stop_is_idempotent() {
    let h = harness(2, 2);
    h.processor.stop();
    h.processor.stop();
    h.processor.force_stop();
    assert!(!h.processor.is_running());
    assert!(matches!(
        h.processor.submit(vec![insert("A", 1)], false),
        Err(FanoutError::NotRunning)
    ));
}

#[test]
fn test_submit_before_start() {
    let processor = PartitionedProcessor::builder(config(2, 2))
        .key_selector(FieldKeySelector::new(["id"]))
        .partitioner(HashPartitioner)
        .batch_processor(|_: Vec<ChangeEvent>| -> Result<(), CallbackError> { Ok(()) })
        .offset_flusher(|_: &ChangeEvent| -> Result<(), CallbackError> { Ok(()) })
        .build()
        .unwrap();

    assert!(matches!(
        processor.submit(vec![insert("A", 1)], false),
        Err(FanoutError::NotStarted)
    ));
    processor.start().unwrap();
    assert!(matches!(processor.start(), Err(FanoutError::AlreadyStarted)));
    processor.stop();
}

#[test]
fn test_builder_requires_components() {
    let err = PartitionedProcessor::builder(config(2, 2))
        .key_selector(FieldKeySelector::new(["id"]))
        .batch_processor(|_: Vec<ChangeEvent>| -> Result<(), CallbackError> { Ok(()) })
        .offset_flusher(|_: &ChangeEvent| -> Result<(), CallbackError> { Ok(()) })
        .build()
        .unwrap_err();
    assert!(matches!(err, FanoutError::MissingComponent("partitioner")));
    assert!(err.is_config_error());
}

#[test]
fn test_liveness_gate_stops_workers() {
    let alive = Arc::new(AtomicBool::new(true));
    let gate = Arc::clone(&alive);
    let processor = PartitionedProcessor::builder(config(2, 2))
        .key_selector(FieldKeySelector::new(["id"]))
        .partitioner(HashPartitioner)
        .batch_processor(|_: Vec<ChangeEvent>| -> Result<(), CallbackError> { Ok(()) })
        .offset_flusher(|_: &ChangeEvent| -> Result<(), CallbackError> { Ok(()) })
        .liveness(move || gate.load(Ordering::Acquire))
        .build()
        .unwrap();
    processor.start().unwrap();
    assert!(processor.is_running());

    alive.store(false, Ordering::Release);
    assert!(!processor.is_running());
    assert!(matches!(
        processor.submit(vec![insert("A", 1)], true),
        Err(FanoutError::NotRunning)
    ));

    // Workers exit once the gate closes; reopening it stays stopped.
    thread::sleep(Duration::from_millis(200));
    alive.store(true, Ordering::Release);
    assert!(!processor.is_running());
    let started = Instant::now();
    assert!(matches!(
        processor.submit(vec![insert("A", 2)], true),
        Err(FanoutError::NotRunning)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(processor.queue_depths().iter().all(|d| *d == 0));

    let started = Instant::now();
    processor.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ── Failures ──

#[test]
fn test_processing_error_stops_pipeline() {
    let h = harness_with(
        2,
        4,
        Box::new(|events: &[ChangeEvent]| -> Result<(), CallbackError> {
            if events.iter().any(|e| key_of(e) == "B") {
                return Err("sink rejected B".into());
            }
            Ok(())
        }),
    );

    h.processor
        .submit(vec![insert("A", 1), insert("B", 2)], false)
        .unwrap();
    wait_until(|| !h.errors.lock().is_empty());

    assert!(!h.processor.is_running());
    let (error, context) = h.errors.lock()[0].clone();
    assert_eq!(error, "lane 1 batch processing failed: sink rejected B");
    assert_eq!(context, "lane 1 failed to process batch");
    assert_eq!(h.processor.metrics().failures, 1);

    assert!(matches!(
        h.processor.submit(vec![insert("A", 3)], false),
        Err(FanoutError::NotRunning)
    ));
    thread::sleep(Duration::from_millis(100));
    assert!(h.flushes().is_empty());
    h.processor.stop();
}

#[test]
fn test_flush_panic_is_reported() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let processor = PartitionedProcessor::builder(config(2, 2))
        .key_selector(FieldKeySelector::new(["id"]))
        .partitioner(letter_partitioner)
        .batch_processor(|_: Vec<ChangeEvent>| -> Result<(), CallbackError> { Ok(()) })
        .offset_flusher(|_: &ChangeEvent| -> Result<(), CallbackError> {
            panic!("offset store unreachable")
        })
        .error_handler(move |error: &FanoutError, context: &str| {
            sink.lock().push((error.to_string(), context.to_string()));
        })
        .build()
        .unwrap();
    processor.start().unwrap();

    processor.submit(vec![insert("A", 1)], false).unwrap();
    wait_until(|| !errors.lock().is_empty());

    assert!(!processor.is_running());
    assert_eq!(
        errors.lock()[0],
        (
            "worker test-watermark panicked: offset store unreachable".to_string(),
            "process watermark event failed".to_string()
        )
    );
    processor.force_stop();
}
