//! E2E scenarios for the stream combinator surface.
//!
//! Validates:
//! 1. `map` transforms per firing.
//! 2. Right-biased `merge` and combiner `merge_with` on simultaneous
//!    events.
//! 3. `accum` folds one step per transaction.
//! 4. `split` gives every element its own transaction.
//! 5. `gate` filters on the gating cell's pre-update value.
//! 6. Subscription lifetime: `once`, `listen_weak`, `add_cleanup`.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use ripple::{Stream, StreamSink, Transaction};

fn collector<A: Clone + Send + 'static>() -> (Arc<Mutex<Vec<A>>>, impl FnMut(&A) + Send + 'static) {
    let seen: Arc<Mutex<Vec<A>>> = Arc::new(Mutex::new(Vec::new()));
    let push_into = Arc::clone(&seen);
    (seen, move |a: &A| push_into.lock().unwrap().push(a.clone()))
}

fn taken<A: Clone>(seen: &Arc<Mutex<Vec<A>>>) -> Vec<A> {
    seen.lock().unwrap().clone()
}

// ── Core scenarios ──────────────────────────────────────────────────────

#[test]
fn mapped_sink_doubles_every_event() {
    let sink: StreamSink<i32> = StreamSink::new();
    let mapped = sink.stream().map(|x| x * 2);
    let (seen, push) = collector();
    let _l = mapped.listen(push);

    sink.send(1);
    sink.send(2);
    sink.send(3);

    assert_eq!(taken(&seen), vec![2, 4, 6]);
}

#[test]
fn simultaneous_merge_is_right_biased() {
    let a: StreamSink<&'static str> = StreamSink::new();
    let b: StreamSink<&'static str> = StreamSink::new();
    let m = a.stream().merge(&b.stream());
    let (seen, push) = collector();
    let _l = m.listen(push);

    Transaction::run(|| {
        a.send("L");
        b.send("R");
    });

    assert_eq!(taken(&seen), vec!["R"]);
}

#[test]
fn simultaneous_merge_with_combiner_sees_left_then_right() {
    let a: StreamSink<String> = StreamSink::new();
    let b: StreamSink<String> = StreamSink::new();
    let m = a
        .stream()
        .merge_with(&b.stream(), |l, r| format!("{l}{r}"));
    let (seen, push) = collector();
    let _l = m.listen(push);

    Transaction::run(|| {
        a.send("L".to_owned());
        b.send("R".to_owned());
    });

    assert_eq!(taken(&seen), vec!["LR".to_owned()]);
}

#[test]
fn accum_outputs_each_new_state() {
    let sink: StreamSink<i32> = StreamSink::new();
    let total = sink.stream().accum(0, |a, s| a + s);
    let (seen, push) = collector();
    let _l = total.updates().listen(push);

    sink.send(3);
    sink.send(4);
    sink.send(5);

    assert_eq!(taken(&seen), vec![3, 7, 12]);
    assert_eq!(total.sample(), 12);
}

// ── Per-transaction semantics ───────────────────────────────────────────

#[test]
fn accum_steps_once_per_transaction() {
    let sink: StreamSink<i32> = StreamSink::new();
    let total = sink.stream().accum(0, |a, s| a + s);

    Transaction::run(|| {
        sink.send(100);
        sink.send(7);
    });

    // One instant, one step: the last simultaneous event drives it.
    assert_eq!(total.sample(), 7);
}

#[test]
fn split_runs_each_element_in_its_own_transaction() {
    let sink: StreamSink<Vec<i32>> = StreamSink::new();
    let split = sink.stream().split();
    let (seen, push) = collector();
    let _l = split.listen(push);
    // If the elements shared a transaction, accum would only step once.
    let total = split.accum(0, |a, s| a + s);

    sink.send(vec![10, 20, 30]);

    assert_eq!(taken(&seen), vec![10, 20, 30]);
    assert_eq!(total.sample(), 60);
}

#[test]
fn merge_all_handles_empty_single_and_many() {
    let empty: Stream<i32> = Stream::merge_all(&[], |l, r| l + r);
    let (seen_empty, push_empty) = collector();
    let _l0 = empty.listen(push_empty);

    let sinks: Vec<StreamSink<i32>> = (0..7).map(|_| StreamSink::new()).collect();
    let streams: Vec<_> = sinks.iter().map(|s| s.stream()).collect();
    let merged = Stream::merge_all(&streams, |l, r| l + r);
    let (seen, push) = collector();
    let _l = merged.listen(push);

    Transaction::run(|| {
        for (ix, sink) in sinks.iter().enumerate() {
            sink.send(1 << ix);
        }
    });
    sinks[3].send(1000);

    assert!(taken(&seen_empty).is_empty());
    assert_eq!(taken(&seen), vec![127, 1000]);
}

#[test]
fn gate_uses_pre_update_gate_value() {
    let sink: StreamSink<i32> = StreamSink::new();
    let gate_sink: StreamSink<bool> = StreamSink::new();
    let open = gate_sink.stream().hold(true);
    let gated = sink.stream().gate(&open);
    let (seen, push) = collector();
    let _l = gated.listen(push);

    sink.send(1);
    Transaction::run(|| {
        // The gate closes this instant, but the event of the same instant
        // still sees the gate's prior value.
        gate_sink.send(false);
        sink.send(2);
    });
    sink.send(3);

    assert_eq!(taken(&seen), vec![1, 2]);
}

// ── Subscription lifetime ───────────────────────────────────────────────

#[test]
fn once_delivers_only_the_first_event() {
    let sink: StreamSink<i32> = StreamSink::new();
    let first = sink.stream().once();
    let (seen, push) = collector();
    let _l = first.listen(push);

    sink.send(7);
    sink.send(8);

    assert_eq!(taken(&seen), vec![7]);
}

#[test]
fn listener_drop_detaches() {
    let sink: StreamSink<i32> = StreamSink::new();
    let (seen, push) = collector();
    let l = sink.stream().listen(push);

    sink.send(1);
    drop(l);
    sink.send(2);

    assert_eq!(taken(&seen), vec![1]);
}

#[test]
fn unlisten_is_idempotent_and_leaves_others_attached() {
    let sink: StreamSink<i32> = StreamSink::new();
    let (seen_a, push_a) = collector();
    let (seen_b, push_b) = collector();
    let la = sink.stream().listen(push_a);
    let _lb = sink.stream().listen(push_b);

    sink.send(1);
    la.unlisten();
    la.unlisten();
    sink.send(2);
    la.unlisten();
    sink.send(3);

    assert_eq!(taken(&seen_a), vec![1]);
    assert_eq!(taken(&seen_b), vec![1, 2, 3]);
}

#[test]
fn weak_listener_lapses_with_the_stream() {
    let sink: StreamSink<i32> = StreamSink::new();
    let (seen, push) = collector();
    let mapped = sink.stream().map(|x| x + 1);
    let _l = mapped.listen_weak(push);

    sink.send(1);
    drop(mapped);
    sink.send(2);

    assert_eq!(taken(&seen), vec![2]);
}

#[test]
fn add_cleanup_detaches_the_piggybacked_listener() {
    let main: StreamSink<i32> = StreamSink::new();
    let side: StreamSink<i32> = StreamSink::new();
    let (seen_side, push_side) = collector();

    let side_listener = side.stream().listen(push_side);
    let carrier = main.stream().map(|x| *x).add_cleanup(side_listener);

    side.send(1);
    drop(carrier);
    side.send(2);

    assert_eq!(taken(&seen_side), vec![1]);
}
