//! A listener that panics while earlier firings replay to it must not
//! stall the instant: the panic is caught, logged at ERROR level, and
//! propagation continues for the remaining replayed values and listeners.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use ripple::{StreamSink, Transaction};

struct CountErrors(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for CountErrors {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn replay_panic_is_logged_and_propagation_continues() {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(CountErrors(Arc::clone(&errors)));
    let _guard = tracing::subscriber::set_default(subscriber);

    let sink: StreamSink<i32> = StreamSink::new();
    let stream = sink.stream();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);

    let _l = Transaction::run(|| {
        sink.send(10);
        sink.send(11);
        // Attached mid-instant: both earlier firings replay; the first
        // blows up, the second must still arrive.
        let l = stream.listen(move |a: &i32| {
            if *a == 10 {
                panic!("replayed value rejected");
            }
            seen2.lock().unwrap().push(*a);
        });
        sink.send(12);
        l
    });

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock().unwrap(), vec![11, 12]);

    // The engine stays healthy afterwards.
    sink.send(20);
    assert_eq!(*seen.lock().unwrap(), vec![11, 12, 20]);
}
