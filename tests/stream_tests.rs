//! Stream, event and callback scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use accel_host::exec::{EventFlag, MarkerState, QueueState, StreamFlag};
use accel_host::runtime::sim::SimRuntime;
use accel_host::{Context, DeviceBuffer, Error, Event, Stream};

fn context() -> Context {
    init_tracing();
    Context::new(SimRuntime::new(1))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accel_host=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

#[test]
fn test_callbacks_run_in_order() {
    let ctx = context();
    let stream = Stream::create(&ctx, 0).unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for i in 0..8 {
        let order = order.clone();
        stream
            .add_callback(move || order.lock().unwrap().push(i))
            .unwrap();
    }

    stream.synchronize().unwrap();
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    assert_eq!(stream.query().unwrap(), QueueState::Ready);

    stream.close().unwrap();
}

#[test]
fn test_callback_cannot_reenter_runtime() {
    let ctx = context();
    let stream = Stream::create(&ctx, 0).unwrap();

    let violations = Arc::new(AtomicUsize::new(0));
    let count = violations.clone();
    let inner = ctx.clone();
    stream
        .add_callback(move || {
            let denied = [
                DeviceBuffer::allocate(&inner, 0, 64).err(),
                Stream::create(&inner, 0).map(|_| ()).err(),
                Event::create(&inner, 0).map(|_| ()).err(),
            ];
            let all_denied = denied
                .iter()
                .all(|e| matches!(e, Some(Error::NotPermitted(_))));
            if all_denied {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    stream.synchronize().unwrap();
    assert_eq!(violations.load(Ordering::SeqCst), 1);
    stream.close().unwrap();
}

#[test]
fn test_event_ordering_and_timing() {
    let ctx = context();
    let stream = Stream::with_flags(&ctx, 0, StreamFlag::NonBlocking, -1).unwrap();

    let start = Event::create(&ctx, 0).unwrap();
    let stop = Event::with_flags(&ctx, 0, EventFlag::BlockingSync).unwrap();

    start.record(Some(&stream)).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2));
    stop.record(Some(&stream)).unwrap();
    stream.wait_event(&stop).unwrap();

    assert_eq!(stop.query().unwrap(), MarkerState::Occurred);
    stop.synchronize().unwrap();
    assert!(stop.elapsed_ms(&start).unwrap() >= 0.0);

    start.close().unwrap();
    stop.close().unwrap();
    stream.close().unwrap();
}

#[test]
fn test_closed_handles_fail_cleanly() {
    let ctx = context();
    let stream = Stream::create(&ctx, 0).unwrap();
    let event = Event::create(&ctx, 0).unwrap();

    stream.close().unwrap();
    event.close().unwrap();

    assert!(matches!(stream.synchronize(), Err(Error::InvalidState(_))));
    assert!(matches!(event.record(None), Err(Error::InvalidState(_))));
    assert!(matches!(
        stream.add_callback(|| {}),
        Err(Error::InvalidState(_))
    ));

    // Closing again stays a no-op.
    stream.close().unwrap();
    event.close().unwrap();
}
