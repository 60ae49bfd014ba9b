//! End-to-end buffer scenarios against the in-process runtime.

use std::sync::Arc;

use accel_host::config::CoreConfig;
use accel_host::runtime::sim::SimRuntime;
use accel_host::{Context, DeviceBuffer, Error, PinnedBuffer};

fn context() -> (Context, Arc<SimRuntime>) {
    init_tracing();
    let rt = SimRuntime::new(2);
    (Context::new(rt.clone()), rt)
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
fn test_pattern_roundtrip_through_views() {
    let (ctx, _) = context();
    let buf = DeviceBuffer::allocate(&ctx, 0, 1024).unwrap();

    // Byte pattern 0..=255 repeated four times.
    let pattern: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
    buf.copy_from_slice(&pattern).unwrap();

    let mut back = vec![0u8; 1024];
    buf.copy_to_slice(&mut back).unwrap();
    assert_eq!(back, pattern);

    // Read the second half through a view.
    let tail = buf.at_offset(512).unwrap();
    let mut half = vec![0u8; 512];
    tail.copy_to_slice(&mut half).unwrap();
    assert_eq!(half, &pattern[512..]);

    buf.close().unwrap();
}

#[test]
fn test_disjoint_views_fill_independently() {
    let (ctx, _) = context();
    let buf = DeviceBuffer::allocate(&ctx, 0, 1024).unwrap();

    let front = buf.slice(0, 512).unwrap();
    let back = buf.slice(512, 1024).unwrap();
    assert!(front.shares_allocation(&back));
    assert!(!front.is_root());

    front.fill(0xAA, 1, 512).unwrap();
    back.fill(0xBB, 1, 512).unwrap();

    let mut all = vec![0u8; 1024];
    buf.copy_to_slice(&mut all).unwrap();
    assert!(all[..512].iter().all(|&b| b == 0xAA));
    assert!(all[512..].iter().all(|&b| b == 0xBB));

    // Closing the views leaves the allocation alive.
    front.close().unwrap();
    back.close().unwrap();
    buf.copy_to_slice(&mut all).unwrap();

    buf.close().unwrap();
}

#[test]
fn test_cross_device_copy() {
    let (ctx, _) = context();
    let src = DeviceBuffer::allocate(&ctx, 0, 128).unwrap();
    let dst = DeviceBuffer::allocate(&ctx, 1, 128).unwrap();

    let payload: Vec<u8> = (0u8..128).collect();
    src.copy_from_slice(&payload).unwrap();
    dst.copy_from_device(&src, 0, 128).unwrap();

    let mut back = vec![0u8; 128];
    dst.copy_to_slice(&mut back).unwrap();
    assert_eq!(back, payload);

    src.close().unwrap();
    dst.close().unwrap();
}

#[test]
fn test_staged_transfer_respects_chunking() {
    let (ctx, rt) = context();
    let mut cfg = CoreConfig::default();
    cfg.staging.max_chunk_bytes = 128;
    let ctx = ctx.with_config(cfg);

    let buf = DeviceBuffer::allocate(&ctx, 0, 4096).unwrap();
    let payload: Vec<u8> = (0..4096).map(|i| (i % 253) as u8).collect();

    buf.copy_from_reader(&mut &payload[..], 4096).unwrap();

    let mut sink = Vec::with_capacity(4096);
    buf.copy_to_writer(&mut sink, 4096).unwrap();
    assert_eq!(sink, payload);
    assert_eq!(rt.registered_count(), 0);

    buf.close().unwrap();
}

#[test]
fn test_release_order_views_then_root() {
    let (ctx, rt) = context();
    let buf = DeviceBuffer::allocate(&ctx, 0, 256).unwrap();
    let view = buf.at_offset(64).unwrap();

    // Concurrent closers: exactly one frees the allocation.
    let buf = Arc::new(buf);
    let mut closers = Vec::new();
    for _ in 0..4 {
        let buf = buf.clone();
        closers.push(std::thread::spawn(move || buf.close()));
    }
    for closer in closers {
        closer.join().unwrap().unwrap();
    }
    assert_eq!(rt.allocation_count(), 0);

    assert!(matches!(view.address(), Err(Error::InvalidState(_))));
    assert!(matches!(view.slice(0, 8), Err(Error::InvalidState(_))));
}

#[test]
fn test_pinned_buffer_feeds_device_copy() {
    let (ctx, _) = context();

    let mut pinned = PinnedBuffer::allocate(&ctx, 256).unwrap();
    for (i, b) in pinned.as_bytes_mut().iter_mut().enumerate() {
        *b = i as u8;
    }

    let buf = DeviceBuffer::allocate(&ctx, 0, 256).unwrap();
    buf.copy_from_slice(pinned.as_bytes()).unwrap();

    let mut back = vec![0u8; 256];
    buf.copy_to_slice(&mut back).unwrap();
    assert_eq!(back, pinned.as_bytes());

    buf.close().unwrap();
    pinned.unregister().unwrap();
}
