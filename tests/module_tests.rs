//! Module loading, linking and launch scenarios.

use std::sync::Arc;

use accel_host::module::ModuleCache;
use accel_host::runtime::sim::{SimImage, SimRuntime};
use accel_host::runtime::FragmentKind;
use accel_host::{
    Context, DeviceBuffer, Error, JitOptions, KernelParam, LaunchConfig, LaunchParameterSet,
    Linker, Module,
};

fn context() -> (Context, Arc<SimRuntime>) {
    init_tracing();
    let rt = SimRuntime::new(1);
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

fn kernel_image() -> Vec<u8> {
    SimImage::default()
        .with_function("saxpy")
        .with_global("alpha", 8)
        .to_bytes()
}

#[test]
fn test_load_launch_with_global() {
    let (ctx, rt) = context();
    let module = Module::load(&ctx, 0, &kernel_image(), None).unwrap();

    // Globals are plain device memory.
    let alpha = module.global("alpha").unwrap();
    assert_eq!(alpha.byte_len, 8);

    let input = DeviceBuffer::allocate(&ctx, 0, 4096).unwrap();
    let function = module.function("saxpy").unwrap();
    function
        .launch(
            &ctx,
            &LaunchConfig::new(8u32, 128u32).with_shared_bytes(256),
            None,
            &[
                KernelParam::Buffer(&input),
                KernelParam::U64(alpha.address),
                KernelParam::I32(1024),
            ],
        )
        .unwrap();

    let launches = rt.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].shared_bytes, 256);
    assert_eq!(launches[0].params[1], alpha.address);

    input.close().unwrap();
    module.unload().unwrap();
}

#[test]
fn test_parameter_set_launch() {
    let (ctx, rt) = context();
    let module = Module::load(&ctx, 0, &kernel_image(), None).unwrap();
    let function = module.function("saxpy").unwrap();

    let mut params = LaunchParameterSet::new(4).unwrap();
    params.set_f32(0, 2.0).unwrap();
    params.set_u64(1, 0xDEAD).unwrap();
    params.set_null(3).unwrap();

    // Slot 2 missing.
    assert!(matches!(
        function.launch_with_set(&ctx, &LaunchConfig::new(1u32, 32u32), None, &params),
        Err(Error::InvalidArgument(_))
    ));
    assert!(rt.launches().is_empty());

    params.set_i64(2, -1).unwrap();
    function
        .launch_with_set(&ctx, &LaunchConfig::new(1u32, 32u32), None, &params)
        .unwrap();

    let launches = rt.launches();
    assert_eq!(launches[0].params[0], 2.0f32.to_bits() as u64);
    assert_eq!(launches[0].params[2], u64::MAX);
    assert_eq!(launches[0].params[3], 0);

    module.unload().unwrap();
}

#[test]
fn test_link_sources_then_launch() {
    let (ctx, _) = context();

    let mut options = JitOptions::new();
    options.optimization_level(3).unwrap();
    options.record_wall_time(true);

    let mut linker = Linker::new(&ctx, 0, Some(options)).unwrap();
    linker
        .add(FragmentKind::Source, b".entry stencil\n", "stencil.src", None)
        .unwrap()
        .add(
            FragmentKind::Object,
            &SimImage::default().with_function("reduce").to_bytes(),
            "reduce.o",
            None,
        )
        .unwrap();

    let image = linker.complete().unwrap();
    linker.destroy().unwrap();
    assert!(linker.options().unwrap().info_log().is_some());

    let module = Module::load(&ctx, 0, &image, None).unwrap();
    for name in ["stencil", "reduce"] {
        let function = module.function(name).unwrap();
        function
            .launch(&ctx, &LaunchConfig::new(1u32, 64u32), None, &[])
            .unwrap();
    }
    module.unload().unwrap();
}

#[test]
fn test_cache_serves_one_load_per_key() {
    let (ctx, rt) = context();
    let cache = Arc::new(ModuleCache::<String>::new());

    let mut workers = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let ctx = ctx.clone();
        workers.push(std::thread::spawn(move || {
            let module = cache
                .get_or_load(&"saxpy".to_string(), 0, || {
                    Module::load(&ctx, 0, &kernel_image(), None)
                })
                .unwrap();
            module.function("saxpy").unwrap();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(cache.len(), 1);
    cache.remove(&"saxpy".to_string(), 0).unwrap().unload().unwrap();

    // No module or global allocations survive teardown.
    assert_eq!(rt.allocation_count(), 0);
}

#[test]
fn test_jit_options_survive_shared_use() {
    let (ctx, rt) = context();

    let mut options = JitOptions::new();
    options.threads_per_block(192).unwrap();
    let options = Arc::new(options);

    // Several loads race on a shared option set; handles converge and every
    // created handle is eventually destroyed.
    let mut workers = Vec::new();
    for _ in 0..4 {
        let ctx = ctx.clone();
        let options = options.clone();
        workers.push(std::thread::spawn(move || {
            let module = Module::load(&ctx, 0, &kernel_image(), Some(&options)).unwrap();
            module.unload().unwrap();
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(rt.options_created(), rt.options_destroyed());
    assert_eq!(options.selected_threads_per_block(), Some(192));
}
