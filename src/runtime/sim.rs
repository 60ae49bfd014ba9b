//! In-process runtime simulator.
//!
//! Models the native runtime entirely in host memory so the control layer can
//! be exercised without accelerator hardware: device regions are byte
//! vectors, streams complete work synchronously, callbacks run on a dedicated
//! worker thread, and code images use a small JSON format. Fault injection
//! and handle accounting hooks support failure-path tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, Status};
use crate::exec::CallbackScope;
use crate::runtime::{FragmentKind, HostCallback, NativeRuntime, OptionKey, OptionsOutput};

/// Code image understood by the simulator.
///
/// Tests and link sessions build these; `module_load` parses them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimImage {
    #[serde(default)]
    pub functions: Vec<String>,

    /// Global name → byte length. Backing storage is allocated at load time.
    #[serde(default)]
    pub globals: BTreeMap<String, u64>,

    #[serde(default)]
    pub textures: Vec<String>,

    #[serde(default)]
    pub surfaces: Vec<String>,
}

impl SimImage {
    pub fn with_function(mut self, name: &str) -> Self {
        self.functions.push(name.to_string());
        self
    }

    pub fn with_global(mut self, name: &str, byte_len: u64) -> Self {
        self.globals.insert(name.to_string(), byte_len);
        self
    }

    pub fn with_texture(mut self, name: &str) -> Self {
        self.textures.push(name.to_string());
        self
    }

    pub fn with_surface(mut self, name: &str) -> Self {
        self.surfaces.push(name.to_string());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("image serialization cannot fail")
    }

    fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|_| Error::native(Status::InvalidImage))
    }

    fn merge(&mut self, other: SimImage) {
        self.functions.extend(other.functions);
        self.globals.extend(other.globals);
        self.textures.extend(other.textures);
        self.surfaces.extend(other.surfaces);
    }
}

/// One recorded kernel launch, for assertions.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub device: usize,
    pub function: u64,
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_bytes: u32,
    pub stream: u64,
    pub params: Vec<u64>,
}

#[derive(Debug)]
struct Region {
    device: usize,
    data: Vec<u8>,
}

struct SimModule {
    functions: Vec<String>,
    /// Global name → (backing region base, byte length).
    globals: HashMap<String, (u64, u64)>,
    textures: Vec<String>,
    surfaces: Vec<String>,
}

#[derive(Default)]
struct SimState {
    next_addr: u64,
    next_token: u64,
    allocations: BTreeMap<u64, Region>,
    registered: HashMap<u64, u64>,
    streams: HashMap<u64, usize>,
    events: HashMap<u64, Option<Instant>>,
    modules: HashMap<u64, SimModule>,
    /// Function token → owning module.
    functions: HashMap<u64, u64>,
    links: HashMap<u64, SimImage>,
    options: HashMap<u64, Vec<(OptionKey, u64)>>,
    launches: Vec<LaunchRecord>,
}

impl SimState {
    fn token(&mut self) -> u64 {
        self.next_token += 1;
        0x1000_0000 + self.next_token
    }

    fn alloc_region(&mut self, device: usize, bytes: u64) -> u64 {
        // Bump allocator; bases stay 256-byte aligned so offset arithmetic in
        // callers is realistic.
        let base = self.next_addr;
        self.next_addr += (bytes.max(1) + 255) & !255;
        self.allocations.insert(
            base,
            Region {
                device,
                data: vec![0u8; bytes as usize],
            },
        );
        base
    }

    /// Resolve `addr..addr+len` to (region base, offset).
    fn resolve(&self, addr: u64, len: u64) -> Result<(u64, usize)> {
        let (base, region) = self
            .allocations
            .range(..=addr)
            .next_back()
            .ok_or_else(|| Error::native(Status::IllegalAddress))?;
        let offset = addr - base;
        if offset + len > region.data.len() as u64 {
            return Err(Error::native(Status::IllegalAddress));
        }
        Ok((*base, offset as usize))
    }
}

/// Simulated native runtime.
pub struct SimRuntime {
    device_count: usize,
    state: Mutex<SimState>,
    callback_tx: Mutex<Sender<HostCallback>>,
    pending_callbacks: Arc<(Mutex<usize>, Condvar)>,
    options_created: AtomicU64,
    options_destroyed: AtomicU64,
    copies: AtomicU64,
    /// 1-based index of the next copy to fail; negative disables injection.
    fail_copy_at: AtomicI64,
}

impl SimRuntime {
    pub fn new(device_count: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<HostCallback>();

        // Single worker standing in for the runtime's callback thread; jobs
        // carry their own bookkeeping.
        std::thread::Builder::new()
            .name("sim-callbacks".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn simulator callback thread");

        let mut state = SimState::default();
        state.next_addr = 0x1_0000;

        Arc::new(Self {
            device_count,
            state: Mutex::new(state),
            callback_tx: Mutex::new(tx),
            pending_callbacks: Arc::new((Mutex::new(0), Condvar::new())),
            options_created: AtomicU64::new(0),
            options_destroyed: AtomicU64::new(0),
            copies: AtomicU64::new(0),
            fail_copy_at: AtomicI64::new(-1),
        })
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.device_count {
            return Err(Error::native(Status::InvalidDevice));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arrange for the `nth` transfer call from now (1-based) to fail with
    /// `DeviceUnavailable`.
    pub fn fail_nth_copy(&self, nth: u64) {
        self.copies.store(0, Ordering::SeqCst);
        self.fail_copy_at.store(nth as i64, Ordering::SeqCst);
    }

    fn copy_gate(&self) -> Result<()> {
        let n = self.copies.fetch_add(1, Ordering::SeqCst) + 1;
        let fail_at = self.fail_copy_at.load(Ordering::SeqCst);
        if fail_at >= 0 && n as i64 == fail_at {
            self.fail_copy_at.store(-1, Ordering::SeqCst);
            return Err(Error::native(Status::DeviceUnavailable));
        }
        Ok(())
    }

    /// Number of live device allocations.
    pub fn allocation_count(&self) -> usize {
        self.lock().allocations.len()
    }

    /// Number of live host-memory registrations.
    pub fn registered_count(&self) -> usize {
        self.lock().registered.len()
    }

    pub fn options_created(&self) -> u64 {
        self.options_created.load(Ordering::SeqCst)
    }

    pub fn options_destroyed(&self) -> u64 {
        self.options_destroyed.load(Ordering::SeqCst)
    }

    /// Snapshot of all recorded launches.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().launches.clone()
    }

    fn wait_callbacks_drained(&self) {
        let (lock, cvar) = &*self.pending_callbacks;
        let mut pending = lock.lock().unwrap_or_else(|e| e.into_inner());
        while *pending > 0 {
            pending = cvar.wait(pending).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl NativeRuntime for SimRuntime {
    fn mem_alloc(&self, device: usize, bytes: u64) -> Result<u64> {
        self.check_device(device)?;
        if bytes == 0 {
            return Err(Error::native(Status::InvalidValue));
        }
        let base = self.lock().alloc_region(device, bytes);
        debug!(device, bytes, base, "sim: allocated device region");
        Ok(base)
    }

    fn mem_free(&self, device: usize, addr: u64) -> Result<()> {
        self.check_device(device)?;
        match self.lock().allocations.remove(&addr) {
            Some(_) => Ok(()),
            None => Err(Error::native(Status::IllegalAddress)),
        }
    }

    fn memcpy_host_to_device(&self, device: usize, dst: u64, src: &[u8]) -> Result<()> {
        self.check_device(device)?;
        self.copy_gate()?;
        let mut state = self.lock();
        let (base, offset) = state.resolve(dst, src.len() as u64)?;
        let region = state.allocations.get_mut(&base).expect("resolved region");
        region.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn memcpy_device_to_host(&self, device: usize, src: u64, dst: &mut [u8]) -> Result<()> {
        self.check_device(device)?;
        self.copy_gate()?;
        let state = self.lock();
        let (base, offset) = state.resolve(src, dst.len() as u64)?;
        let region = &state.allocations[&base];
        dst.copy_from_slice(&region.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn memcpy_device_to_device(
        &self,
        dst_device: usize,
        dst: u64,
        src_device: usize,
        src: u64,
        bytes: u64,
    ) -> Result<()> {
        self.check_device(dst_device)?;
        self.check_device(src_device)?;
        self.copy_gate()?;
        let mut state = self.lock();
        let (src_base, src_off) = state.resolve(src, bytes)?;
        let (dst_base, dst_off) = state.resolve(dst, bytes)?;

        // Source and destination may share a region; stage through a copy.
        let tmp: Vec<u8> =
            state.allocations[&src_base].data[src_off..src_off + bytes as usize].to_vec();
        let region = state.allocations.get_mut(&dst_base).expect("resolved region");
        region.data[dst_off..dst_off + bytes as usize].copy_from_slice(&tmp);
        Ok(())
    }

    fn mem_fill(
        &self,
        device: usize,
        addr: u64,
        elem_size: u32,
        value: u32,
        count: u64,
    ) -> Result<()> {
        self.check_device(device)?;
        if !matches!(elem_size, 1 | 2 | 4) {
            return Err(Error::native(Status::InvalidValue));
        }
        let bytes = count
            .checked_mul(elem_size as u64)
            .ok_or_else(|| Error::native(Status::InvalidValue))?;
        let mut state = self.lock();
        let (base, offset) = state.resolve(addr, bytes)?;
        let region = state.allocations.get_mut(&base).expect("resolved region");
        let pattern = &value.to_le_bytes()[..elem_size as usize];
        for i in 0..count as usize {
            let at = offset + i * elem_size as usize;
            region.data[at..at + elem_size as usize].copy_from_slice(pattern);
        }
        Ok(())
    }

    fn register_host_memory(&self, host_addr: u64, bytes: u64) -> Result<u64> {
        let mut state = self.lock();
        if state.registered.contains_key(&host_addr) {
            return Err(Error::native(Status::InvalidValue));
        }
        state.registered.insert(host_addr, bytes);
        // The device alias is the host address itself.
        Ok(host_addr)
    }

    fn unregister_host_memory(&self, host_addr: u64) -> Result<()> {
        match self.lock().registered.remove(&host_addr) {
            Some(_) => Ok(()),
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn stream_create(&self, device: usize, _flags: u32, _priority: i32) -> Result<u64> {
        self.check_device(device)?;
        let mut state = self.lock();
        let token = state.token();
        state.streams.insert(token, device);
        Ok(token)
    }

    fn stream_destroy(&self, device: usize, stream: u64) -> Result<()> {
        self.check_device(device)?;
        match self.lock().streams.remove(&stream) {
            Some(_) => Ok(()),
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn stream_query(&self, device: usize, stream: u64) -> Result<bool> {
        self.check_device(device)?;
        if stream != crate::runtime::DEFAULT_STREAM && !self.lock().streams.contains_key(&stream) {
            return Err(Error::native(Status::InvalidHandle));
        }
        let (lock, _) = &*self.pending_callbacks;
        Ok(*lock.lock().unwrap_or_else(|e| e.into_inner()) == 0)
    }

    fn stream_synchronize(&self, device: usize, stream: u64) -> Result<()> {
        self.check_device(device)?;
        if stream != crate::runtime::DEFAULT_STREAM && !self.lock().streams.contains_key(&stream) {
            return Err(Error::native(Status::InvalidHandle));
        }
        self.wait_callbacks_drained();
        Ok(())
    }

    fn stream_add_callback(
        &self,
        device: usize,
        stream: u64,
        callback: HostCallback,
    ) -> Result<()> {
        self.check_device(device)?;
        if stream != crate::runtime::DEFAULT_STREAM && !self.lock().streams.contains_key(&stream) {
            return Err(Error::native(Status::InvalidHandle));
        }

        let pending = self.pending_callbacks.clone();
        {
            let (lock, _) = &*pending;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        }

        let job: HostCallback = Box::new(move || {
            {
                let _scope = CallbackScope::enter();
                callback();
            }
            let (lock, cvar) = &*pending;
            *lock.lock().unwrap_or_else(|e| e.into_inner()) -= 1;
            cvar.notify_all();
        });

        self.callback_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(job)
            .map_err(|_| Error::native(Status::Deinitialized))
    }

    fn stream_wait_event(&self, device: usize, stream: u64, event: u64) -> Result<()> {
        self.check_device(device)?;
        let state = self.lock();
        if stream != crate::runtime::DEFAULT_STREAM && !state.streams.contains_key(&stream) {
            return Err(Error::native(Status::InvalidHandle));
        }
        if !state.events.contains_key(&event) {
            return Err(Error::native(Status::InvalidHandle));
        }
        // Work completes synchronously, so the dependency is already satisfied.
        Ok(())
    }

    fn event_create(&self, device: usize, _flags: u32) -> Result<u64> {
        self.check_device(device)?;
        let mut state = self.lock();
        let token = state.token();
        state.events.insert(token, None);
        Ok(token)
    }

    fn event_destroy(&self, event: u64) -> Result<()> {
        match self.lock().events.remove(&event) {
            Some(_) => Ok(()),
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn event_record(&self, device: usize, event: u64, stream: u64) -> Result<()> {
        self.check_device(device)?;
        let mut state = self.lock();
        if stream != crate::runtime::DEFAULT_STREAM && !state.streams.contains_key(&stream) {
            return Err(Error::native(Status::InvalidHandle));
        }
        match state.events.get_mut(&event) {
            Some(slot) => {
                *slot = Some(Instant::now());
                Ok(())
            }
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn event_query(&self, event: u64) -> Result<bool> {
        match self.lock().events.get(&event) {
            Some(slot) => Ok(slot.is_some()),
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn event_synchronize(&self, event: u64) -> Result<()> {
        if !self.lock().events.contains_key(&event) {
            return Err(Error::native(Status::InvalidHandle));
        }
        self.wait_callbacks_drained();
        Ok(())
    }

    fn event_elapsed_ms(&self, event: u64, since: u64) -> Result<f32> {
        let state = self.lock();
        let later = state
            .events
            .get(&event)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        let earlier = state
            .events
            .get(&since)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        match (later, earlier) {
            (Some(later), Some(earlier)) => {
                Ok(later.saturating_duration_since(*earlier).as_secs_f32() * 1e3)
            }
            _ => Err(Error::native(Status::NotReady)),
        }
    }

    fn module_load(&self, device: usize, image: &[u8], _options: u64) -> Result<u64> {
        self.check_device(device)?;
        let parsed = SimImage::parse(image)?;
        let mut state = self.lock();

        // Globals get real backing regions so copies through them work.
        let globals = parsed
            .globals
            .iter()
            .map(|(name, &len)| {
                let base = state.alloc_region(device, len.max(1));
                (name.clone(), (base, len))
            })
            .collect();

        let token = state.token();
        state.modules.insert(
            token,
            SimModule {
                functions: parsed.functions,
                globals,
                textures: parsed.textures,
                surfaces: parsed.surfaces,
            },
        );
        debug!(device, module = token, "sim: loaded module");
        Ok(token)
    }

    fn module_unload(&self, module: u64) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .modules
            .remove(&module)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        for (base, _) in entry.globals.values() {
            state.allocations.remove(base);
        }
        state.functions.retain(|_, owner| *owner != module);
        Ok(())
    }

    fn module_get_function(&self, module: u64, name: &str) -> Result<u64> {
        let mut state = self.lock();
        let found = {
            let entry = state
                .modules
                .get(&module)
                .ok_or_else(|| Error::native(Status::InvalidHandle))?;
            entry.functions.iter().any(|f| f == name)
        };
        if !found {
            return Err(Error::native(Status::NotFound));
        }
        let token = state.token();
        state.functions.insert(token, module);
        Ok(token)
    }

    fn module_get_global(&self, module: u64, name: &str) -> Result<(u64, u64)> {
        let state = self.lock();
        let entry = state
            .modules
            .get(&module)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        entry
            .globals
            .get(name)
            .copied()
            .ok_or_else(|| Error::native(Status::NotFound))
    }

    fn module_get_texture(&self, module: u64, name: &str) -> Result<u64> {
        let mut state = self.lock();
        let found = {
            let entry = state
                .modules
                .get(&module)
                .ok_or_else(|| Error::native(Status::InvalidHandle))?;
            entry.textures.iter().any(|t| t == name)
        };
        if !found {
            return Err(Error::native(Status::NotFound));
        }
        Ok(state.token())
    }

    fn module_get_surface(&self, module: u64, name: &str) -> Result<u64> {
        let mut state = self.lock();
        let found = {
            let entry = state
                .modules
                .get(&module)
                .ok_or_else(|| Error::native(Status::InvalidHandle))?;
            entry.surfaces.iter().any(|s| s == name)
        };
        if !found {
            return Err(Error::native(Status::NotFound));
        }
        Ok(state.token())
    }

    fn link_create(&self, device: usize, _options: u64) -> Result<u64> {
        self.check_device(device)?;
        let mut state = self.lock();
        let token = state.token();
        state.links.insert(token, SimImage::default());
        Ok(token)
    }

    fn link_add_data(
        &self,
        session: u64,
        kind: FragmentKind,
        data: &[u8],
        name: &str,
        _options: u64,
    ) -> Result<()> {
        let fragment = match kind {
            FragmentKind::Source => {
                // Textual source: entry points are lines of the form
                // ".entry <name>".
                let text =
                    std::str::from_utf8(data).map_err(|_| Error::native(Status::InvalidImage))?;
                let mut image = SimImage::default();
                for line in text.lines() {
                    if let Some(entry) = line.trim().strip_prefix(".entry ") {
                        image.functions.push(entry.trim().to_string());
                    }
                }
                image
            }
            _ => SimImage::parse(data)?,
        };

        let mut state = self.lock();
        let link = state
            .links
            .get_mut(&session)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        link.merge(fragment);
        debug!(session, fragment = name, "sim: added link fragment");
        Ok(())
    }

    fn link_complete(&self, session: u64) -> Result<Vec<u8>> {
        let state = self.lock();
        let link = state
            .links
            .get(&session)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        Ok(link.to_bytes())
    }

    fn link_destroy(&self, session: u64) -> Result<()> {
        match self.lock().links.remove(&session) {
            Some(_) => Ok(()),
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn options_create(&self, pairs: &[(OptionKey, u64)]) -> Result<u64> {
        let mut state = self.lock();
        let token = state.token();
        state.options.insert(token, pairs.to_vec());
        self.options_created.fetch_add(1, Ordering::SeqCst);
        Ok(token)
    }

    fn options_destroy(&self, handle: u64) -> Result<()> {
        match self.lock().options.remove(&handle) {
            Some(_) => {
                self.options_destroyed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::native(Status::InvalidHandle)),
        }
    }

    fn options_output(&self, handle: u64) -> Result<OptionsOutput> {
        let state = self.lock();
        let pairs = state
            .options
            .get(&handle)
            .ok_or_else(|| Error::native(Status::InvalidHandle))?;
        let threads_per_block = pairs
            .iter()
            .find(|(k, _)| *k == OptionKey::ThreadsPerBlock)
            .map(|&(_, v)| v as u32);
        Ok(OptionsOutput {
            info_log: format!("{} options applied", pairs.len()),
            error_log: String::new(),
            wall_time_ms: 0.0,
            threads_per_block,
        })
    }

    fn launch_kernel(
        &self,
        device: usize,
        function: u64,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        shared_bytes: u32,
        stream: u64,
        params: &[u64],
    ) -> Result<()> {
        self.check_device(device)?;
        let mut state = self.lock();
        if !state.functions.contains_key(&function) {
            return Err(Error::native(Status::LaunchFailed));
        }
        if stream != crate::runtime::DEFAULT_STREAM && !state.streams.contains_key(&stream) {
            return Err(Error::native(Status::InvalidHandle));
        }
        state.launches.push(LaunchRecord {
            device,
            function,
            grid,
            block,
            shared_bytes,
            stream,
            params: params.to_vec(),
        });
        Ok(())
    }
}
