//! Just-in-time compile and link options.
//!
//! A [`JitOptions`] value is an editable key/value set on the host side. It is
//! materialized into a native options handle only when a load or link call
//! needs one; editing after materialization invalidates the handle so the next
//! use rebuilds it. After the native call the handle is consumed: output
//! fields (logs, wall time, chosen thread count) are captured and the handle
//! is destroyed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::{HandleBox, NULL_HANDLE};
use crate::runtime::{NativeRuntime, OptionKey, OptionsOutput};

/// Instruction cache configuration requested from the JIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    L1Disabled,
    L1Enabled,
}

/// What to do when no exact-match binary exists for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackStrategy {
    /// Prefer a compatible binary over recompiling.
    #[default]
    PreferBinary,
    /// Prefer recompiling from embedded source.
    PreferSource,
}

#[derive(Default)]
struct OptState {
    pairs: BTreeMap<OptionKey, u64>,
    output: Option<OptionsOutput>,
}

/// Editable option set materialized on demand into a native handle.
///
/// Thread-safe: concurrent materialization converges on a single native
/// handle, with losing candidates destroyed immediately.
pub struct JitOptions {
    state: Mutex<OptState>,
    handle: HandleBox,
    /// Runtime that created the currently materialized handle, kept so edits
    /// can destroy it without a runtime argument.
    handle_runtime: Mutex<Option<Arc<dyn NativeRuntime>>>,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl JitOptions {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OptState::default()),
            handle: HandleBox::empty(),
            handle_runtime: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop any materialized handle so the next use rebuilds from the edited
    /// pairs. Destruction is best-effort.
    fn invalidate(&self) {
        let raw = self.handle.take();
        if raw != NULL_HANDLE {
            let runtime = self
                .handle_runtime
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(runtime) = runtime {
                if let Err(err) = runtime.options_destroy(raw) {
                    warn!(%err, "Stale options handle destroy failed");
                }
            }
        }
    }

    fn put(&self, key: OptionKey, value: u64) {
        self.lock().pairs.insert(key, value);
        self.invalidate();
    }

    /// Cap on registers per thread. Must be positive.
    pub fn max_registers(&mut self, count: u32) -> Result<&mut Self> {
        if count == 0 {
            return Err(Error::invalid_argument("max registers must be positive".to_string()));
        }
        self.put(OptionKey::MaxRegisters, count as u64);
        Ok(self)
    }

    /// Desired threads per block; the runtime reports the chosen value in the
    /// output. Must be positive.
    pub fn threads_per_block(&mut self, count: u32) -> Result<&mut Self> {
        if count == 0 {
            return Err(Error::invalid_argument(
                "threads per block must be positive".to_string(),
            ));
        }
        self.put(OptionKey::ThreadsPerBlock, count as u64);
        Ok(self)
    }

    /// Ask the runtime to record compile wall time.
    pub fn record_wall_time(&mut self, enabled: bool) -> &mut Self {
        self.put(OptionKey::RecordWallTime, enabled as u64);
        self
    }

    /// Size of the informational log buffer, at most `i32::MAX` bytes.
    pub fn info_log_buffer(&mut self, bytes: usize) -> Result<&mut Self> {
        if bytes > i32::MAX as usize {
            return Err(Error::invalid_argument(format!(
                "info log buffer size {bytes} exceeds {}",
                i32::MAX
            )));
        }
        self.put(OptionKey::InfoLogBufferSize, bytes as u64);
        Ok(self)
    }

    /// Size of the error log buffer, at most `i32::MAX` bytes.
    pub fn error_log_buffer(&mut self, bytes: usize) -> Result<&mut Self> {
        if bytes > i32::MAX as usize {
            return Err(Error::invalid_argument(format!(
                "error log buffer size {bytes} exceeds {}",
                i32::MAX
            )));
        }
        self.put(OptionKey::ErrorLogBufferSize, bytes as u64);
        Ok(self)
    }

    /// Optimization level 0 through 4.
    pub fn optimization_level(&mut self, level: u32) -> Result<&mut Self> {
        if level > 4 {
            return Err(Error::invalid_argument(format!(
                "optimization level {level} not in 0..=4"
            )));
        }
        self.put(OptionKey::OptimizationLevel, level as u64);
        Ok(self)
    }

    /// Numeric target architecture identifier.
    pub fn target_architecture(&mut self, arch: u32) -> &mut Self {
        self.put(OptionKey::TargetArchitecture, arch as u64);
        self
    }

    pub fn fallback_strategy(&mut self, strategy: FallbackStrategy) -> &mut Self {
        self.put(OptionKey::FallbackStrategy, strategy as u64);
        self
    }

    pub fn generate_debug_info(&mut self, enabled: bool) -> &mut Self {
        self.put(OptionKey::GenerateDebugInfo, enabled as u64);
        self
    }

    pub fn generate_line_info(&mut self, enabled: bool) -> &mut Self {
        self.put(OptionKey::GenerateLineInfo, enabled as u64);
        self
    }

    pub fn verbose_logging(&mut self, enabled: bool) -> &mut Self {
        self.put(OptionKey::VerboseLogging, enabled as u64);
        self
    }

    pub fn cache_mode(&mut self, mode: CacheMode) -> &mut Self {
        self.put(OptionKey::CacheMode, mode as u64);
        self
    }

    /// Native handle for the current pairs, creating one if none is live.
    ///
    /// Concurrent callers converge on one handle; a caller whose freshly
    /// created candidate loses the publication race destroys it before
    /// returning the winner.
    pub fn materialize(&self, runtime: &Arc<dyn NativeRuntime>) -> Result<u64> {
        let existing = self.handle.peek();
        if existing != NULL_HANDLE {
            return Ok(existing);
        }

        let pairs: Vec<(OptionKey, u64)> = self
            .lock()
            .pairs
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect();
        let candidate = runtime.options_create(&pairs)?;
        let winner = self.handle.publish(candidate);
        if winner != candidate {
            if let Err(err) = runtime.options_destroy(candidate) {
                warn!(%err, "Losing options candidate destroy failed");
            }
        } else {
            *self.handle_runtime.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(runtime.clone());
            debug!(handle = winner, pairs = pairs.len(), "Materialized options");
        }
        Ok(winner)
    }

    /// Capture output fields from the used handle and destroy it.
    ///
    /// Called after the native load or link the handle was passed to, on both
    /// success and failure paths. Best-effort; failures are logged only.
    pub(crate) fn consume(&self, runtime: &Arc<dyn NativeRuntime>) {
        let raw = self.handle.take();
        if raw == NULL_HANDLE {
            return;
        }
        self.handle_runtime
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match runtime.options_output(raw) {
            Ok(output) => self.lock().output = Some(output),
            Err(err) => warn!(%err, "Options output read failed"),
        }
        if let Err(err) = runtime.options_destroy(raw) {
            warn!(%err, "Options destroy failed");
        }
    }

    /// Informational log from the most recent use, if any.
    pub fn info_log(&self) -> Option<String> {
        self.lock().output.as_ref().map(|o| o.info_log.clone())
    }

    /// Error log from the most recent use, if any.
    pub fn error_log(&self) -> Option<String> {
        self.lock().output.as_ref().map(|o| o.error_log.clone())
    }

    /// Compile wall time from the most recent use, when recording was on.
    pub fn wall_time_ms(&self) -> Option<f32> {
        self.lock().output.as_ref().map(|o| o.wall_time_ms)
    }

    /// Threads per block the runtime selected during the most recent use.
    pub fn selected_threads_per_block(&self) -> Option<u32> {
        self.lock().output.as_ref().and_then(|o| o.threads_per_block)
    }
}

impl Drop for JitOptions {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl std::fmt::Debug for JitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitOptions")
            .field("pairs", &self.lock().pairs.len())
            .field("handle", &self.handle.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::SimRuntime;

    fn runtime() -> (Arc<SimRuntime>, Arc<dyn NativeRuntime>) {
        let rt = SimRuntime::new(1);
        let dynamic: Arc<dyn NativeRuntime> = rt.clone();
        (rt, dynamic)
    }

    #[test]
    fn test_setter_validation() {
        let mut options = JitOptions::new();
        assert!(options.optimization_level(5).is_err());
        assert!(options.optimization_level(4).is_ok());
        assert!(options.max_registers(0).is_err());
        assert!(options.info_log_buffer(i32::MAX as usize + 1).is_err());
    }

    #[test]
    fn test_materialize_then_consume() {
        let (rt, dynamic) = runtime();
        let mut options = JitOptions::new();
        options.threads_per_block(256).unwrap();
        options.record_wall_time(true);

        let handle = options.materialize(&dynamic).unwrap();
        assert_ne!(handle, NULL_HANDLE);
        // Repeated materialization reuses the live handle.
        assert_eq!(options.materialize(&dynamic).unwrap(), handle);
        assert_eq!(rt.options_created(), 1);

        options.consume(&dynamic);
        assert_eq!(rt.options_destroyed(), 1);
        assert_eq!(options.selected_threads_per_block(), Some(256));
        assert!(options.info_log().is_some());
    }

    #[test]
    fn test_edit_invalidates_handle() {
        let (rt, dynamic) = runtime();
        let mut options = JitOptions::new();

        let first = options.materialize(&dynamic).unwrap();
        options.verbose_logging(true);
        let second = options.materialize(&dynamic).unwrap();

        assert_ne!(first, second);
        // The stale handle was destroyed on edit.
        assert_eq!(rt.options_created(), 2);
        assert_eq!(rt.options_destroyed(), 1);
    }

    #[test]
    fn test_racy_materialization_converges() {
        let (rt, dynamic) = runtime();
        let options = Arc::new(JitOptions::new());

        let mut workers = Vec::new();
        for _ in 0..8 {
            let options = options.clone();
            let dynamic = dynamic.clone();
            workers.push(std::thread::spawn(move || {
                options.materialize(&dynamic).unwrap()
            }));
        }

        let handles: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        let winner = handles[0];
        assert!(handles.iter().all(|&h| h == winner));

        // Every losing candidate was destroyed; exactly one handle survives.
        assert_eq!(rt.options_created() - rt.options_destroyed(), 1);

        options.consume(&dynamic);
        assert_eq!(rt.options_created(), rt.options_destroyed());
    }
}
