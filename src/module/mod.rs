//! Device code loading, linking and JIT options.

pub mod cache;
pub mod code;
pub mod linker;
pub mod options;

pub use cache::ModuleCache;
pub use code::{Function, Module, Symbol};
pub use linker::Linker;
pub use options::{CacheMode, FallbackStrategy, JitOptions};
