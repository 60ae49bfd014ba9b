//! Incremental link sessions.
//!
//! A [`Linker`] accumulates code fragments and produces a loadable image.
//! Creation-time options live as long as the session; per-fragment options
//! are consumed right after each add. The session must be explicitly
//! [`destroy`](Linker::destroy)ed, whether or not it completed.

use bytes::Bytes;
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::exec::deny_callback_context;
use crate::handle::{HandleBox, NULL_HANDLE};
use crate::module::options::JitOptions;
use crate::policy::Operation;
use crate::runtime::FragmentKind;

/// An open link session on one device.
pub struct Linker {
    ctx: Context,
    device: usize,
    handle: HandleBox,
    /// Creation options stay materialized for the whole session and are
    /// consumed at destroy time.
    creation_options: Option<JitOptions>,
}

impl Linker {
    /// Open a link session. Requires [`Operation::LinkCreate`] authorization.
    ///
    /// `options` ownership moves into the session; read its output fields
    /// back after [`destroy`](Linker::destroy).
    pub fn new(ctx: &Context, device: usize, options: Option<JitOptions>) -> Result<Self> {
        deny_callback_context("link session creation")?;
        ctx.policy().authorize(Operation::LinkCreate)?;

        let runtime = ctx.runtime();
        let options_raw = match &options {
            Some(opts) => opts.materialize(runtime)?,
            None => NULL_HANDLE,
        };

        let raw = runtime.link_create(device, options_raw)?;
        debug!(device, "Opened link session");

        Ok(Self {
            ctx: ctx.clone(),
            device,
            handle: HandleBox::new(raw),
            creation_options: options,
        })
    }

    pub fn device(&self) -> usize {
        self.device
    }

    /// Feed one code fragment into the session.
    ///
    /// `name` labels the fragment in linker logs. Per-fragment `options` are
    /// consumed after the add, success or not. Returns `self` so adds chain.
    pub fn add(
        &mut self,
        kind: FragmentKind,
        data: &[u8],
        name: &str,
        options: Option<&JitOptions>,
    ) -> Result<&mut Self> {
        deny_callback_context("link add")?;
        let runtime = self.ctx.runtime();
        let options_raw = match options {
            Some(opts) => opts.materialize(runtime)?,
            None => NULL_HANDLE,
        };

        let added = runtime.link_add_data(self.handle.get()?, kind, data, name, options_raw);
        if let Some(opts) = options {
            opts.consume(runtime);
        }
        added?;
        debug!(device = self.device, fragment = name, ?kind, "Added fragment");
        Ok(self)
    }

    /// Run the link and return the resulting loadable image.
    ///
    /// The session stays open; the image must be loaded (or discarded) and
    /// the session destroyed separately.
    pub fn complete(&self) -> Result<Bytes> {
        deny_callback_context("link complete")?;
        let image = self.ctx.runtime().link_complete(self.handle.get()?)?;
        debug!(device = self.device, bytes = image.len(), "Link complete");
        Ok(Bytes::from(image))
    }

    /// Tear down the session and release creation options. Idempotent.
    pub fn destroy(&mut self) -> Result<()> {
        if let Some(opts) = &self.creation_options {
            opts.consume(self.ctx.runtime());
        }
        let raw = self.handle.take();
        if raw != NULL_HANDLE {
            self.ctx.runtime().link_destroy(raw)?;
            debug!(device = self.device, "Destroyed link session");
        }
        Ok(())
    }

    /// Creation options, for reading output fields after destroy.
    pub fn options(&self) -> Option<&JitOptions> {
        self.creation_options.as_ref()
    }
}

impl std::fmt::Debug for Linker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linker")
            .field("device", &self.device)
            .field("handle", &self.handle.peek())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::module::code::Module;
    use crate::policy::DenyList;
    use crate::runtime::sim::{SimImage, SimRuntime};
    use std::sync::Arc;

    #[test]
    fn test_link_then_load() {
        let ctx = Context::new(SimRuntime::new(1));
        let mut linker = Linker::new(&ctx, 0, None).unwrap();

        let object = SimImage::default().with_function("gemm").to_bytes();
        linker
            .add(FragmentKind::Object, &object, "gemm.o", None)
            .unwrap()
            .add(FragmentKind::Source, b".entry relu\n", "relu.src", None)
            .unwrap();

        let image = linker.complete().unwrap();
        linker.destroy().unwrap();
        linker.destroy().unwrap();
        assert!(matches!(linker.complete(), Err(Error::InvalidState(_))));

        let module = Module::load(&ctx, 0, &image, None).unwrap();
        assert!(module.function("gemm").is_ok());
        assert!(module.function("relu").is_ok());
        module.unload().unwrap();
    }

    #[test]
    fn test_creation_requires_authorization() {
        let ctx = Context::new(SimRuntime::new(1))
            .with_policy(Arc::new(DenyList::new(vec![Operation::LinkCreate])));
        assert!(matches!(
            Linker::new(&ctx, 0, None),
            Err(Error::NotPermitted(_))
        ));
    }

    #[test]
    fn test_options_accounting() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt.clone());

        let mut creation = JitOptions::new();
        creation.record_wall_time(true);
        let mut per_add = JitOptions::new();
        per_add.verbose_logging(true);

        let mut linker = Linker::new(&ctx, 0, Some(creation)).unwrap();
        // Creation options stay live across adds.
        assert_eq!(rt.options_created() - rt.options_destroyed(), 1);

        let object = SimImage::default().with_function("axpy").to_bytes();
        linker
            .add(FragmentKind::Object, &object, "axpy.o", Some(&per_add))
            .unwrap();
        // Per-add options were consumed immediately.
        assert_eq!(rt.options_created() - rt.options_destroyed(), 1);
        assert!(per_add.info_log().is_some());

        linker.complete().unwrap();
        linker.destroy().unwrap();
        assert_eq!(rt.options_created(), rt.options_destroyed());
        assert!(linker.options().unwrap().info_log().is_some());
    }

    #[test]
    fn test_bad_fragment_consumes_options() {
        let rt = SimRuntime::new(1);
        let ctx = Context::new(rt.clone());

        let mut per_add = JitOptions::new();
        per_add.verbose_logging(true);

        let mut linker = Linker::new(&ctx, 0, None).unwrap();
        assert!(linker
            .add(FragmentKind::Object, b"garbage", "bad.o", Some(&per_add))
            .is_err());
        assert_eq!(rt.options_created(), rt.options_destroyed());

        linker.destroy().unwrap();
    }
}
