//! Authorization gate for privileged device operations.
//!
//! Module loading, link-session creation, peer-access changes and device
//! reconfiguration pass through an [`AccessPolicy`] before any native call.
//! The policy either returns or refuses with `NotPermitted`; the core never
//! implements the policy itself.

use crate::error::{Error, Result};

/// Tag naming a privileged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ModuleLoad,
    LinkCreate,
    PeerAccess,
    DeviceConfigure,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::ModuleLoad => "module load",
            Operation::LinkCreate => "link session",
            Operation::PeerAccess => "peer access",
            Operation::DeviceConfigure => "device configure",
        }
    }
}

/// Pass/fail gate invoked before privileged operations.
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, op: Operation) -> Result<()>;
}

/// Permits everything; the default policy.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _op: Operation) -> Result<()> {
        Ok(())
    }
}

/// Refuses a fixed set of operations; everything else passes.
#[derive(Debug, Default)]
pub struct DenyList {
    denied: Vec<Operation>,
}

impl DenyList {
    pub fn new(denied: impl Into<Vec<Operation>>) -> Self {
        Self {
            denied: denied.into(),
        }
    }
}

impl AccessPolicy for DenyList {
    fn authorize(&self, op: Operation) -> Result<()> {
        if self.denied.contains(&op) {
            Err(Error::NotPermitted(format!("{} denied by policy", op.name())))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authorize(Operation::ModuleLoad).is_ok());
    }

    #[test]
    fn test_deny_list() {
        let policy = DenyList::new(vec![Operation::ModuleLoad]);
        assert!(matches!(
            policy.authorize(Operation::ModuleLoad),
            Err(Error::NotPermitted(_))
        ));
        assert!(policy.authorize(Operation::LinkCreate).is_ok());
    }
}
