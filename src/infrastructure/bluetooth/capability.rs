//! Platform capability grants (scan / connect permissions).
//!
//! The platform glue owns the permission dialogs; this core only consults the
//! current grant before every radio operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Scan,
    Connect,
}

#[derive(Debug)]
struct Grants {
    scan: AtomicBool,
    connect: AtomicBool,
}

/// Shared, cheaply cloneable view of the current grants
#[derive(Debug, Clone)]
pub struct Capabilities {
    grants: Arc<Grants>,
}

impl Capabilities {
    pub fn new(scan: bool, connect: bool) -> Self {
        Self {
            grants: Arc::new(Grants {
                scan: AtomicBool::new(scan),
                connect: AtomicBool::new(connect),
            }),
        }
    }

    pub fn granted_all() -> Self {
        Self::new(true, true)
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.flag(capability).load(Ordering::Acquire)
    }

    pub fn grant(&self, capability: Capability) {
        self.flag(capability).store(true, Ordering::Release);
    }

    pub fn revoke(&self, capability: Capability) {
        self.flag(capability).store(false, Ordering::Release);
    }

    fn flag(&self, capability: Capability) -> &AtomicBool {
        match capability {
            Capability::Scan => &self.grants.scan,
            Capability::Connect => &self.grants.connect,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::granted_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revoke_is_visible_to_clones() {
        let caps = Capabilities::granted_all();
        let view = caps.clone();

        caps.revoke(Capability::Connect);
        assert!(!view.is_granted(Capability::Connect));
        assert!(view.is_granted(Capability::Scan));

        caps.grant(Capability::Connect);
        assert!(view.is_granted(Capability::Connect));
    }
}
