//! The workspace: everything known about one analyzed task.

use crate::cfg::CfgCollection;
use crate::hard::Platform;
use crate::prog::Process;
use crate::prop::PropList;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct WorkSpace {
    pub process: Process,
    pub platform: Platform,
    /// The current CFG collection; transformation passes replace it.
    pub coll: Option<CfgCollection>,
    /// Workspace-level annotations.
    pub props: PropList,
    cancelled: Arc<AtomicBool>,
}

impl WorkSpace {
    pub fn new(process: Process, platform: Platform) -> Self {
        Self {
            process,
            platform,
            coll: None,
            props: PropList::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation probe, checked at pass boundaries and
    /// worklist pops.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Shareable flag for an external timeout monitor.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancelled
    }

    pub fn collection(&self) -> &CfgCollection {
        self.coll
            .as_ref()
            .expect("CFG construction runs before any consumer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prog::Process;

    #[test]
    fn test_cancellation_flag() {
        let ws = WorkSpace::new(Process::builder("t").build(), Platform::default());
        assert!(!ws.is_cancelled());

        let handle = ws.cancel_handle();
        handle.store(true, Ordering::Relaxed);
        assert!(ws.is_cancelled());
    }
}
