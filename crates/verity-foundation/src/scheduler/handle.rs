//! Reference-counted access to a resident unit.

use std::fmt;
use std::sync::Arc;

use verity_kernel::model::ModelUnitDescriptor;
use verity_kernel::stage::ResidentUnit;

use super::SchedulerInner;

/// Holds one reference on a resident unit. The unit cannot be evicted while
/// any handle is alive; dropping the handle releases the reference without
/// unloading the unit.
pub struct UnitHandle {
    descriptor: ModelUnitDescriptor,
    scheduler: Arc<SchedulerInner>,
}

impl UnitHandle {
    pub(super) fn new(scheduler: Arc<SchedulerInner>, descriptor: ModelUnitDescriptor) -> Self {
        Self {
            descriptor,
            scheduler,
        }
    }

    pub fn unit_id(&self) -> &str {
        &self.descriptor.id
    }
}

impl ResidentUnit for UnitHandle {
    fn descriptor(&self) -> &ModelUnitDescriptor {
        &self.descriptor
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        self.scheduler.release_ref(&self.descriptor.id);
    }
}

impl fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHandle")
            .field("unit", &self.descriptor.id)
            .finish()
    }
}
