//! Memory budget derivation
//!
//! Turns raw probe readings into byte budgets: subtract a safety margin,
//! round down to a granularity, and halve for sort working space.

use crate::probe::MemoryProbe;

pub const GIB: u64 = 1 << 30;
pub const MIB: u64 = 1 << 20;

/// Margins and rounding applied to probe readings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BudgetPolicy {
    /// Host memory always left untouched
    pub host_margin: u64,
    /// Accelerator memory always left untouched
    pub device_margin: u64,
    /// Budgets are rounded down to a multiple of this
    pub granularity: u64,
}

impl BudgetPolicy {
    /// Zero margins and byte granularity: probe readings become budgets as-is.
    pub fn exact() -> Self {
        Self {
            host_margin: 0,
            device_margin: 0,
            granularity: 1,
        }
    }

    /// Budget for holding store elements in memory
    pub fn store_budget(&self, probe: &dyn MemoryProbe) -> u64 {
        self.reserve(probe.available_memory(), self.host_margin)
    }

    /// Budget for one split batch of the external sort.
    ///
    /// Half of the host budget, capped by half of the device budget when an
    /// accelerator is present since the batch must fit there too.
    pub fn chunk_budget(&self, probe: &dyn MemoryProbe) -> u64 {
        let host = self.store_budget(probe) / 2;
        match probe.available_device_memory() {
            Some(device) => host.min(self.reserve(device, self.device_margin) / 2),
            None => host,
        }
    }

    fn reserve(&self, available: u64, margin: u64) -> u64 {
        let remainder = available.saturating_sub(margin);
        let granularity = self.granularity.max(1);
        remainder - remainder % granularity
    }
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            host_margin: GIB,
            device_margin: 256 * MIB,
            granularity: GIB,
        }
    }
}
