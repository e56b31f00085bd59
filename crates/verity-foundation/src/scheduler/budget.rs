//! Device memory accounting for resident model units.

/// Tracks how much of the device budget resident (and loading) units occupy.
///
/// The safety margin is held back permanently: `used_mb` can never grow past
/// `capacity_mb - margin_mb`.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    capacity_mb: u64,
    used_mb: u64,
    margin_mb: u64,
    peak_used_mb: u64,
}

impl MemoryBudget {
    pub fn new(capacity_mb: u64, margin_mb: u64) -> Self {
        Self {
            capacity_mb,
            used_mb: 0,
            margin_mb,
            peak_used_mb: 0,
        }
    }

    pub fn capacity_mb(&self) -> u64 {
        self.capacity_mb
    }

    pub fn used_mb(&self) -> u64 {
        self.used_mb
    }

    pub fn margin_mb(&self) -> u64 {
        self.margin_mb
    }

    pub fn peak_used_mb(&self) -> u64 {
        self.peak_used_mb
    }

    /// Ceiling for `used_mb`.
    pub fn usable_mb(&self) -> u64 {
        self.capacity_mb.saturating_sub(self.margin_mb)
    }

    /// Memory still available to new units.
    pub fn available_mb(&self) -> u64 {
        self.usable_mb().saturating_sub(self.used_mb)
    }

    /// Usage of the usable budget as a percentage (0.0–100.0).
    pub fn usage_percent(&self) -> f64 {
        let usable = self.usable_mb();
        if usable == 0 {
            return 100.0;
        }
        (self.used_mb as f64 / usable as f64) * 100.0
    }

    /// Claims `amount_mb`. Returns `false` and changes nothing when it does not fit.
    pub fn allocate(&mut self, amount_mb: u64) -> bool {
        if amount_mb > self.available_mb() {
            return false;
        }
        self.used_mb += amount_mb;
        self.peak_used_mb = self.peak_used_mb.max(self.used_mb);
        true
    }

    pub fn release(&mut self, amount_mb: u64) {
        self.used_mb = self.used_mb.saturating_sub(amount_mb);
    }
}
