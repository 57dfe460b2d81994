use parking_lot::Mutex;
use quarry_core::CostBreakdown;

/// Running cost total shared by the scheduler's result loop.
///
/// Merges happen only at worker terminal transitions. Because the sum is
/// exact integer arithmetic, the total is independent of completion order.
#[derive(Debug, Default)]
pub struct CostAccumulator {
    total: Mutex<CostBreakdown>,
}

impl CostAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing total.
    pub fn starting_at(total: CostBreakdown) -> Self {
        Self {
            total: Mutex::new(total),
        }
    }

    /// Adds `cost` and returns the new total.
    pub fn add(&self, cost: &CostBreakdown) -> CostBreakdown {
        let mut total = self.total.lock();
        *total += *cost;
        *total
    }

    pub fn snapshot(&self) -> CostBreakdown {
        *self.total.lock()
    }
}
