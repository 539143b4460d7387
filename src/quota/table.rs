//! Per-category capacity and usage accounting.
//!
//! The table is pure bookkeeping with no I/O and no locking of its own.
//! All mutation happens inside the admission task, because an operation
//! reserves two categories at once and the pair must be granted or queued
//! atomically.

use super::Category;
use crate::config::GovernorConfig;

/// Tracks configured capacity and outstanding usage for every category.
///
/// A capacity of 0 means the category is unthrottled: reservations always
/// succeed and usage is still tracked for introspection.
#[derive(Debug, Clone, Default)]
pub struct QuotaTable {
    capacity: [u64; 4],
    in_use: [u64; 4],
}

impl QuotaTable {
    /// Create a table with every category unthrottled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table from a validated configuration.
    pub fn from_config(config: &GovernorConfig) -> Self {
        let mut table = Self::new();
        for cat in Category::ALL {
            table.configure(cat, config.capacity_for(cat));
        }
        table
    }

    /// Set the maximum capacity for a category (0 = unlimited).
    pub fn configure(&mut self, category: Category, capacity: u64) {
        self.capacity[category.index()] = capacity;
    }

    /// Configured capacity for a category.
    pub fn capacity(&self, category: Category) -> u64 {
        self.capacity[category.index()]
    }

    /// Sum of sizes of all currently granted leases for a category.
    pub fn in_use(&self, category: Category) -> u64 {
        self.in_use[category.index()]
    }

    /// Whether a reservation of `size` would fit right now.
    pub fn fits(&self, category: Category, size: u64) -> bool {
        let cap = self.capacity[category.index()];
        cap == 0 || self.in_use[category.index()].saturating_add(size) <= cap
    }

    /// Whether a reservation of `size` could ever fit, even on an empty
    /// table. A request failing this check must be rejected, not queued.
    pub fn can_ever_fit(&self, category: Category, size: u64) -> bool {
        let cap = self.capacity[category.index()];
        cap == 0 || size <= cap
    }

    /// Atomically reserve `size` if it fits, incrementing usage.
    ///
    /// Sizes come straight off the wire, and an unthrottled category
    /// accepts anything, so the increment saturates instead of wrapping.
    pub fn try_reserve(&mut self, category: Category, size: u64) -> bool {
        if self.fits(category, size) {
            let idx = category.index();
            self.in_use[idx] = self.in_use[idx].saturating_add(size);
            true
        } else {
            false
        }
    }

    /// Return `size` to the category. Usage never drops below zero.
    pub fn release(&mut self, category: Category, size: u64) {
        let idx = category.index();
        self.in_use[idx] = self.in_use[idx].saturating_sub(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited_table(cap: u64) -> QuotaTable {
        let mut table = QuotaTable::new();
        table.configure(Category::ReadBytes, cap);
        table
    }

    #[test]
    fn test_reserve_within_capacity() {
        let mut table = limited_table(100);
        assert!(table.try_reserve(Category::ReadBytes, 60));
        assert!(table.try_reserve(Category::ReadBytes, 40));
        assert_eq!(table.in_use(Category::ReadBytes), 100);
    }

    #[test]
    fn test_reserve_over_capacity_fails() {
        let mut table = limited_table(100);
        assert!(table.try_reserve(Category::ReadBytes, 80));
        assert!(!table.try_reserve(Category::ReadBytes, 21));
        // Failed reservation leaves usage untouched
        assert_eq!(table.in_use(Category::ReadBytes), 80);
    }

    #[test]
    fn test_zero_capacity_is_unlimited() {
        let mut table = QuotaTable::new();
        assert!(table.try_reserve(Category::WriteBytes, u64::MAX / 2));
        assert!(table.try_reserve(Category::WriteBytes, u64::MAX / 2));
        assert!(table.fits(Category::WriteBytes, u64::MAX));
    }

    #[test]
    fn test_unlimited_usage_saturates_instead_of_wrapping() {
        let mut table = QuotaTable::new();
        assert!(table.try_reserve(Category::WriteBytes, u64::MAX));
        assert!(table.try_reserve(Category::WriteBytes, u64::MAX));
        assert_eq!(table.in_use(Category::WriteBytes), u64::MAX);
        // Releases still walk usage back down from the ceiling
        table.release(Category::WriteBytes, u64::MAX);
        assert_eq!(table.in_use(Category::WriteBytes), 0);
    }

    #[test]
    fn test_release_round_trip() {
        let mut table = limited_table(100);
        let before = table.in_use(Category::ReadBytes);
        assert!(table.try_reserve(Category::ReadBytes, 37));
        table.release(Category::ReadBytes, 37);
        assert_eq!(table.in_use(Category::ReadBytes), before);
    }

    #[test]
    fn test_release_never_underflows() {
        let mut table = limited_table(100);
        table.release(Category::ReadBytes, 50);
        assert_eq!(table.in_use(Category::ReadBytes), 0);
    }

    #[test]
    fn test_can_ever_fit() {
        let table = limited_table(100);
        assert!(table.can_ever_fit(Category::ReadBytes, 100));
        assert!(!table.can_ever_fit(Category::ReadBytes, 101));
        // Unthrottled category accepts anything
        assert!(table.can_ever_fit(Category::WriteBytes, u64::MAX));
    }

    #[test]
    fn test_categories_are_independent() {
        let mut table = QuotaTable::new();
        table.configure(Category::ReadRequests, 1);
        table.configure(Category::WriteRequests, 1);
        assert!(table.try_reserve(Category::ReadRequests, 1));
        assert!(table.try_reserve(Category::WriteRequests, 1));
        assert!(!table.try_reserve(Category::ReadRequests, 1));
        table.release(Category::WriteRequests, 1);
        assert!(!table.try_reserve(Category::ReadRequests, 1));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Usage never exceeds a nonzero capacity, for any interleaving of
        /// reservations and releases of the reserved sizes.
        #[test]
        fn prop_usage_never_exceeds_capacity(
            cap in 1u64..10_000,
            ops in prop::collection::vec((0u64..5_000, any::<bool>()), 0..200),
        ) {
            let mut table = QuotaTable::new();
            table.configure(Category::ReadBytes, cap);
            let mut held: Vec<u64> = Vec::new();

            for (size, release_first) in ops {
                if release_first {
                    if let Some(size) = held.pop() {
                        table.release(Category::ReadBytes, size);
                    }
                }
                if table.try_reserve(Category::ReadBytes, size) {
                    held.push(size);
                }
                prop_assert!(table.in_use(Category::ReadBytes) <= cap);
            }
        }

        /// Reserving then releasing the same size restores the prior state.
        #[test]
        fn prop_reserve_release_round_trip(
            cap in 1u64..10_000,
            preload in 0u64..5_000,
            size in 0u64..5_000,
        ) {
            let mut table = QuotaTable::new();
            table.configure(Category::WriteBytes, cap);
            let _ = table.try_reserve(Category::WriteBytes, preload);
            let before = table.in_use(Category::WriteBytes);

            if table.try_reserve(Category::WriteBytes, size) {
                table.release(Category::WriteBytes, size);
            }
            prop_assert_eq!(table.in_use(Category::WriteBytes), before);
        }
    }
}
