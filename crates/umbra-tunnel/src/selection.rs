//! Round-robin distribution of user traffic across ready circuits.

/// Cycles a persistent index over the sorted ready circuit ids.
///
/// Pure policy: the caller hands in the current ready set, sorted, and gets
/// back the next circuit id or `None` when nothing is usable.
pub struct RoundRobin {
    index: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        // Wraps to 0 on the first selection.
        Self { index: usize::MAX }
    }

    /// Next circuit id from the sorted ready set.
    pub fn select(&mut self, sorted_ready: &[u32]) -> Option<u32> {
        if sorted_ready.is_empty() {
            return None;
        }
        self.index = self.index.wrapping_add(1) % sorted_ready.len();
        Some(sorted_ready[self.index])
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yields_none() {
        let mut rr = RoundRobin::new();
        assert_eq!(rr.select(&[]), None);
    }

    #[test]
    fn test_cycles_in_order() {
        let mut rr = RoundRobin::new();
        let ready = [3, 7, 9];
        assert_eq!(rr.select(&ready), Some(3));
        assert_eq!(rr.select(&ready), Some(7));
        assert_eq!(rr.select(&ready), Some(9));
        assert_eq!(rr.select(&ready), Some(3));
    }

    #[test]
    fn test_shrinking_set_stays_in_bounds() {
        let mut rr = RoundRobin::new();
        let ready = [1, 2, 3];
        rr.select(&ready);
        rr.select(&ready);
        // Set shrinks underneath the cycling index.
        assert!(matches!(rr.select(&[5]), Some(5)));
    }
}
