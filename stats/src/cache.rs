use serde::{Deserialize, Serialize};

/// Counters for one cache instance.
///
/// Invariant: `hits + misses == reads + writes` after every access.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub reads: u64,
    pub writes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
}

impl Cache {
    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.reads + self.writes
    }

    /// Fraction of accesses served without going to the backing store.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    /// The bookkeeping identity that must hold after every access.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.hits + self.misses == self.reads + self.writes
    }
}

#[cfg(test)]
mod tests {
    use super::Cache;

    #[test]
    fn hit_rate() {
        let cache = Cache {
            reads: 3,
            writes: 1,
            hits: 3,
            misses: 1,
            ..Cache::default()
        };
        assert!(cache.is_consistent());
        assert!((cache.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
