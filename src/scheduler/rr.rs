use super::Scheduler;

/// Round-robin issue.
///
/// Examines warps `p, p+1, .., p+n-1 (mod n)` and issues the first
/// issuable one, then moves the pointer just past it. The fixed probe
/// order is part of the determinism contract.
#[derive(Debug, Default)]
pub struct RoundRobin {
    pointer: usize,
}

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn select(
        &mut self,
        num_warps: usize,
        issuable: &mut dyn FnMut(usize) -> bool,
    ) -> Option<usize> {
        for i in 0..num_warps {
            let warp_id = (self.pointer + i) % num_warps;
            if issuable(warp_id) {
                self.pointer = (warp_id + 1) % num_warps;
                log::trace!("scheduler: issue warp {warp_id}, pointer now {}", self.pointer);
                return Some(warp_id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::RoundRobin;
    use crate::scheduler::Scheduler;

    #[test]
    fn rotates_past_the_issued_warp() {
        let mut rr = RoundRobin::new();
        assert_eq!(rr.select(4, &mut |_| true), Some(0));
        assert_eq!(rr.select(4, &mut |_| true), Some(1));
        assert_eq!(rr.select(4, &mut |_| true), Some(2));
        assert_eq!(rr.select(4, &mut |_| true), Some(3));
        assert_eq!(rr.select(4, &mut |_| true), Some(0));
    }

    #[test]
    fn skips_unready_warps() {
        let mut rr = RoundRobin::new();
        assert_eq!(rr.select(4, &mut |w| w == 2), Some(2));
        // pointer moved past 2, warp 3 is probed first now
        assert_eq!(rr.select(4, &mut |w| w == 2 || w == 3), Some(3));
    }

    #[test]
    fn idle_cycle_leaves_pointer_in_place() {
        let mut rr = RoundRobin::new();
        assert_eq!(rr.select(4, &mut |_| false), None);
        assert_eq!(rr.select(4, &mut |_| true), Some(0));
    }
}
