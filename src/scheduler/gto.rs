use super::Scheduler;

/// Greedy-then-oldest issue.
///
/// Keeps issuing the last warp for as long as it stays issuable, then
/// falls back to the oldest issuable warp. All warps launch together at
/// cycle zero, so age order is warp id order.
#[derive(Debug, Default)]
pub struct GreedyThenOldest {
    last_issued: Option<usize>,
}

impl GreedyThenOldest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for GreedyThenOldest {
    fn select(
        &mut self,
        num_warps: usize,
        issuable: &mut dyn FnMut(usize) -> bool,
    ) -> Option<usize> {
        if let Some(last) = self.last_issued {
            if issuable(last) {
                return Some(last);
            }
        }
        for warp_id in 0..num_warps {
            if Some(warp_id) != self.last_issued && issuable(warp_id) {
                self.last_issued = Some(warp_id);
                log::trace!("scheduler: greedy switch to warp {warp_id}");
                return Some(warp_id);
            }
        }
        None
    }
}
