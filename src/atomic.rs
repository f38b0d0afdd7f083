use crate::{cache::Cache, error::Error, mem::MainMemory, Address};
use std::collections::{HashMap, VecDeque};

/// Cycles from dequeue to response, one per pipeline stage after `Idle`
/// (`ReadMem -> Compute -> WriteMem -> Respond`).
pub const PIPELINE_LATENCY: u64 = 4;

/// Read-modify-write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Op {
    Add,
    Sub,
    Exch,
    Min,
    Max,
    And,
    Or,
    Xor,
    Cas,
    Inc,
    Dec,
}

impl Op {
    /// The post-image of the operation. The pre-image is always returned
    /// to the requesting lane.
    #[must_use]
    pub fn apply(self, pre: u32, data: u32, compare: u32) -> u32 {
        match self {
            Op::Add => pre.wrapping_add(data),
            Op::Sub => pre.wrapping_sub(data),
            Op::Exch => data,
            Op::Min => (pre as i32).min(data as i32) as u32,
            Op::Max => (pre as i32).max(data as i32) as u32,
            Op::And => pre & data,
            Op::Or => pre | data,
            Op::Xor => pre ^ data,
            Op::Cas => {
                if pre == compare {
                    data
                } else {
                    pre
                }
            }
            Op::Inc => pre.wrapping_add(1),
            Op::Dec => pre.wrapping_sub(1),
        }
    }
}

/// One lane's atomic request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub op: Op,
    pub addr: Address,
    pub data: u32,
    pub compare: u32,
    pub warp_id: usize,
    pub lane_id: usize,
}

/// A resolved request: the pre-image value and when the response fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub warp_id: usize,
    pub lane: usize,
    pub addr: Address,
    pub value: u32,
    pub finish_cycle: u64,
}

/// Linearizable RMW engine with per-address serialization.
///
/// An address is locked while an operation is anywhere in
/// `ReadMem..Respond`; later requests for the same address queue FIFO
/// behind it, each queueing counting one contention event.
#[derive(Debug, Default)]
pub struct Engine {
    queue_depth: usize,
    /// Finish cycles of in-flight and queued operations per address.
    inflight: HashMap<Address, VecDeque<u64>>,
    pub stats: stats::Atomics,
}

impl Engine {
    #[must_use]
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth,
            inflight: HashMap::new(),
            stats: stats::Atomics::default(),
        }
    }

    /// Whether `addr` is locked at `now`.
    #[must_use]
    pub fn is_locked(&self, addr: Address, now: u64) -> bool {
        self.inflight
            .get(&addr)
            .is_some_and(|queue| queue.iter().any(|&finish| finish > now))
    }

    fn prune(&mut self, now: u64) {
        self.inflight.retain(|_, queue| {
            while queue.front().is_some_and(|&finish| finish <= now) {
                queue.pop_front();
            }
            !queue.is_empty()
        });
    }

    /// Submit the active lanes of one atomic instruction, in ascending
    /// lane order.
    ///
    /// The memory side effects are applied immediately in queue order
    /// (the linearization order); only the response timing is staggered
    /// by the per-address serialization.
    pub fn submit(
        &mut self,
        requests: &[Request],
        now: u64,
        mem: &mut MainMemory,
        cache: &mut Cache,
        accesses: &mut stats::Accesses,
    ) -> Result<Vec<Completion>, Error> {
        self.prune(now);

        // the cache must not hold a stale copy of anything we RMW
        for req in requests {
            cache.flush_line(req.addr, mem, accesses);
        }

        let mut completions = Vec::with_capacity(requests.len());
        for req in requests {
            if req.addr % 4 != 0 {
                return Err(Error::AlignmentFault { addr: req.addr, size: 4 });
            }
            let queue = self.inflight.entry(req.addr).or_default();
            if queue.len() >= self.queue_depth {
                return Err(Error::AtomicBackpressure { addr: req.addr });
            }
            let contended = !queue.is_empty();
            let start = queue.back().copied().unwrap_or(now).max(now);
            let finish = start + PIPELINE_LATENCY;
            queue.push_back(finish);

            let pre = mem.read_u32(req.addr)?;
            let post = req.op.apply(pre, req.data, req.compare);
            mem.write_u32(req.addr, post)?;

            self.stats.ops += 1;
            if contended {
                self.stats.contentions += 1;
            }

            log::trace!(
                "atomic::{}({:08x}) warp={} lane={} pre={} post={} finish={}",
                req.op,
                req.addr,
                req.warp_id,
                req.lane_id,
                pre,
                post,
                finish,
            );

            completions.push(Completion {
                warp_id: req.warp_id,
                lane: req.lane_id,
                addr: req.addr,
                value: pre,
                finish_cycle: finish,
            });
        }
        Ok(completions)
    }
}

#[cfg(test)]
mod tests {
    use super::{Engine, Op, Request, PIPELINE_LATENCY};
    use crate::{cache::Cache, mem::MainMemory};

    fn setup() -> (MainMemory, Cache, stats::Accesses) {
        (MainMemory::new(), Cache::new(512, 64, 2, 10), stats::Accesses::default())
    }

    fn add_req(lane: usize, addr: u32, data: u32) -> Request {
        Request { op: Op::Add, addr, data, compare: 0, warp_id: 0, lane_id: lane }
    }

    #[test]
    fn contended_adds_return_every_pre_image() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(64);
        let reqs: Vec<_> = (0..32).map(|lane| add_req(lane, 0x200, 1)).collect();
        let completions = engine.submit(&reqs, 5, &mut mem, &mut cache, &mut accesses).unwrap();

        assert_eq!(mem.read_u32(0x200).unwrap(), 32);
        let values: Vec<_> = completions.iter().map(|c| c.value).collect();
        assert_eq!(values, (0..32).collect::<Vec<_>>());
        assert_eq!(engine.stats.ops, 32);
        assert_eq!(engine.stats.contentions, 31);
        // responses are strictly serialized
        assert_eq!(completions[0].finish_cycle, 5 + PIPELINE_LATENCY);
        assert_eq!(completions[31].finish_cycle, 5 + 32 * PIPELINE_LATENCY);
    }

    #[test]
    fn distinct_addresses_do_not_contend() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(64);
        let reqs: Vec<_> = (0..4).map(|lane| add_req(lane, 0x100 + lane as u32 * 4, 1)).collect();
        let completions = engine.submit(&reqs, 0, &mut mem, &mut cache, &mut accesses).unwrap();
        assert_eq!(engine.stats.contentions, 0);
        assert!(completions.iter().all(|c| c.finish_cycle == PIPELINE_LATENCY));
    }

    #[test]
    fn add_then_sub_round_trips() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(64);
        mem.write_u32(0x40, 1000).unwrap();

        let add = add_req(0, 0x40, 123);
        let first = engine.submit(&[add], 0, &mut mem, &mut cache, &mut accesses).unwrap();
        let sub = Request { op: Op::Sub, ..add };
        let second = engine
            .submit(&[sub], first[0].finish_cycle, &mut mem, &mut cache, &mut accesses)
            .unwrap();

        assert_eq!(mem.read_u32(0x40).unwrap(), 1000);
        assert_eq!(first[0].value, 1000);
        assert_eq!(second[0].value, 1123);
        assert_eq!(engine.stats.contentions, 0);
    }

    #[test]
    fn cas_only_swaps_on_match() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(64);
        mem.write_u32(0x80, 7).unwrap();

        let miss = Request { op: Op::Cas, addr: 0x80, data: 99, compare: 3, warp_id: 0, lane_id: 0 };
        let c = engine.submit(&[miss], 0, &mut mem, &mut cache, &mut accesses).unwrap();
        assert_eq!(c[0].value, 7);
        assert_eq!(mem.read_u32(0x80).unwrap(), 7);

        let hit = Request { compare: 7, ..miss };
        let c = engine.submit(&[hit], 100, &mut mem, &mut cache, &mut accesses).unwrap();
        assert_eq!(c[0].value, 7);
        assert_eq!(mem.read_u32(0x80).unwrap(), 99);
    }

    #[test]
    fn signed_min_max() {
        assert_eq!(Op::Min.apply(5, (-3i32) as u32, 0), (-3i32) as u32);
        assert_eq!(Op::Max.apply(5, (-3i32) as u32, 0), 5);
    }

    #[test]
    fn queue_overflow_is_backpressure() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(4);
        let reqs: Vec<_> = (0..5).map(|lane| add_req(lane, 0x10, 1)).collect();
        let err = engine.submit(&reqs, 0, &mut mem, &mut cache, &mut accesses).unwrap_err();
        assert_eq!(err, crate::error::Error::AtomicBackpressure { addr: 0x10 });
    }

    #[test]
    fn lock_expires_after_completion() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(64);
        let c = engine
            .submit(&[add_req(0, 0x20, 1)], 0, &mut mem, &mut cache, &mut accesses)
            .unwrap();
        assert!(engine.is_locked(0x20, 1));
        assert!(!engine.is_locked(0x20, c[0].finish_cycle));
    }

    #[test]
    fn atomic_sees_dirty_cached_data() {
        let (mut mem, mut cache, mut accesses) = setup();
        let mut engine = Engine::new(64);
        // a normal store left the value only in the cache
        let req = crate::cache::Request {
            line_addr: 0x40,
            is_write: true,
            warp_id: 0,
            slots: vec![crate::cache::LaneSlot { lane: 0, offset: 0, size: 4, write_data: 50 }],
        };
        cache.access(&req, &mut mem, &mut accesses, 1);
        let c = engine
            .submit(&[add_req(0, 0x40, 5)], 2, &mut mem, &mut cache, &mut accesses)
            .unwrap();
        assert_eq!(c[0].value, 50);
        assert_eq!(mem.read_u32(0x40).unwrap(), 55);
    }
}
