use crate::{error::Error, mem::MainMemory, Address};

/// One lane's contribution to a coalesced request.
///
/// `offset` is relative to the line base so the response can be
/// scatter-written back to the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneSlot {
    pub lane: usize,
    pub offset: u32,
    pub size: u32,
    pub write_data: u32,
}

/// A line-aligned request produced by the coalescer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub line_addr: Address,
    pub is_write: bool,
    pub warp_id: usize,
    /// Contributing lanes in ascending lane order.
    pub slots: Vec<LaneSlot>,
}

/// Outcome of one cache access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessResult {
    pub hit: bool,
    pub latency: u64,
    /// Per-lane read data, empty for writes.
    pub data: Vec<(usize, u32)>,
}

#[derive(Debug, Clone)]
struct Line {
    tag: Address,
    data: Box<[u8]>,
    valid: bool,
    dirty: bool,
    last_access: u64,
}

impl Line {
    fn new(line_size: usize) -> Self {
        Self {
            tag: 0,
            data: vec![0; line_size].into_boxed_slice(),
            valid: false,
            dirty: false,
            last_access: 0,
        }
    }
}

/// Set-associative write-back write-allocate cache with LRU replacement.
///
/// Lines are created inert and lazily populated from the backing store.
/// The cache is the only path between the execution pipeline and global
/// memory, so its counters fully describe the external traffic.
#[derive(Debug)]
pub struct Cache {
    line_size: u32,
    num_sets: u32,
    associativity: usize,
    memory_latency: u64,
    lines: Vec<Line>,
    pub stats: stats::Cache,
}

impl Cache {
    #[must_use]
    pub fn new(total_size: u32, line_size: u32, associativity: usize, memory_latency: u64) -> Self {
        let num_sets = total_size / (line_size * associativity as u32);
        let lines = (0..num_sets as usize * associativity)
            .map(|_| Line::new(line_size as usize))
            .collect();
        Self {
            line_size,
            num_sets,
            associativity,
            memory_latency,
            lines,
            stats: stats::Cache::default(),
        }
    }

    fn offset_bits(&self) -> u32 {
        self.line_size.trailing_zeros()
    }

    fn set_bits(&self) -> u32 {
        self.num_sets.trailing_zeros()
    }

    fn set_index(&self, addr: Address) -> u32 {
        (addr >> self.offset_bits()) & (self.num_sets - 1)
    }

    fn tag(&self, addr: Address) -> Address {
        addr >> (self.offset_bits() + self.set_bits())
    }

    fn line_base(&self, tag: Address, set: u32) -> Address {
        (tag << (self.offset_bits() + self.set_bits())) | (set << self.offset_bits())
    }

    /// Victim way for a miss in `set`: first invalid way, else the way
    /// with the oldest access, ties broken by the lowest way index.
    fn select_victim(&self, set: u32) -> usize {
        let base = set as usize * self.associativity;
        let ways = &self.lines[base..base + self.associativity];
        if let Some(way) = ways.iter().position(|line| !line.valid) {
            return way;
        }
        let mut victim = 0;
        let mut oldest = ways[0].last_access;
        for (way, line) in ways.iter().enumerate().skip(1) {
            if line.last_access < oldest {
                oldest = line.last_access;
                victim = way;
            }
        }
        victim
    }

    /// Service one coalesced request.
    ///
    /// On a miss the victim is written back if dirty, then the line is
    /// refilled from `mem` before the request is applied.
    pub fn access(
        &mut self,
        req: &Request,
        mem: &mut MainMemory,
        accesses: &mut stats::Accesses,
        time: u64,
    ) -> AccessResult {
        debug_assert_eq!(req.line_addr & (self.line_size - 1), 0);

        if req.is_write {
            self.stats.writes += 1;
        } else {
            self.stats.reads += 1;
        }

        let set = self.set_index(req.line_addr);
        let tag = self.tag(req.line_addr);
        let base = set as usize * self.associativity;

        let way = (0..self.associativity)
            .find(|way| {
                let line = &self.lines[base + way];
                line.valid && line.tag == tag
            });

        let (hit, way) = match way {
            Some(way) => {
                self.stats.hits += 1;
                (true, way)
            }
            None => {
                self.stats.misses += 1;
                let victim = self.select_victim(set);
                let line_base = self.line_base(tag, set);
                {
                    let line = &self.lines[base + victim];
                    if line.valid {
                        self.stats.evictions += 1;
                        if line.dirty {
                            let victim_base = self.line_base(line.tag, set);
                            mem.write_line(victim_base, &line.data);
                            self.stats.writebacks += 1;
                            accesses.dram_writes += 1;
                        }
                    }
                }
                let line = &mut self.lines[base + victim];
                mem.read_line(line_base, &mut line.data);
                accesses.dram_reads += 1;
                line.tag = tag;
                line.valid = true;
                line.dirty = false;
                (false, victim)
            }
        };

        let line = &mut self.lines[base + way];
        line.last_access = time;

        let mut data = Vec::new();
        for slot in &req.slots {
            let lo = slot.offset as usize;
            let hi = lo + slot.size as usize;
            debug_assert!(hi <= line.data.len());
            if req.is_write {
                let bytes = slot.write_data.to_le_bytes();
                line.data[lo..hi].copy_from_slice(&bytes[..slot.size as usize]);
            } else {
                let mut word = [0u8; 4];
                word[..slot.size as usize].copy_from_slice(&line.data[lo..hi]);
                data.push((slot.lane, u32::from_le_bytes(word)));
            }
        }
        if req.is_write {
            line.dirty = true;
        }

        let latency = if hit {
            1
        } else {
            self.memory_latency + u64::from(self.line_size / 16)
        };

        log::trace!(
            "cache::access(line={:08x}, write={}, lanes={}) => {} in {} cycles",
            req.line_addr,
            req.is_write,
            req.slots.len(),
            if hit { "HIT" } else { "MISS" },
            latency,
        );

        AccessResult { hit, latency, data }
    }

    /// Write back and invalidate the line holding `addr`, if present.
    ///
    /// Used by the atomic engine, which operates on the backing store and
    /// must not observe stale cached data.
    pub fn flush_line(
        &mut self,
        addr: Address,
        mem: &mut MainMemory,
        accesses: &mut stats::Accesses,
    ) {
        let line_addr = addr & !(self.line_size - 1);
        let set = self.set_index(line_addr);
        let tag = self.tag(line_addr);
        let base = set as usize * self.associativity;
        for way in 0..self.associativity {
            let line = &mut self.lines[base + way];
            if line.valid && line.tag == tag {
                if line.dirty {
                    mem.write_line(line_addr, &line.data);
                    self.stats.writebacks += 1;
                    accesses.dram_writes += 1;
                }
                line.valid = false;
                line.dirty = false;
            }
        }
    }

    /// Drain every dirty line into the backing store.
    ///
    /// Called once at the end of a run so the final memory contents are
    /// observable without probing cache internals. Not counted as
    /// writeback traffic.
    pub fn flush(&mut self, mem: &mut MainMemory) {
        let tag_shift = self.offset_bits() + self.set_bits();
        let offset_bits = self.offset_bits();
        for set in 0..self.num_sets {
            let base = set as usize * self.associativity;
            for way in 0..self.associativity {
                let line = &mut self.lines[base + way];
                if line.valid && line.dirty {
                    let line_addr = (line.tag << tag_shift) | (set << offset_bits);
                    mem.write_line(line_addr, &line.data);
                    line.dirty = false;
                }
            }
        }
    }

    /// Structural invariants checked after every event in debug builds.
    pub fn verify(&self) {
        for line in &self.lines {
            assert!(line.valid || !line.dirty, "invalid line cannot be dirty");
        }
        assert!(self.stats.is_consistent(), "hit/miss vs access count mismatch");
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, LaneSlot, Request};
    use crate::mem::MainMemory;

    fn read_req(line_addr: u32, lanes: usize) -> Request {
        Request {
            line_addr,
            is_write: false,
            warp_id: 0,
            slots: (0..lanes)
                .map(|lane| LaneSlot {
                    lane,
                    offset: lane as u32 * 4,
                    size: 4,
                    write_data: 0,
                })
                .collect(),
        }
    }

    fn write_req(line_addr: u32, offset: u32, value: u32) -> Request {
        Request {
            line_addr,
            is_write: true,
            warp_id: 0,
            slots: vec![LaneSlot {
                lane: 0,
                offset,
                size: 4,
                write_data: value,
            }],
        }
    }

    #[test]
    fn miss_then_hit() {
        // 4 sets x 2 ways x 64b lines
        let mut cache = Cache::new(512, 64, 2, 100);
        let mut mem = MainMemory::new();
        let mut accesses = stats::Accesses::default();
        mem.write_u32(0x100, 77).unwrap();

        let result = cache.access(&read_req(0x100, 1), &mut mem, &mut accesses, 1);
        assert!(!result.hit);
        assert_eq!(result.latency, 100 + 64 / 16);
        assert_eq!(result.data, vec![(0, 77)]);

        let result = cache.access(&read_req(0x100, 1), &mut mem, &mut accesses, 2);
        assert!(result.hit);
        assert_eq!(result.latency, 1);
        assert_eq!(cache.stats.hits, 1);
        assert_eq!(cache.stats.misses, 1);
        assert_eq!(accesses.dram_reads, 1);
        cache.verify();
    }

    #[test]
    fn write_allocate_and_writeback_on_eviction() {
        // direct-mapped with 2 sets so two conflicting lines are easy to build
        let mut cache = Cache::new(128, 64, 1, 10);
        let mut mem = MainMemory::new();
        let mut accesses = stats::Accesses::default();

        // dirty the line at 0x000
        cache.access(&write_req(0x000, 0, 0xabcd), &mut mem, &mut accesses, 1);
        assert_eq!(mem.read_u32(0x000).unwrap(), 0, "write-back defers the store");

        // conflicting line (same set, different tag) evicts and writes back
        cache.access(&read_req(0x100, 1), &mut mem, &mut accesses, 2);
        assert_eq!(mem.read_u32(0x000).unwrap(), 0xabcd);
        assert_eq!(cache.stats.evictions, 1);
        assert_eq!(cache.stats.writebacks, 1);
        assert_eq!(accesses.dram_writes, 1);
        cache.verify();
    }

    #[test]
    fn lru_victim_is_oldest_way_with_low_way_tiebreak() {
        // one set, 4 ways
        let mut cache = Cache::new(256, 64, 4, 10);
        let mut mem = MainMemory::new();
        let mut accesses = stats::Accesses::default();
        for (i, addr) in [0x000u32, 0x100, 0x200, 0x300].iter().enumerate() {
            cache.access(&read_req(*addr, 1), &mut mem, &mut accesses, i as u64 + 1);
        }
        // touch way 0 again so way 1 (0x100) becomes the oldest
        cache.access(&read_req(0x000, 1), &mut mem, &mut accesses, 10);
        cache.access(&read_req(0x400, 1), &mut mem, &mut accesses, 11);
        // 0x100 must be gone, everything else still resident
        let miss_before = cache.stats.misses;
        cache.access(&read_req(0x200, 1), &mut mem, &mut accesses, 12);
        cache.access(&read_req(0x300, 1), &mut mem, &mut accesses, 13);
        cache.access(&read_req(0x000, 1), &mut mem, &mut accesses, 14);
        assert_eq!(cache.stats.misses, miss_before);
        cache.access(&read_req(0x100, 1), &mut mem, &mut accesses, 15);
        assert_eq!(cache.stats.misses, miss_before + 1);
    }

    #[test]
    fn flush_drains_dirty_lines() {
        let mut cache = Cache::new(512, 64, 2, 10);
        let mut mem = MainMemory::new();
        let mut accesses = stats::Accesses::default();
        cache.access(&write_req(0x40, 4, 99), &mut mem, &mut accesses, 1);
        cache.flush(&mut mem);
        assert_eq!(mem.read_u32(0x44).unwrap(), 99);
        cache.verify();
    }

    #[test]
    fn flush_line_makes_backing_store_authoritative() {
        let mut cache = Cache::new(512, 64, 2, 10);
        let mut mem = MainMemory::new();
        let mut accesses = stats::Accesses::default();
        cache.access(&write_req(0x80, 0, 123), &mut mem, &mut accesses, 1);
        cache.flush_line(0x84, &mut mem, &mut accesses);
        assert_eq!(mem.read_u32(0x80).unwrap(), 123);
        // the next access misses because the line was invalidated
        let result = cache.access(&read_req(0x80, 1), &mut mem, &mut accesses, 2);
        assert!(!result.hit);
        assert_eq!(result.data, vec![(0, 123)]);
    }

    #[test]
    fn subword_read_is_zero_extended() {
        let mut cache = Cache::new(512, 64, 2, 10);
        let mut mem = MainMemory::new();
        let mut accesses = stats::Accesses::default();
        mem.write_u32(0x40, 0xffff_ff80).unwrap();
        let req = Request {
            line_addr: 0x40,
            is_write: false,
            warp_id: 0,
            slots: vec![LaneSlot {
                lane: 0,
                offset: 0,
                size: 1,
                write_data: 0,
            }],
        };
        let result = cache.access(&req, &mut mem, &mut accesses, 1);
        assert_eq!(result.data, vec![(0, 0x80)]);
    }
}
