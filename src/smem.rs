use crate::{error::Error, Address};
use std::collections::BTreeMap;

/// One lane's shared memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneRequest {
    pub lane: usize,
    /// Absolute address inside the shared memory window.
    pub addr: Address,
    pub size: u32,
    pub write_data: u32,
}

/// Outcome of one warp-level shared memory access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessOutcome {
    /// Serialization rounds consumed, 1 for a conflict-free access.
    pub cycles: u64,
    /// Per-lane read data, empty for writes.
    pub data: Vec<(usize, u32)>,
}

/// Word-interleaved banked scratchpad.
///
/// Bank of a word is `word_index mod num_banks`. Lanes hitting the same
/// word in a bank broadcast in one round; lanes hitting distinct words in
/// the same bank are serialized into extra conflict rounds.
#[derive(Debug)]
pub struct SharedMemory {
    base: Address,
    size: u32,
    num_banks: usize,
    words: Box<[u32]>,
    pub stats: stats::SharedMem,
}

impl SharedMemory {
    #[must_use]
    pub fn new(base: Address, size: u32, num_banks: usize) -> Self {
        debug_assert!(num_banks.is_power_of_two());
        debug_assert_eq!(size % 4, 0);
        Self {
            base,
            size,
            num_banks,
            words: vec![0; size as usize / 4].into_boxed_slice(),
            stats: stats::SharedMem::default(),
        }
    }

    fn offset_of(&self, req: &LaneRequest) -> Result<u32, Error> {
        let offset = req.addr.wrapping_sub(self.base);
        if offset.checked_add(req.size).map_or(true, |end| end > self.size) {
            return Err(Error::InvalidAddress { addr: req.addr });
        }
        if offset % req.size != 0 {
            return Err(Error::AlignmentFault { addr: req.addr, size: req.size });
        }
        Ok(offset)
    }

    fn read_word_slice(&self, word_index: usize, offset: u32, size: u32) -> u32 {
        let word = self.words[word_index];
        let shift = (offset % 4) * 8;
        let mask = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };
        (word >> shift) & mask
    }

    fn write_word_slice(&mut self, word_index: usize, offset: u32, size: u32, value: u32) {
        let shift = (offset % 4) * 8;
        let mask: u32 = match size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        };
        let word = &mut self.words[word_index];
        *word = (*word & !(mask << shift)) | ((value & mask) << shift);
    }

    /// Arbitrate and perform one warp-level access.
    ///
    /// Follows `Idle -> Arbitrate -> BankConflict* -> Access -> Broadcast`:
    /// each round claims at most one word per bank (first pending lane in
    /// lane order wins), lanes sharing that word join the round, the rest
    /// are deferred into the next conflict round.
    pub fn access(
        &mut self,
        requests: &[LaneRequest],
        is_write: bool,
    ) -> Result<AccessOutcome, Error> {
        // resolve and bounds-check everything up front so a faulting lane
        // cannot leave a partial write behind
        let mut pending: Vec<(LaneRequest, u32, usize)> = Vec::with_capacity(requests.len());
        for req in requests {
            let offset = self.offset_of(req)?;
            pending.push((*req, offset, offset as usize / 4));
        }
        debug_assert!(pending.windows(2).all(|w| w[0].0.lane < w[1].0.lane));

        let mut data = Vec::new();
        let mut rounds: u64 = 0;

        while !pending.is_empty() {
            rounds += 1;
            let mut claimed: BTreeMap<usize, usize> = BTreeMap::new();
            let mut deferred = Vec::new();

            for (req, offset, word_index) in pending {
                let bank = word_index % self.num_banks;
                match claimed.get(&bank) {
                    Some(&word) if word != word_index => {
                        deferred.push((req, offset, word_index));
                        continue;
                    }
                    _ => {
                        claimed.insert(bank, word_index);
                    }
                }
                if is_write {
                    self.write_word_slice(word_index, offset, req.size, req.write_data);
                } else {
                    data.push((req.lane, self.read_word_slice(word_index, offset, req.size)));
                }
            }
            pending = deferred;
        }

        if rounds == 0 {
            // all lanes were inactive; still a single-cycle slot
            rounds = 1;
        }
        self.stats.accesses += 1;
        self.stats.bank_conflicts += rounds - 1;

        log::trace!(
            "smem::access(lanes={}, write={}) => {} round(s)",
            requests.len(),
            is_write,
            rounds,
        );

        Ok(AccessOutcome { cycles: rounds, data })
    }

    /// Preload an initial layout, used by the program loader for the
    /// `.shared` segment.
    pub fn load_segment(&mut self, offset: Address, bytes: &[u8]) -> Result<(), Error> {
        let end = offset as usize + bytes.len();
        if end > self.size as usize {
            return Err(Error::InvalidAddress { addr: self.base + offset });
        }
        for (i, byte) in bytes.iter().enumerate() {
            let pos = offset as usize + i;
            let word = &mut self.words[pos / 4];
            let shift = (pos % 4) * 8;
            *word = (*word & !(0xffu32 << shift)) | (u32::from(*byte) << shift);
        }
        Ok(())
    }

    /// Read one word, for tests and trace tooling.
    pub fn word(&self, offset: Address) -> Result<u32, Error> {
        if offset + 4 > self.size {
            return Err(Error::InvalidAddress { addr: self.base + offset });
        }
        Ok(self.words[offset as usize / 4])
    }
}

#[cfg(test)]
mod tests {
    use super::{LaneRequest, SharedMemory};
    use crate::error::Error;

    const BASE: u32 = 0x1000_0000;

    fn word_req(lane: usize, offset: u32, data: u32) -> LaneRequest {
        LaneRequest { lane, addr: BASE + offset, size: 4, write_data: data }
    }

    #[test]
    fn broadcast_read_is_one_cycle() {
        let mut smem = SharedMemory::new(BASE, 1024, 16);
        let reqs: Vec<_> = (0..32).map(|lane| word_req(lane, 64, 0)).collect();
        smem.load_segment(64, &0xdead_beefu32.to_le_bytes()).unwrap();
        let outcome = smem.access(&reqs, false).unwrap();
        assert_eq!(outcome.cycles, 1);
        assert_eq!(outcome.data.len(), 32);
        assert!(outcome.data.iter().all(|&(_, v)| v == 0xdead_beef));
        assert_eq!(smem.stats.bank_conflicts, 0);
    }

    #[test]
    fn stride_one_word_access_is_conflict_free() {
        let mut smem = SharedMemory::new(BASE, 4096, 32);
        let reqs: Vec<_> = (0..32).map(|lane| word_req(lane, lane as u32 * 4, 0)).collect();
        let outcome = smem.access(&reqs, false).unwrap();
        assert_eq!(outcome.cycles, 1);
        assert_eq!(smem.stats.bank_conflicts, 0);
    }

    #[test]
    fn two_way_conflict_serializes_into_two_rounds() {
        let mut smem = SharedMemory::new(BASE, 4096, 16);
        // lanes 0 and 1 hit bank 0 with different words
        let reqs = vec![word_req(0, 0, 0), word_req(1, 16 * 4, 0)];
        let outcome = smem.access(&reqs, false).unwrap();
        assert_eq!(outcome.cycles, 2);
        assert_eq!(smem.stats.bank_conflicts, 1);
    }

    #[test]
    fn worst_case_conflict_fully_serializes() {
        let mut smem = SharedMemory::new(BASE, 8192, 16);
        // every lane hits bank 3 with a distinct word
        let reqs: Vec<_> = (0..8)
            .map(|lane| word_req(lane, (3 + 16 * lane as u32) * 4, 0))
            .collect();
        let outcome = smem.access(&reqs, false).unwrap();
        assert_eq!(outcome.cycles, 8);
        assert_eq!(smem.stats.bank_conflicts, 7);
    }

    #[test]
    fn writes_land_and_partial_widths_merge() {
        let mut smem = SharedMemory::new(BASE, 1024, 16);
        smem.access(&[word_req(0, 8, 0x1111_2222)], true).unwrap();
        let half = LaneRequest { lane: 0, addr: BASE + 10, size: 2, write_data: 0xbeef };
        smem.access(&[half], true).unwrap();
        assert_eq!(smem.word(8).unwrap(), 0xbeef_2222);
    }

    #[test]
    fn boundary_access_rules() {
        let mut smem = SharedMemory::new(BASE, 1024, 16);
        let last = word_req(0, 1024 - 4, 7);
        smem.access(&[last], true).unwrap();
        assert_eq!(smem.word(1020).unwrap(), 7);

        let out = word_req(0, 1024, 7);
        assert_eq!(
            smem.access(&[out], true),
            Err(Error::InvalidAddress { addr: BASE + 1024 })
        );
    }

    #[test]
    fn unaligned_access_faults() {
        let mut smem = SharedMemory::new(BASE, 1024, 16);
        let req = LaneRequest { lane: 0, addr: BASE + 2, size: 4, write_data: 0 };
        assert_eq!(
            smem.access(&[req], false),
            Err(Error::AlignmentFault { addr: BASE + 2, size: 4 })
        );
    }
}
