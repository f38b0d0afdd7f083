use crate::{
    atomic,
    barrier::{ArrivalKind, BarrierSet},
    cache::Cache,
    coalesce::Coalescer,
    config::{Config, SchedulerKind, SHARED_MEM_BASE, SHARED_MEM_WINDOW},
    error::Error,
    event::{Event, EventQueue, MemoryRequest, MemoryResponse},
    exec::{ExecutionUnit, Outcome, SyncKind},
    instruction::Instruction,
    mem::MainMemory,
    program::ProgramImage,
    register_file::RegisterFile,
    scheduler::{GreedyThenOldest, RoundRobin, Scheduler},
    scoreboard::Scoreboard,
    smem::SharedMemory,
    texture::{Sampler, ZeroSampler},
    trace, warp,
    warp::{State, Warp},
    Address,
};
use console::style;

/// The simulator driver.
///
/// Owns the cycle counter, the event queue, and every subsystem. All
/// state transitions happen during the dispatch of a single event; the
/// queue is the sole serialization mechanism. Reset is reconstruction.
#[derive(Debug)]
pub struct Simulator {
    config: Config,
    cycle: u64,
    queue: EventQueue,
    warps: Vec<Warp>,
    regs: RegisterFile,
    scoreboard: Scoreboard,
    mem: MainMemory,
    cache: Cache,
    coalescer: Coalescer,
    smem: SharedMemory,
    atomics: atomic::Engine,
    barriers: BarrierSet,
    scheduler: Box<dyn Scheduler>,
    exec: ExecutionUnit,
    sampler: Box<dyn Sampler>,
    stats: stats::Stats,
    trace: trace::Trace,
    /// First recorded fault (a divide-by-zero does not freeze the run).
    fault: Option<Error>,
    end_scheduled: bool,
    ended: bool,
}

impl Simulator {
    /// Build a driver for `image` under `config` with the default
    /// (all-zero) texture sampler.
    pub fn new(config: Config, image: &ProgramImage) -> Result<Self, Error> {
        Self::with_sampler(config, image, Box::new(ZeroSampler))
    }

    /// Build a driver with a harness-provided texture sampler.
    pub fn with_sampler(
        config: Config,
        image: &ProgramImage,
        sampler: Box<dyn Sampler>,
    ) -> Result<Self, Error> {
        config.validate()?;
        if config.warps_per_block() > crate::barrier::MAX_WARPS_PER_BLOCK {
            return Err(Error::ConfigInvalid(format!(
                "warps_per_block {} exceeds the supported maximum of {}",
                config.warps_per_block(),
                crate::barrier::MAX_WARPS_PER_BLOCK,
            )));
        }

        let mut mem = MainMemory::new();
        for (i, word) in image.instructions.iter().enumerate() {
            mem.write_u32(image.base + i as Address * 4, *word)?;
        }
        for segment in &image.data {
            mem.load_segment(segment.base, &segment.bytes);
        }
        let mut smem = SharedMemory::new(SHARED_MEM_BASE, config.shared_mem_size, config.num_banks);
        for segment in &image.shared {
            smem.load_segment(segment.base, &segment.bytes)?;
        }

        let warps_per_block = config.warps_per_block();
        let warps = (0..config.num_warps)
            .map(|warp_id| {
                Warp::new(
                    warp_id,
                    (warp_id / warps_per_block) as u32,
                    config.threads_per_warp,
                    image.entry_pc(),
                    config.divergence_stack_depth,
                )
            })
            .collect();

        let mut queue = EventQueue::new();
        queue.push(0, Event::InstructionFetch);

        Ok(Self {
            regs: RegisterFile::new(config.num_warps, config.threads_per_warp),
            scoreboard: Scoreboard::new(config.num_warps),
            cache: Cache::new(
                config.cache_size,
                config.cache_line_size,
                config.associativity,
                config.memory_latency,
            ),
            coalescer: Coalescer::new(config.cache_line_size),
            atomics: atomic::Engine::new(config.atomic_queue_depth),
            barriers: BarrierSet::new(config.max_barriers, warps_per_block),
            scheduler: match config.scheduler {
                SchedulerKind::RoundRobin => Box::new(RoundRobin::new()),
                SchedulerKind::GreedyThenOldest => Box::new(GreedyThenOldest::new()),
            },
            exec: ExecutionUnit::new(config.threads_per_warp, SHARED_MEM_BASE, SHARED_MEM_WINDOW),
            sampler,
            stats: stats::Stats::default(),
            trace: trace::Trace::default(),
            fault: None,
            end_scheduled: false,
            ended: false,
            cycle: 0,
            queue,
            warps,
            mem,
            smem,
            config,
        })
    }

    /// Dispatch the next event.
    ///
    /// Returns `Ok(false)` once the simulation has ended.
    pub fn step(&mut self) -> Result<bool, Error> {
        if self.ended {
            return Ok(false);
        }
        let Some((cycle, event)) = self.queue.pop() else {
            // nothing left to do; treat as a normal end
            self.finish();
            return Ok(false);
        };
        debug_assert!(cycle >= self.cycle, "time must be monotonic");
        self.cycle = cycle;

        if cycle >= self.config.cycle_limit {
            if self.config.graceful_cycle_limit {
                log::warn!("cycle limit reached, ending gracefully");
                self.finish();
                return Ok(false);
            }
            return Err(self.freeze(Error::CycleLimitExceeded { limit: self.config.cycle_limit }));
        }

        let result = match event {
            Event::InstructionFetch => self.tick(),
            Event::MemoryRequest(request) => self.handle_memory_request(request),
            Event::MemoryResponse(response) => {
                self.handle_memory_response(&response);
                Ok(())
            }
            Event::AtomicResponse(completion) => {
                self.handle_atomic_response(&completion);
                Ok(())
            }
            Event::BarrierRelease(release) => {
                self.handle_barrier_release(&release);
                Ok(())
            }
            Event::WarpComplete { warp_id } => {
                self.handle_warp_complete(warp_id);
                Ok(())
            }
            Event::SimulationEnd => {
                self.record(trace::Kind::SimulationEnd, 0, 0, 0, 0);
                self.finish();
                return Ok(false);
            }
        };

        if let Err(err) = result {
            return Err(self.freeze(err));
        }

        #[cfg(debug_assertions)]
        self.check_invariants();

        Ok(true)
    }

    /// Run until `SimulationEnd` or the cycle cap.
    pub fn run(&mut self) -> Result<(), Error> {
        while self.step()? {}
        Ok(())
    }

    /// The per-cycle issue slot: pick a warp, execute its instruction,
    /// and turn the outcome into follow-up events.
    fn tick(&mut self) -> Result<(), Error> {
        if self.all_finished() {
            return Ok(());
        }

        if self.config.snapshot_interval > 0 && self.cycle % self.config.snapshot_interval == 0 {
            self.snapshot();
        }

        // decode the next instruction of every schedulable warp so the
        // scheduler can gate on the scoreboard
        let now = self.cycle;
        let mut candidates: Vec<Option<Instruction>> = vec![None; self.warps.len()];
        for warp in &mut self.warps {
            if !warp.is_schedulable(now) {
                continue;
            }
            warp.reconverge_at_pc();
            let word = self.mem.fetch_instruction(warp.pc)?;
            let instr = Instruction::decode(word, warp.pc);
            if !self.scoreboard.has_collision(warp.warp_id, &instr) {
                candidates[warp.warp_id] = Some(instr);
            }
        }

        let selected = self
            .scheduler
            .select(self.warps.len(), &mut |warp_id| candidates[warp_id].is_some());

        let Some(warp_id) = selected else {
            self.stats.sim.idle_cycles += 1;
            self.stats.sim.stall_cycles += 1;
            self.queue.push(self.cycle + 1, Event::InstructionFetch);
            return Ok(());
        };
        let instr = candidates[warp_id].take().expect("selected warp has an instruction");

        self.record(trace::Kind::InstructionFetch, warp_id, instr.pc, 0, instr.word);
        self.queue.push(self.cycle + 1, Event::InstructionFetch);

        let warp = &mut self.warps[warp_id];
        warp.last_active_cycle = now;
        let merged = warp.just_reconverged;
        warp.just_reconverged = false;

        let outcome = match self.exec.execute(warp, &instr, &mut self.regs, self.sampler.as_ref(), merged)
        {
            Ok(outcome) => outcome,
            Err(err @ Error::DivideByZero { .. }) => {
                // the faulting warp dies, the rest of the machine carries on
                log::error!("{}: {err}", style("divide by zero").red());
                self.fault.get_or_insert(err);
                self.warps[warp_id].state = State::Finished;
                self.queue.push(self.cycle + 1, Event::WarpComplete { warp_id });
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match outcome {
            Outcome::Retired => {
                self.stats.sim.instructions += 1;
            }
            Outcome::Branched => {
                self.stats.sim.instructions += 1;
                self.warps[warp_id].resume_cycle = self.cycle + self.config.branch_latency;
            }
            Outcome::Memory { is_write, dest, global, shared } => {
                self.stats.sim.instructions += 1;
                let warp = &mut self.warps[warp_id];
                warp.state = State::Stalled;
                warp.pending_dest = dest;
                let mut pending = 0;

                let requests = self.coalescer.coalesce(&global, is_write, warp_id);
                self.stats.accesses.coalesced_requests += requests.len() as u64;
                for request in requests {
                    self.queue.push(
                        self.cycle + 1,
                        Event::MemoryRequest(MemoryRequest::Global { request, dest }),
                    );
                    pending += 1;
                }
                if !shared.is_empty() {
                    self.queue.push(
                        self.cycle + 1,
                        Event::MemoryRequest(MemoryRequest::Shared {
                            warp_id,
                            is_write,
                            dest,
                            requests: shared,
                        }),
                    );
                    pending += 1;
                }

                self.warps[warp_id].pending_responses = pending;
                if let Some(dest) = dest {
                    self.scoreboard.reserve(warp_id, dest);
                }
            }
            Outcome::Atomic { dest, requests } => {
                self.stats.sim.instructions += 1;
                let completions = self.atomics.submit(
                    &requests,
                    self.cycle,
                    &mut self.mem,
                    &mut self.cache,
                    &mut self.stats.accesses,
                )?;
                let warp = &mut self.warps[warp_id];
                warp.state = State::Stalled;
                warp.pending_dest = Some(dest);
                warp.pending_responses = completions.len();
                self.scoreboard.reserve(warp_id, dest);
                for completion in completions {
                    self.queue
                        .push(completion.finish_cycle, Event::AtomicResponse(completion));
                }
            }
            Outcome::Sync { kind, barrier_id } => {
                self.stats.sim.instructions += 1;
                self.handle_sync(warp_id, kind, barrier_id)?;
            }
            Outcome::Exited => {
                self.warps[warp_id].state = State::Finished;
                self.queue.push(self.cycle + 1, Event::WarpComplete { warp_id });
            }
        }
        Ok(())
    }

    fn handle_sync(&mut self, warp_id: usize, kind: SyncKind, barrier_id: u32) -> Result<(), Error> {
        let warps_per_block = self.config.warps_per_block();
        let warp = &self.warps[warp_id];
        let block_id = warp.block_id;
        let warp_in_block = warp.warp_in_block(warps_per_block);
        let thread_mask = warp.active_mask;

        match kind {
            SyncKind::Barrier | SyncKind::Arrive => {
                let arrival = if kind == SyncKind::Barrier {
                    ArrivalKind::Sync
                } else {
                    ArrivalKind::Arrive
                };
                if kind == SyncKind::Barrier {
                    self.warps[warp_id].state = State::WaitingBarrier;
                }
                let release = self.barriers.arrive(
                    barrier_id,
                    block_id,
                    warp_in_block,
                    thread_mask,
                    arrival,
                    self.cycle,
                )?;
                if let Some(release) = release {
                    self.queue.push(self.cycle + 1, Event::BarrierRelease(release));
                }
            }
            SyncKind::Wait => {
                if self
                    .barriers
                    .begin_wait(barrier_id, block_id, warp_in_block, self.cycle)
                {
                    self.warps[warp_id].state = State::WaitingBarrier;
                }
            }
        }
        Ok(())
    }

    fn handle_memory_request(&mut self, request: MemoryRequest) -> Result<(), Error> {
        match request {
            MemoryRequest::Global { request, dest } => {
                let warp_id = request.warp_id;
                let result =
                    self.cache
                        .access(&request, &mut self.mem, &mut self.stats.accesses, self.cycle);
                self.record(
                    trace::Kind::MemoryRequest,
                    warp_id,
                    self.warps[warp_id].pc,
                    request.line_addr,
                    u32::from(result.hit),
                );
                self.queue.push(
                    self.cycle + result.latency,
                    Event::MemoryResponse(MemoryResponse {
                        warp_id,
                        addr: request.line_addr,
                        dest,
                        data: result.data,
                    }),
                );
            }
            MemoryRequest::Shared { warp_id, is_write, dest, requests } => {
                let addr = requests.first().map_or(0, |r| r.addr);
                let outcome = self.smem.access(&requests, is_write)?;
                self.record(
                    trace::Kind::MemoryRequest,
                    warp_id,
                    self.warps[warp_id].pc,
                    addr,
                    outcome.cycles as u32,
                );
                self.queue.push(
                    self.cycle + outcome.cycles,
                    Event::MemoryResponse(MemoryResponse {
                        warp_id,
                        addr,
                        dest,
                        data: outcome.data,
                    }),
                );
            }
        }
        Ok(())
    }

    fn handle_memory_response(&mut self, response: &MemoryResponse) {
        let first = response.data.first().map_or(0, |&(_, value)| value);
        self.record(
            trace::Kind::MemoryResponse,
            response.warp_id,
            self.warps[response.warp_id].pc,
            response.addr,
            first,
        );
        if let Some(dest) = response.dest {
            for &(lane, value) in &response.data {
                self.regs.write_lane(response.warp_id, dest, lane, value);
            }
        }
        self.response_arrived(response.warp_id);
    }

    fn handle_atomic_response(&mut self, completion: &atomic::Completion) {
        self.record(
            trace::Kind::AtomicResponse,
            completion.warp_id,
            self.warps[completion.warp_id].pc,
            completion.addr,
            completion.value,
        );
        if let Some(dest) = self.warps[completion.warp_id].pending_dest {
            self.regs
                .write_lane(completion.warp_id, dest, completion.lane, completion.value);
        }
        self.response_arrived(completion.warp_id);
    }

    /// One outstanding response came back; the warp resumes when the
    /// last one does and the back-end clears its scoreboard entry.
    fn response_arrived(&mut self, warp_id: usize) {
        let warp = &mut self.warps[warp_id];
        debug_assert!(warp.pending_responses > 0);
        warp.pending_responses -= 1;
        if warp.pending_responses == 0 {
            if let Some(dest) = warp.pending_dest.take() {
                self.scoreboard.release(warp_id, dest);
            }
            if warp.state == State::Stalled {
                warp.state = State::Ready;
            }
        }
    }

    fn handle_barrier_release(&mut self, release: &crate::barrier::Release) {
        let warps_per_block = self.config.warps_per_block();
        let first_warp = release.block_id as usize * warps_per_block
            + release.warps.first().copied().unwrap_or(0);
        self.record(
            trace::Kind::BarrierRelease,
            first_warp,
            0,
            release.barrier_id,
            release.block_id,
        );
        self.stats.sim.stall_cycles += release.wait_cycles;
        // ascending warp id, part of the determinism contract
        for &warp_in_block in &release.warps {
            let warp_id = release.block_id as usize * warps_per_block + warp_in_block;
            let warp = &mut self.warps[warp_id];
            if warp.state == State::WaitingBarrier {
                warp.state = State::Ready;
            }
        }
    }

    fn handle_warp_complete(&mut self, warp_id: usize) {
        self.record(trace::Kind::WarpComplete, warp_id, self.warps[warp_id].pc, 0, 0);
        log::debug!("warp {warp_id} complete at cycle {}", self.cycle);
        if self.all_finished() && !self.end_scheduled {
            self.end_scheduled = true;
            self.queue.push(self.cycle + 1, Event::SimulationEnd);
        }
    }

    fn all_finished(&self) -> bool {
        self.warps.iter().all(|w| w.state == State::Finished)
    }

    /// Normal termination: drain the cache so the backing store holds
    /// the final memory image, then seal the statistics.
    fn finish(&mut self) {
        self.cache.flush(&mut self.mem);
        self.snapshot();
        self.ended = true;
        log::info!(
            "{} at cycle {}: {} instructions",
            style("simulation end").green(),
            self.cycle,
            self.stats.sim.instructions,
        );
    }

    /// Fatal fault: log with context, freeze, keep trace and statistics.
    fn freeze(&mut self, err: Error) -> Error {
        log::error!(
            "{} at cycle {}: {err}",
            style("simulation fault").red(),
            self.cycle,
        );
        self.snapshot();
        self.ended = true;
        // a fatal fault outranks an earlier warp-local divide-by-zero
        self.fault = Some(err.clone());
        err
    }

    /// Periodic statistics housekeeping.
    fn snapshot(&mut self) {
        self.stats.sim.cycles = self.cycle;
        self.stats.cache = self.cache.stats.clone();
        self.stats.smem = self.smem.stats.clone();
        self.stats.atomics = self.atomics.stats.clone();
        self.stats.barriers = self.barriers.stats.clone();
    }

    fn record(&mut self, kind: trace::Kind, warp_id: usize, pc: Address, address: Address, data: u32) {
        self.trace.record(trace::Entry { cycle: self.cycle, kind, warp_id, pc, address, data });
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        self.regs.verify();
        self.cache.verify();
        self.barriers.verify();
        for warp in &self.warps {
            assert_eq!(warp.pc % 4, 0, "pc must stay word aligned");
            if warp.state == State::Ready {
                assert_eq!(
                    warp.pending_responses, 0,
                    "a ready warp cannot have responses in flight"
                );
            }
        }
    }

    // accessors for the harness and tests

    #[must_use]
    pub fn statistics(&self) -> &stats::Stats {
        &self.stats
    }

    #[must_use]
    pub fn trace(&self) -> &trace::Trace {
        &self.trace
    }

    #[must_use]
    pub fn memory(&self) -> &MainMemory {
        &self.mem
    }

    #[must_use]
    pub fn shared_memory(&self) -> &SharedMemory {
        &self.smem
    }

    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    /// Exit status per the failure taxonomy: 0 for a clean end.
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        self.fault.as_ref().map_or(0, Error::exit_status)
    }

    #[must_use]
    pub fn warp_state(&self, warp_id: usize) -> State {
        self.warps[warp_id].state
    }

    /// All lanes of one register, a harness-side observation port.
    #[must_use]
    pub fn read_register(&self, warp_id: usize, reg: u8) -> &[u32] {
        self.regs.read(warp_id, reg)
    }

    /// Preset one register across all lanes, a harness-side setup port.
    pub fn write_register(&mut self, warp_id: usize, reg: u8, value: u32) {
        self.regs.broadcast(warp_id, reg, value);
    }

    /// Preset one register with per-lane values.
    pub fn write_register_lanes(&mut self, warp_id: usize, reg: u8, values: &[u32]) {
        self.regs.write(warp_id, reg, values, warp::full_mask(self.config.threads_per_warp));
    }
}
