//! Sequence engine: multi-step, multi-cycle actuation sequences, runnable to
//! completion on the calling thread or incrementally from a polled tick.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::actuator::MatrixDriver;
use crate::mapping::ElectrodeMap;
use crate::pins::PinBus;
use crate::NUM_ELECTRODES;

/// Upper bound on steps in one sequence.
pub const MAX_STEPS: usize = 256;

/// One actuation step: drive (row, col) to `state`, hold for `hold_ms`.
/// Immutable once built into a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectrodeStep {
    pub row: u8,
    pub col: u8,
    pub state: bool,
    pub hold_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("cycle count must be at least 1")]
    ZeroCycles,
    #[error("sequence exceeds {} steps", MAX_STEPS)]
    TooManySteps,
}

/// An ordered step list with a cycle policy. Validated at construction; an
/// empty step list is legal and runs as a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectrodeSequence {
    steps: Vec<ElectrodeStep>,
    cycle_count: u32,
    cycle_delay_ms: u64,
}

impl ElectrodeSequence {
    pub fn new(
        steps: Vec<ElectrodeStep>,
        cycle_count: u32,
        cycle_delay_ms: u64,
    ) -> Result<Self, SequenceError> {
        if cycle_count == 0 {
            return Err(SequenceError::ZeroCycles);
        }
        if steps.len() > MAX_STEPS {
            return Err(SequenceError::TooManySteps);
        }
        Ok(Self {
            steps,
            cycle_count,
            cycle_delay_ms,
        })
    }

    pub fn steps(&self) -> &[ElectrodeStep] {
        &self.steps
    }

    pub fn cycle_count(&self) -> u32 {
        self.cycle_count
    }

    pub fn cycle_delay_ms(&self) -> u64 {
        self.cycle_delay_ms
    }
}

/// Runs the whole sequence on the calling thread, suspending it for each
/// step's hold and for the inter-cycle delay (skipped after the last cycle).
/// Intended for short, deterministic sequences where blocking is acceptable.
pub fn run_blocking<B: PinBus>(driver: &mut MatrixDriver<B>, sequence: &ElectrodeSequence) {
    for cycle in 0..sequence.cycle_count {
        for step in &sequence.steps {
            driver.set_electrode(step.row as usize, step.col as usize, step.state);
            thread::sleep(Duration::from_millis(step.hold_ms));
        }
        if cycle + 1 < sequence.cycle_count {
            thread::sleep(Duration::from_millis(sequence.cycle_delay_ms));
        }
    }
}

/// Sequential 100 ms pulse of every electrode, 1 through 140. Blocking.
pub fn run_electrode_test<B: PinBus>(driver: &mut MatrixDriver<B>, map: &ElectrodeMap) {
    for electrode in 1..=NUM_ELECTRODES as u16 {
        if let Some(address) = map.resolve(electrode) {
            driver.set_electrode(address.row as usize, address.col as usize, true);
            thread::sleep(Duration::from_millis(100));
            driver.set_electrode(address.row as usize, address.col as usize, false);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The current step's electrode write is pending.
    Apply,
    /// Holding the current step for its duration.
    Hold,
    /// Waiting out the inter-cycle delay.
    CycleGap,
}

#[derive(Debug)]
struct ActiveRun {
    sequence: ElectrodeSequence,
    cycle: u32,
    step: usize,
    phase: Phase,
    phase_started: Instant,
}

impl ActiveRun {
    /// Returns true once the final step of the final cycle has been held.
    fn advance<B: PinBus>(&mut self, driver: &mut MatrixDriver<B>, now: Instant) -> bool {
        loop {
            match self.phase {
                Phase::Apply => {
                    let step = self.sequence.steps[self.step];
                    driver.set_electrode(step.row as usize, step.col as usize, step.state);
                    self.phase = Phase::Hold;
                    self.phase_started = now;
                    return false;
                }
                Phase::Hold => {
                    let hold = Duration::from_millis(self.sequence.steps[self.step].hold_ms);
                    if now.duration_since(self.phase_started) < hold {
                        return false;
                    }
                    self.step += 1;
                    if self.step < self.sequence.steps.len() {
                        self.phase = Phase::Apply;
                        continue;
                    }
                    self.step = 0;
                    self.cycle += 1;
                    if self.cycle == self.sequence.cycle_count {
                        return true;
                    }
                    if self.sequence.cycle_delay_ms > 0 {
                        self.phase = Phase::CycleGap;
                        self.phase_started = now;
                        return false;
                    }
                    self.phase = Phase::Apply;
                }
                Phase::CycleGap => {
                    let gap = Duration::from_millis(self.sequence.cycle_delay_ms);
                    if now.duration_since(self.phase_started) < gap {
                        return false;
                    }
                    self.phase = Phase::Apply;
                }
            }
        }
    }
}

/// Poll-driven sequence execution. Single instance, owned by the controller;
/// the sequence is held only for the duration of one run.
#[derive(Debug, Default)]
pub struct SequenceEngine {
    active: Option<ActiveRun>,
}

impl SequenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idle -> Running. Performs no actuation itself; the caller must poll
    /// `tick` on a regular cadence. An empty sequence never enters Running.
    /// Starting while a run is active replaces it.
    pub fn start(&mut self, sequence: ElectrodeSequence, now: Instant) {
        if sequence.steps.is_empty() {
            return;
        }
        self.active = Some(ActiveRun {
            sequence,
            cycle: 0,
            step: 0,
            phase: Phase::Apply,
            phase_started: now,
        });
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Running -> Idle immediately, discarding the remaining steps. The
    /// electrode matrix keeps whatever state the last applied step left.
    pub fn stop(&mut self) {
        self.active = None;
    }

    /// Applies the pending step write or advances past a hold that has
    /// elapsed. Tolerates coarse or irregular polling; holds are "no earlier
    /// than", never "exactly at".
    pub fn tick<B: PinBus>(&mut self, driver: &mut MatrixDriver<B>, now: Instant) {
        let finished = match self.active.as_mut() {
            Some(run) => run.advance(driver, now),
            None => return,
        };
        if finished {
            self.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::{PinTable, SimulatedBus};

    fn driver() -> MatrixDriver<SimulatedBus> {
        let mut driver = MatrixDriver::new(SimulatedBus::new(), PinTable::stm32_default());
        driver.init();
        driver
    }

    fn step(row: u8, col: u8, state: bool, hold_ms: u64) -> ElectrodeStep {
        ElectrodeStep {
            row,
            col,
            state,
            hold_ms,
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn sequence_validation() {
        assert_eq!(
            ElectrodeSequence::new(vec![step(0, 0, true, 1)], 0, 0),
            Err(SequenceError::ZeroCycles)
        );
        assert_eq!(
            ElectrodeSequence::new(vec![step(0, 0, true, 1); MAX_STEPS + 1], 1, 0),
            Err(SequenceError::TooManySteps)
        );
        assert!(ElectrodeSequence::new(vec![step(0, 0, true, 1); MAX_STEPS], 1, 0).is_ok());
        assert!(ElectrodeSequence::new(Vec::new(), 1, 0).is_ok());
    }

    #[test]
    fn run_blocking_applies_cycles_times_steps() {
        let mut driver = driver();
        let sequence = ElectrodeSequence::new(
            vec![step(0, 0, true, 0), step(0, 1, true, 0)],
            3,
            0,
        )
        .unwrap();
        run_blocking(&mut driver, &sequence);
        assert_eq!(driver.bus().group_writes(), 6);
        assert!(driver.electrode(0, 0));
        assert!(driver.electrode(0, 1));
    }

    #[test]
    fn run_blocking_delays_between_cycles_but_not_after_the_last() {
        let mut driver = driver();
        let sequence =
            ElectrodeSequence::new(vec![step(0, 0, true, 10), step(0, 1, true, 20)], 3, 50)
                .unwrap();
        let begin = Instant::now();
        run_blocking(&mut driver, &sequence);
        let elapsed = begin.elapsed();

        // 3 cycles of 10+20ms holds plus two 50ms gaps. A trailing gap
        // after the last cycle would push the total past 240ms.
        assert!(elapsed >= ms(190), "finished after {elapsed:?}");
        assert!(elapsed < ms(240), "finished after {elapsed:?}");
        assert_eq!(driver.bus().group_writes(), 6);
    }

    #[test]
    fn start_performs_no_actuation() {
        let mut driver = driver();
        let mut engine = SequenceEngine::new();
        let sequence = ElectrodeSequence::new(vec![step(0, 0, true, 10)], 1, 0).unwrap();
        engine.start(sequence, Instant::now());
        assert!(engine.is_running());
        assert_eq!(driver.bus().group_writes(), 0);
    }

    #[test]
    fn empty_sequence_never_enters_running() {
        let mut engine = SequenceEngine::new();
        let sequence = ElectrodeSequence::new(Vec::new(), 1, 0).unwrap();
        engine.start(sequence, Instant::now());
        assert!(!engine.is_running());
    }

    #[test]
    fn tick_advances_no_earlier_than_the_hold() {
        let mut driver = driver();
        let mut engine = SequenceEngine::new();
        let sequence = ElectrodeSequence::new(
            vec![step(0, 0, true, 10), step(0, 1, true, 10)],
            1,
            0,
        )
        .unwrap();
        let t0 = Instant::now();
        engine.start(sequence, t0);

        // First tick applies step 0 and starts its hold.
        engine.tick(&mut driver, t0);
        assert_eq!(driver.bus().group_writes(), 1);
        assert!(driver.electrode(0, 0));

        // Hold not yet elapsed: nothing advances.
        engine.tick(&mut driver, t0 + ms(5));
        assert_eq!(driver.bus().group_writes(), 1);

        // Hold elapsed: step 1 is applied in the same tick.
        engine.tick(&mut driver, t0 + ms(10));
        assert_eq!(driver.bus().group_writes(), 2);
        assert!(driver.electrode(0, 1));
        assert!(engine.is_running());

        // Final hold elapsed: the run completes.
        engine.tick(&mut driver, t0 + ms(25));
        assert!(!engine.is_running());
        assert_eq!(driver.bus().group_writes(), 2);
    }

    #[test]
    fn inter_cycle_gap_applies_between_cycles_only() {
        let mut driver = driver();
        let mut engine = SequenceEngine::new();
        let sequence = ElectrodeSequence::new(vec![step(0, 0, true, 0)], 2, 50).unwrap();
        let t0 = Instant::now();
        engine.start(sequence, t0);

        engine.tick(&mut driver, t0); // applies cycle 0
        assert_eq!(driver.bus().group_writes(), 1);
        engine.tick(&mut driver, t0); // zero hold elapsed, enters the gap
        assert!(engine.is_running());
        assert_eq!(driver.bus().group_writes(), 1);

        engine.tick(&mut driver, t0 + ms(49)); // still inside the gap
        assert_eq!(driver.bus().group_writes(), 1);

        engine.tick(&mut driver, t0 + ms(50)); // gap over, cycle 1 applied
        assert_eq!(driver.bus().group_writes(), 2);

        engine.tick(&mut driver, t0 + ms(50)); // last cycle done, no trailing gap
        assert!(!engine.is_running());
    }

    #[test]
    fn stop_halts_advancement_immediately() {
        let mut driver = driver();
        let mut engine = SequenceEngine::new();
        let sequence = ElectrodeSequence::new(
            vec![step(0, 0, true, 5), step(0, 1, true, 5)],
            10,
            0,
        )
        .unwrap();
        let t0 = Instant::now();
        engine.start(sequence, t0);
        engine.tick(&mut driver, t0);
        assert!(engine.is_running());

        engine.stop();
        assert!(!engine.is_running());

        // Later ticks advance nothing and the matrix keeps the last state.
        engine.tick(&mut driver, t0 + ms(100));
        assert_eq!(driver.bus().group_writes(), 1);
        assert!(driver.electrode(0, 0));
    }

    #[test]
    fn coarse_polling_only_stretches_holds() {
        let mut driver = driver();
        let mut engine = SequenceEngine::new();
        let sequence = ElectrodeSequence::new(
            vec![step(0, 0, true, 10), step(0, 1, true, 10)],
            1,
            0,
        )
        .unwrap();
        let t0 = Instant::now();
        engine.start(sequence, t0);
        engine.tick(&mut driver, t0);

        // One very late poll: only one step boundary is crossed per tick,
        // the write for step 1 still happens.
        engine.tick(&mut driver, t0 + ms(500));
        assert_eq!(driver.bus().group_writes(), 2);
        assert!(engine.is_running());
        engine.tick(&mut driver, t0 + ms(1000));
        assert!(!engine.is_running());
    }
}
