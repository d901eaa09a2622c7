//! Matrix actuator: the live electrode-state bitmap and the race-free
//! row/column transitions that drive it.
//!
//! Energizing convention for a crosspoint electrode: ON is row high plus
//! column low, OFF is row low plus column high. Each electrode transition is
//! issued as one atomic group write so the row and column lines never present
//! an intermediate state.

use crate::pins::{LineRole, PinBus, PinTable};
use crate::{NUM_COLS, NUM_ROWS};

/// Snapshot of the whole actuation bitmap.
pub type Pattern = [[bool; NUM_COLS]; NUM_ROWS];

/// Owns the pin bus, the pin table and one bit of truth per electrode.
/// The state array always reflects the last successfully issued pin command.
pub struct MatrixDriver<B: PinBus> {
    bus: B,
    pins: PinTable,
    state: Pattern,
}

impl<B: PinBus> MatrixDriver<B> {
    pub fn new(bus: B, pins: PinTable) -> Self {
        Self {
            bus,
            pins,
            state: [[false; NUM_COLS]; NUM_ROWS],
        }
    }

    /// Configures every line as an output and drives the matrix to all-off.
    pub fn init(&mut self) {
        self.pins.init(&mut self.bus);
        self.state = [[false; NUM_COLS]; NUM_ROWS];
    }

    /// Drives one electrode. Out-of-range indices are silently ignored; the
    /// protocol layer validates before calling. Hardware write first, state
    /// update second, never skipped once the write was issued.
    pub fn set_electrode(&mut self, row: usize, col: usize, state: bool) {
        if row >= NUM_ROWS || col >= NUM_COLS {
            return;
        }
        self.pins.write_group(
            &mut self.bus,
            &[(LineRole::Row, row, state), (LineRole::Col, col, !state)],
        );
        self.state[row][col] = state;
    }

    /// Drives every electrode in a single group write covering all 24 lines.
    /// One transaction instead of 140 keeps bulk transitions flicker-free.
    pub fn set_all(&mut self, state: bool) {
        let mut changes = Vec::with_capacity(NUM_ROWS + NUM_COLS);
        for row in 0..NUM_ROWS {
            changes.push((LineRole::Row, row, state));
        }
        for col in 0..NUM_COLS {
            changes.push((LineRole::Col, col, !state));
        }
        self.pins.write_group(&mut self.bus, &changes);
        self.state = [[state; NUM_COLS]; NUM_ROWS];
    }

    /// Drives every electrode in one row, one atomic write per electrode.
    pub fn set_row(&mut self, row: usize, state: bool) {
        if row >= NUM_ROWS {
            return;
        }
        for col in 0..NUM_COLS {
            self.set_electrode(row, col, state);
        }
    }

    /// Drives every electrode in one column, one atomic write per electrode.
    pub fn set_col(&mut self, col: usize, state: bool) {
        if col >= NUM_COLS {
            return;
        }
        for row in 0..NUM_ROWS {
            self.set_electrode(row, col, state);
        }
    }

    /// Current state of one electrode; false out of range.
    pub fn electrode(&self, row: usize, col: usize) -> bool {
        if row >= NUM_ROWS || col >= NUM_COLS {
            return false;
        }
        self.state[row][col]
    }

    /// Snapshot of the whole bitmap.
    pub fn pattern(&self) -> Pattern {
        self.state
    }

    /// Applies a full pattern, cell by cell.
    pub fn set_pattern(&mut self, pattern: &Pattern) {
        for row in 0..NUM_ROWS {
            for col in 0..NUM_COLS {
                self.set_electrode(row, col, pattern[row][col]);
            }
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::SimulatedBus;

    fn driver() -> MatrixDriver<SimulatedBus> {
        let mut driver = MatrixDriver::new(SimulatedBus::new(), PinTable::stm32_default());
        driver.init();
        driver
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut driver = driver();
        driver.set_electrode(3, 7, true);
        assert!(driver.electrode(3, 7));
        driver.set_electrode(3, 7, false);
        assert!(!driver.electrode(3, 7));
    }

    #[test]
    fn set_electrode_drives_row_high_col_low_in_one_transaction() {
        let mut driver = driver();
        driver.set_electrode(2, 5, true);

        let table = PinTable::stm32_default();
        assert_eq!(driver.bus().group_writes(), 1);
        assert_eq!(driver.bus().level(table.pin(LineRole::Row, 2)), Some(true));
        assert_eq!(driver.bus().level(table.pin(LineRole::Col, 5)), Some(false));

        driver.set_electrode(2, 5, false);
        assert_eq!(driver.bus().group_writes(), 2);
        assert_eq!(driver.bus().level(table.pin(LineRole::Row, 2)), Some(false));
        assert_eq!(driver.bus().level(table.pin(LineRole::Col, 5)), Some(true));
    }

    #[test]
    fn out_of_range_write_is_a_silent_no_op() {
        let mut driver = driver();
        driver.set_electrode(NUM_ROWS, 0, true);
        driver.set_electrode(0, NUM_COLS, true);
        assert_eq!(driver.bus().group_writes(), 0);
        assert_eq!(driver.pattern(), [[false; NUM_COLS]; NUM_ROWS]);
        assert!(!driver.electrode(NUM_ROWS, 0));
    }

    #[test]
    fn set_all_is_a_single_group_write() {
        let mut driver = driver();
        driver.set_all(true);
        assert_eq!(driver.bus().group_writes(), 1);
        assert_eq!(driver.pattern(), [[true; NUM_COLS]; NUM_ROWS]);

        driver.set_all(false);
        assert_eq!(driver.bus().group_writes(), 2);
        assert_eq!(driver.pattern(), [[false; NUM_COLS]; NUM_ROWS]);
    }

    #[test]
    fn set_row_and_set_col_cover_one_dimension() {
        let mut driver = driver();
        driver.set_row(4, true);
        for col in 0..NUM_COLS {
            assert!(driver.electrode(4, col));
        }
        assert!(!driver.electrode(5, 0));

        driver.set_col(9, true);
        for row in 0..NUM_ROWS {
            assert!(driver.electrode(row, 9));
        }

        // One atomic write per touched electrode.
        assert_eq!(driver.bus().group_writes(), NUM_COLS + NUM_ROWS);

        driver.set_row(NUM_ROWS, true);
        driver.set_col(NUM_COLS, true);
        assert_eq!(driver.bus().group_writes(), NUM_COLS + NUM_ROWS);
    }

    #[test]
    fn set_pattern_applies_every_cell() {
        let mut driver = driver();
        let mut pattern = [[false; NUM_COLS]; NUM_ROWS];
        pattern[0][0] = true;
        pattern[9][13] = true;
        driver.set_pattern(&pattern);
        assert_eq!(driver.pattern(), pattern);
    }
}
