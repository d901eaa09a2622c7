//! Pin table: the physical-pin identity of the 10 row lines and 14 column
//! lines, and the opaque pin-level I/O primitive the matrix is driven through.

use std::collections::{HashMap, HashSet};

use crate::{NUM_COLS, NUM_ROWS};

/// GPIO port identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    A,
    B,
    C,
    D,
}

/// Identity of one physical output line. Immutable once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalPin {
    pub port: Port,
    pub pin: u8,
}

/// Whether a matrix line is a row line or a column line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRole {
    Row,
    Col,
}

/// The pin-level I/O primitive. `write_group` must apply every change as one
/// indivisible hardware transaction with no intermediate state observable
/// externally.
pub trait PinBus {
    /// Configures the pin as a digital output driven to `level`.
    fn configure_output(&mut self, pin: LogicalPin, level: bool);

    /// Drives a single pin. `true` is high.
    fn write(&mut self, pin: LogicalPin, level: bool);

    /// Drives a set of pins as one indivisible transaction.
    fn write_group(&mut self, changes: &[(LogicalPin, bool)]);
}

/// Lookup table from (line role, index) to the physical pin identity.
/// Pin identity is fixed at construction and cannot fail at runtime.
#[derive(Debug, Clone)]
pub struct PinTable {
    rows: [LogicalPin; NUM_ROWS],
    cols: [LogicalPin; NUM_COLS],
}

impl PinTable {
    pub fn new(rows: [LogicalPin; NUM_ROWS], cols: [LogicalPin; NUM_COLS]) -> Self {
        Self { rows, cols }
    }

    /// Wiring of the reference board: rows on A0-A7 and B0-B1, columns on
    /// C0-C7 and D0-D5.
    pub fn stm32_default() -> Self {
        let row_ports = [
            (Port::A, 0),
            (Port::A, 1),
            (Port::A, 2),
            (Port::A, 3),
            (Port::A, 4),
            (Port::A, 5),
            (Port::A, 6),
            (Port::A, 7),
            (Port::B, 0),
            (Port::B, 1),
        ];
        let col_ports = [
            (Port::C, 0),
            (Port::C, 1),
            (Port::C, 2),
            (Port::C, 3),
            (Port::C, 4),
            (Port::C, 5),
            (Port::C, 6),
            (Port::C, 7),
            (Port::D, 0),
            (Port::D, 1),
            (Port::D, 2),
            (Port::D, 3),
            (Port::D, 4),
            (Port::D, 5),
        ];
        Self {
            rows: row_ports.map(|(port, pin)| LogicalPin { port, pin }),
            cols: col_ports.map(|(port, pin)| LogicalPin { port, pin }),
        }
    }

    /// Physical pin for a row or column line. Index must be in range; all
    /// callers bounds-check against the matrix dimensions first.
    pub fn pin(&self, role: LineRole, index: usize) -> LogicalPin {
        match role {
            LineRole::Row => self.rows[index],
            LineRole::Col => self.cols[index],
        }
    }

    /// Drives a single row or column line.
    pub fn write_level<B: PinBus>(&self, bus: &mut B, role: LineRole, index: usize, level: bool) {
        bus.write(self.pin(role, index), level);
    }

    /// Drives a set of lines as one indivisible hardware transaction.
    pub fn write_group<B: PinBus>(&self, bus: &mut B, changes: &[(LineRole, usize, bool)]) {
        let pins: Vec<(LogicalPin, bool)> = changes
            .iter()
            .map(|&(role, index, level)| (self.pin(role, index), level))
            .collect();
        bus.write_group(&pins);
    }

    /// Configures every line as a digital output: rows low, columns high,
    /// the all-electrodes-off electrical convention.
    pub fn init<B: PinBus>(&self, bus: &mut B) {
        for &pin in &self.rows {
            bus.configure_output(pin, false);
        }
        for &pin in &self.cols {
            bus.configure_output(pin, true);
        }
    }
}

/// In-memory pin bus. Used by the test suite and by the CLI when no real
/// hardware is attached; records levels and counts group transactions.
#[derive(Debug, Default)]
pub struct SimulatedBus {
    levels: HashMap<LogicalPin, bool>,
    configured: HashSet<LogicalPin>,
    group_writes: usize,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last level driven on the pin, or None if it was never touched.
    pub fn level(&self, pin: LogicalPin) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    pub fn is_configured(&self, pin: LogicalPin) -> bool {
        self.configured.contains(&pin)
    }

    /// Number of indivisible group transactions issued so far.
    pub fn group_writes(&self) -> usize {
        self.group_writes
    }
}

impl PinBus for SimulatedBus {
    fn configure_output(&mut self, pin: LogicalPin, level: bool) {
        self.configured.insert(pin);
        self.levels.insert(pin, level);
    }

    fn write(&mut self, pin: LogicalPin, level: bool) {
        self.levels.insert(pin, level);
    }

    fn write_group(&mut self, changes: &[(LogicalPin, bool)]) {
        self.group_writes += 1;
        for &(pin, level) in changes {
            self.levels.insert(pin, level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_board_wiring() {
        let table = PinTable::stm32_default();
        assert_eq!(table.pin(LineRole::Row, 0), LogicalPin { port: Port::A, pin: 0 });
        assert_eq!(table.pin(LineRole::Row, 7), LogicalPin { port: Port::A, pin: 7 });
        assert_eq!(table.pin(LineRole::Row, 9), LogicalPin { port: Port::B, pin: 1 });
        assert_eq!(table.pin(LineRole::Col, 0), LogicalPin { port: Port::C, pin: 0 });
        assert_eq!(table.pin(LineRole::Col, 8), LogicalPin { port: Port::D, pin: 0 });
        assert_eq!(table.pin(LineRole::Col, 13), LogicalPin { port: Port::D, pin: 5 });
    }

    #[test]
    fn init_configures_rows_low_and_cols_high() {
        let table = PinTable::stm32_default();
        let mut bus = SimulatedBus::new();
        table.init(&mut bus);

        for index in 0..NUM_ROWS {
            let pin = table.pin(LineRole::Row, index);
            assert!(bus.is_configured(pin));
            assert_eq!(bus.level(pin), Some(false));
        }
        for index in 0..NUM_COLS {
            let pin = table.pin(LineRole::Col, index);
            assert!(bus.is_configured(pin));
            assert_eq!(bus.level(pin), Some(true));
        }
        // Initialization is per-line configuration, not group transactions.
        assert_eq!(bus.group_writes(), 0);
    }

    #[test]
    fn write_group_is_one_transaction() {
        let table = PinTable::stm32_default();
        let mut bus = SimulatedBus::new();
        table.write_group(
            &mut bus,
            &[(LineRole::Row, 3, true), (LineRole::Col, 5, false)],
        );

        assert_eq!(bus.group_writes(), 1);
        assert_eq!(bus.level(table.pin(LineRole::Row, 3)), Some(true));
        assert_eq!(bus.level(table.pin(LineRole::Col, 5)), Some(false));
    }

    #[test]
    fn custom_wiring_is_respected() {
        let rows = std::array::from_fn(|i| LogicalPin { port: Port::D, pin: i as u8 });
        let cols = std::array::from_fn(|i| LogicalPin { port: Port::A, pin: i as u8 });
        let table = PinTable::new(rows, cols);
        assert_eq!(table.pin(LineRole::Row, 9), LogicalPin { port: Port::D, pin: 9 });
        assert_eq!(table.pin(LineRole::Col, 13), LogicalPin { port: Port::A, pin: 13 });
    }

    #[test]
    fn write_level_drives_a_single_line() {
        let table = PinTable::stm32_default();
        let mut bus = SimulatedBus::new();
        table.write_level(&mut bus, LineRole::Col, 2, false);
        assert_eq!(bus.level(table.pin(LineRole::Col, 2)), Some(false));
        assert_eq!(bus.group_writes(), 0);
    }
}
