//! # Electrode Array Driver
//!
//! This library drives a 10x14 crosspoint electrode matrix (140 addressable
//! electrodes) used for microfluidic/PCR actuation. It owns the electrode
//! addressing tables, the live actuation state, the sequence execution
//! engine and the textual command protocol that controls them over a
//! serial link.
//!
//! The pin-level I/O primitive is abstracted behind [`pins::PinBus`]; the
//! [`pins::SimulatedBus`] implementation lets the whole stack run and be
//! tested without hardware attached.

pub mod actuator;
pub mod mapping;
pub mod pins;
pub mod protocol;
pub mod sequence;

pub use actuator::{MatrixDriver, Pattern};
pub use mapping::{
    load_electrode_map, load_pin_map, ElectrodeAddress, ElectrodeMap, EmptySource, MapError,
    MappingSource, TableSource,
};
pub use pins::{LineRole, LogicalPin, PinBus, PinTable, Port, SimulatedBus};
pub use protocol::{
    command_channel, process_line, CommandHandler, LineAssembler, ProtocolError, CMD_BUFFER_SIZE,
    READY_BANNER,
};
pub use sequence::{
    run_blocking, run_electrode_test, ElectrodeSequence, ElectrodeStep, SequenceEngine,
    SequenceError, MAX_STEPS,
};

/// Number of row lines in the matrix.
pub const NUM_ROWS: usize = 10;
/// Number of column lines in the matrix.
pub const NUM_COLS: usize = 14;
/// Total number of addressable electrodes.
pub const NUM_ELECTRODES: usize = NUM_ROWS * NUM_COLS;

/// The single orchestrating context: owns one matrix driver, one electrode
/// map and one sequence engine. All protocol dispatch goes through a
/// `&mut Controller`; there is no hidden process-wide state.
pub struct Controller<B: PinBus> {
    pub driver: MatrixDriver<B>,
    pub map: ElectrodeMap,
    pub engine: SequenceEngine,
}

impl<B: PinBus> Controller<B> {
    pub fn new(driver: MatrixDriver<B>, map: ElectrodeMap) -> Self {
        Self {
            driver,
            map,
            engine: SequenceEngine::new(),
        }
    }
}
