//! Command protocol handler: line assembly over a byte stream, a fixed
//! `|`-delimited grammar with case-sensitive verbs, and dispatch into the
//! electrode map, the matrix actuator and the sequence engine.
//!
//! Ingestion and dispatch are decoupled by a bounded line queue: the
//! [`LineAssembler`] half accepts bytes one at a time without blocking (so it
//! can be fed from an interrupt-style ingestion context) and the
//! [`CommandHandler`] half drains completed lines from the main loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use thiserror::Error;

use crate::pins::PinBus;
use crate::sequence::{
    run_blocking, run_electrode_test, ElectrodeSequence, ElectrodeStep, MAX_STEPS,
};
use crate::{Controller, NUM_COLS, NUM_ELECTRODES, NUM_ROWS};

/// Capacity of the line assembly buffer.
pub const CMD_BUFFER_SIZE: usize = 2048;

/// Completed lines that may queue between ingestion and dispatch.
const LINE_QUEUE_DEPTH: usize = 8;

/// Greeting emitted when the handler comes up.
pub const READY_BANNER: &str =
    "ArrayDriver UART Command Handler Ready\nType 'HELP' for command list\n";

const HELP_TEXT: &str = "\n=== ArrayDriver Commands ===\n\
START|REPS|DELAY|STEPS|ID1,DUR1|ID2,DUR2|...|END - Execute sequence\n\
SET|ELECTRODE|STATE - Set single electrode (STATE: 0=LOW, 1=HIGH)\n\
ALL|STATE - Set all electrodes\n\
ROW|ROW_NUM|STATE - Set all electrodes in row\n\
COL|COL_NUM|STATE - Set all electrodes in column\n\
TEST - Run full electrode test\n\
STATUS - Get system status\n\
STOP - Stop current sequence\n\
GET|ELECTRODE - Get electrode state\n\
RELOAD - Reload JSON mappings\n\
HELP - Show this help\n\n";

/// Everything a command line can be rejected for. Rejection is always
/// recoverable: the reason goes out as `ERROR: <reason>` and no actuation
/// is performed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Buffer overflow")]
    BufferOverflow,
    #[error("Command queue overflow")]
    QueueOverflow,
    #[error("Command is not valid UTF-8")]
    InvalidUtf8,
    #[error("Unknown command. Type 'HELP' for command list")]
    UnknownCommand,
    #[error("Invalid cycle repetitions (1-1000)")]
    InvalidCycleReps,
    #[error("Invalid cycle delay")]
    InvalidCycleDelay,
    #[error("Invalid steps count (1-{})", MAX_STEPS)]
    InvalidStepCount,
    #[error("Missing delimiter after {0}")]
    MissingDelimiterAfter(&'static str),
    #[error("Missing delimiter")]
    MissingDelimiter,
    #[error("Missing comma in step")]
    MissingComma,
    #[error("Invalid electrode ID at step {0} (1-140)")]
    InvalidStepElectrode(usize),
    #[error("Invalid duration at step {0}")]
    InvalidStepDuration(usize),
    #[error("Early END marker")]
    EarlyEnd,
    #[error("Missing END marker")]
    MissingEnd,
    #[error("Invalid electrode (1-140)")]
    InvalidElectrode,
    #[error("Invalid state (0=LOW, 1=HIGH)")]
    InvalidState,
    #[error("Invalid row (0-9)")]
    InvalidRow,
    #[error("Invalid column (0-13)")]
    InvalidColumn,
    #[error("Invalid electrode number")]
    UnresolvedElectrode,
    #[error("Not implemented")]
    NotImplemented,
}

/// A fully validated command, ready to execute. No side effects happen
/// before one of these exists.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Start {
        reps: u32,
        delay_ms: u64,
        steps: Vec<(u16, u64)>,
    },
    Set { electrode: u16, state: bool },
    All { state: bool },
    Row { row: usize, state: bool },
    Col { col: usize, state: bool },
    Test,
    Status,
    Stop,
    Get { electrode: u16 },
    Reload,
    Help,
}

fn parse_state(field: &str) -> Result<bool, ProtocolError> {
    match field {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ProtocolError::InvalidState),
    }
}

// Format: START|REPS|DELAY|STEPS|ID1,DUR1|ID2,DUR2|...|END
fn parse_start(cmd: &str) -> Result<Command, ProtocolError> {
    let mut fields = cmd.split('|');
    fields.next(); // verb

    let reps: i64 = fields
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| ProtocolError::InvalidCycleReps)?;
    if !(1..=1000).contains(&reps) {
        return Err(ProtocolError::InvalidCycleReps);
    }

    let delay: i64 = fields
        .next()
        .ok_or(ProtocolError::MissingDelimiterAfter("REPS"))?
        .parse()
        .map_err(|_| ProtocolError::InvalidCycleDelay)?;
    if delay < 0 {
        return Err(ProtocolError::InvalidCycleDelay);
    }

    let count: i64 = fields
        .next()
        .ok_or(ProtocolError::MissingDelimiterAfter("DELAY"))?
        .parse()
        .map_err(|_| ProtocolError::InvalidStepCount)?;
    if count < 1 || count > MAX_STEPS as i64 {
        return Err(ProtocolError::InvalidStepCount);
    }

    let mut steps = Vec::with_capacity(count as usize);
    for index in 0..count as usize {
        let field = fields.next().ok_or(if index == 0 {
            ProtocolError::MissingDelimiterAfter("STEPS")
        } else {
            ProtocolError::MissingDelimiter
        })?;
        if field.starts_with("END") {
            return Err(ProtocolError::EarlyEnd);
        }
        let (id_text, dur_text) = field
            .split_once(',')
            .ok_or(ProtocolError::MissingComma)?;
        let id: i64 = id_text
            .parse()
            .map_err(|_| ProtocolError::InvalidStepElectrode(index))?;
        if id < 1 || id > NUM_ELECTRODES as i64 {
            return Err(ProtocolError::InvalidStepElectrode(index));
        }
        let dur: i64 = dur_text
            .parse()
            .map_err(|_| ProtocolError::InvalidStepDuration(index))?;
        if dur < 0 {
            return Err(ProtocolError::InvalidStepDuration(index));
        }
        steps.push((id as u16, dur as u64));
    }

    let end_field = fields.next().ok_or(ProtocolError::MissingDelimiter)?;
    if !end_field.starts_with("END") {
        return Err(ProtocolError::MissingEnd);
    }

    Ok(Command::Start {
        reps: reps as u32,
        delay_ms: delay as u64,
        steps,
    })
}

// Format: SET|ELECTRODE|STATE
fn parse_set(rest: &str) -> Result<Command, ProtocolError> {
    let mut fields = rest.split('|');
    let electrode: i64 = fields
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| ProtocolError::InvalidElectrode)?;
    if electrode < 1 || electrode > NUM_ELECTRODES as i64 {
        return Err(ProtocolError::InvalidElectrode);
    }
    let state = parse_state(fields.next().ok_or(ProtocolError::MissingDelimiter)?)?;
    Ok(Command::Set {
        electrode: electrode as u16,
        state,
    })
}

// Format: ALL|STATE
fn parse_all(rest: &str) -> Result<Command, ProtocolError> {
    let state = parse_state(rest.split('|').next().unwrap_or(""))?;
    Ok(Command::All { state })
}

// Format: ROW|ROW_NUM|STATE
fn parse_row(rest: &str) -> Result<Command, ProtocolError> {
    let mut fields = rest.split('|');
    let row: i64 = fields
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| ProtocolError::InvalidRow)?;
    if row < 0 || row >= NUM_ROWS as i64 {
        return Err(ProtocolError::InvalidRow);
    }
    let state = parse_state(fields.next().ok_or(ProtocolError::MissingDelimiter)?)?;
    Ok(Command::Row {
        row: row as usize,
        state,
    })
}

// Format: COL|COL_NUM|STATE
fn parse_col(rest: &str) -> Result<Command, ProtocolError> {
    let mut fields = rest.split('|');
    let col: i64 = fields
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| ProtocolError::InvalidColumn)?;
    if col < 0 || col >= NUM_COLS as i64 {
        return Err(ProtocolError::InvalidColumn);
    }
    let state = parse_state(fields.next().ok_or(ProtocolError::MissingDelimiter)?)?;
    Ok(Command::Col {
        col: col as usize,
        state,
    })
}

// Format: GET|ELECTRODE
fn parse_get(rest: &str) -> Result<Command, ProtocolError> {
    let electrode: i64 = rest
        .split('|')
        .next()
        .unwrap_or("")
        .parse()
        .map_err(|_| ProtocolError::InvalidElectrode)?;
    if electrode < 1 || electrode > NUM_ELECTRODES as i64 {
        return Err(ProtocolError::InvalidElectrode);
    }
    Ok(Command::Get {
        electrode: electrode as u16,
    })
}

/// Parses one line into a validated command. Ok(None) for a blank line.
fn parse_line(line: &str) -> Result<Option<Command>, ProtocolError> {
    let cmd = line.trim_start_matches([' ', '\t']);
    if cmd.is_empty() {
        return Ok(None);
    }
    let command = if cmd.starts_with("START|") {
        parse_start(cmd)?
    } else if let Some(rest) = cmd.strip_prefix("SET|") {
        parse_set(rest)?
    } else if let Some(rest) = cmd.strip_prefix("ALL|") {
        parse_all(rest)?
    } else if let Some(rest) = cmd.strip_prefix("ROW|") {
        parse_row(rest)?
    } else if let Some(rest) = cmd.strip_prefix("COL|") {
        parse_col(rest)?
    } else if cmd.starts_with("TEST") {
        Command::Test
    } else if cmd.starts_with("STATUS") {
        Command::Status
    } else if cmd.starts_with("STOP") {
        Command::Stop
    } else if let Some(rest) = cmd.strip_prefix("GET|") {
        parse_get(rest)?
    } else if cmd.starts_with("RELOAD") {
        Command::Reload
    } else if cmd.starts_with("HELP") {
        Command::Help
    } else {
        return Err(ProtocolError::UnknownCommand);
    };
    Ok(Some(command))
}

fn level_name(state: bool) -> &'static str {
    if state {
        "HIGH"
    } else {
        "LOW"
    }
}

fn error_line(err: &ProtocolError) -> String {
    format!("ERROR: {err}\n")
}

fn run_start<B: PinBus>(
    ctx: &mut Controller<B>,
    reps: u32,
    delay_ms: u64,
    raw_steps: Vec<(u16, u64)>,
) -> String {
    // Resolve the whole step list before the first actuation call.
    let mut steps = Vec::with_capacity(raw_steps.len());
    for (electrode, hold_ms) in raw_steps {
        let Some(address) = ctx.map.resolve(electrode) else {
            return error_line(&ProtocolError::UnresolvedElectrode);
        };
        steps.push(ElectrodeStep {
            row: address.row,
            col: address.col,
            state: true,
            hold_ms,
        });
    }
    let sequence = match ElectrodeSequence::new(steps, reps, delay_ms) {
        Ok(sequence) => sequence,
        Err(err) => return format!("ERROR: {err}\n"),
    };

    let mut out = String::from("Executing sequence...\n");
    run_blocking(&mut ctx.driver, &sequence);
    out.push_str("Sequence complete\nOK\n");
    out
}

/// Executes a validated command and renders the full response text.
fn execute<B: PinBus>(ctx: &mut Controller<B>, command: Command) -> String {
    match command {
        Command::Start {
            reps,
            delay_ms,
            steps,
        } => run_start(ctx, reps, delay_ms, steps),
        Command::Set { electrode, state } => {
            let Some(address) = ctx.map.resolve(electrode) else {
                return error_line(&ProtocolError::UnresolvedElectrode);
            };
            ctx.driver
                .set_electrode(address.row as usize, address.col as usize, state);
            format!("Electrode {electrode} set to {}\nOK\n", level_name(state))
        }
        Command::All { state } => {
            ctx.driver.set_all(state);
            format!("All electrodes set to {}\nOK\n", level_name(state))
        }
        Command::Row { row, state } => {
            ctx.driver.set_row(row, state);
            format!("Row {row} set to {}\nOK\n", level_name(state))
        }
        Command::Col { col, state } => {
            ctx.driver.set_col(col, state);
            format!("Column {col} set to {}\nOK\n", level_name(state))
        }
        Command::Test => {
            let mut out = String::from("Running electrode test (140 electrodes x 100ms)...\n");
            run_electrode_test(&mut ctx.driver, &ctx.map);
            out.push_str("Test complete\nOK\n");
            out
        }
        Command::Status => {
            let run_state = if ctx.engine.is_running() {
                "RUNNING"
            } else {
                "IDLE"
            };
            format!(
                "\n=== System Status ===\nSequence: {run_state}\nElectrodes: {NUM_ELECTRODES} ({NUM_ROWS} rows x {NUM_COLS} columns)\nStatus: OK\n\n"
            )
        }
        Command::Stop => {
            if ctx.engine.is_running() {
                ctx.engine.stop();
                String::from("Sequence stopped\nOK\n")
            } else {
                String::from("No sequence running\nOK\n")
            }
        }
        Command::Get { electrode } => {
            let Some(address) = ctx.map.resolve(electrode) else {
                return error_line(&ProtocolError::UnresolvedElectrode);
            };
            let state = ctx
                .driver
                .electrode(address.row as usize, address.col as usize);
            format!(
                "Electrode {electrode} (Row {}, Col {}): {}\nOK\n",
                address.row,
                address.col,
                level_name(state)
            )
        }
        Command::Reload => format!(
            "Reload mapping not implemented (requires re-initialization)\nERROR: {}\n",
            ProtocolError::NotImplemented
        ),
        Command::Help => HELP_TEXT.to_string(),
    }
}

/// Parses and executes one complete command line. Returns the response text,
/// or None for a blank line.
pub fn process_line<B: PinBus>(ctx: &mut Controller<B>, line: &str) -> Option<String> {
    match parse_line(line) {
        Ok(None) => None,
        Ok(Some(command)) => Some(execute(ctx, command)),
        Err(err) => Some(error_line(&err)),
    }
}

/// Byte-at-a-time line assembly, the producer half of the line queue. Never
/// blocks, so it is safe to feed from an ingestion/interrupt context.
pub struct LineAssembler {
    buf: Vec<u8>,
    discarding: bool,
    tx: SyncSender<Result<String, ProtocolError>>,
    dropped: Arc<AtomicUsize>,
}

impl LineAssembler {
    /// Accepts one byte. `\n` or `\r` completes the line (ignored while the
    /// buffer is empty). Once the buffer cap is hit the line is reported as
    /// an overflow and the rest of it is discarded up to the next
    /// terminator, so an over-long line never completes as a command.
    ///
    /// A line completed while the queue is full is counted as dropped; the
    /// consumer answers each dropped line with a queue-overflow error so no
    /// command goes unanswered.
    pub fn push_byte(&mut self, byte: u8) {
        if byte == b'\n' || byte == b'\r' {
            if self.discarding {
                self.discarding = false;
                return;
            }
            if self.buf.is_empty() {
                return;
            }
            let line = String::from_utf8(std::mem::take(&mut self.buf))
                .map_err(|_| ProtocolError::InvalidUtf8);
            self.buf = Vec::with_capacity(CMD_BUFFER_SIZE);
            if self.tx.try_send(line).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        if self.discarding {
            return;
        }
        if self.buf.len() >= CMD_BUFFER_SIZE - 1 {
            self.discarding = true;
            self.buf.clear();
            if self.tx.try_send(Err(ProtocolError::BufferOverflow)).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        self.buf.push(byte);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.push_byte(byte);
        }
    }
}

/// Consumer half: drains completed lines and dispatches them.
pub struct CommandHandler {
    rx: Receiver<Result<String, ProtocolError>>,
    dropped: Arc<AtomicUsize>,
}

impl CommandHandler {
    /// Dispatches every queued line, returning one response per command.
    /// Blank lines produce no response. Lines the assembler had to drop
    /// because the queue was full each get a queue-overflow error, so every
    /// completed command is answered with either `OK` or `ERROR:`.
    pub fn poll<B: PinBus>(&mut self, ctx: &mut Controller<B>) -> Vec<String> {
        let mut responses = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            match item {
                Ok(line) => {
                    if let Some(response) = process_line(ctx, &line) {
                        responses.push(response);
                    }
                }
                Err(err) => responses.push(error_line(&err)),
            }
        }
        for _ in 0..self.dropped.swap(0, Ordering::Relaxed) {
            responses.push(error_line(&ProtocolError::QueueOverflow));
        }
        responses
    }
}

/// Creates the ingestion/dispatch pair around a bounded line queue.
pub fn command_channel() -> (LineAssembler, CommandHandler) {
    let (tx, rx) = sync_channel(LINE_QUEUE_DEPTH);
    let dropped = Arc::new(AtomicUsize::new(0));
    (
        LineAssembler {
            buf: Vec::with_capacity(CMD_BUFFER_SIZE),
            discarding: false,
            tx,
            dropped: Arc::clone(&dropped),
        },
        CommandHandler { rx, dropped },
    )
}
