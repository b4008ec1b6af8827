//! The tape machine.
//!
//! A [`Machine`] executes programs written in the eight-instruction language
//! `><+-.,[]` over a fixed-length circular tape of bytes (30,000 cells by
//! default).
//!
//! Features and behaviors:
//! - Memory tape initialized to 0; cells wrap modulo 256.
//! - The data pointer wraps circularly: `>` past the last cell lands on cell 0,
//!   `<` from cell 0 lands on the last cell.
//! - Input `,` consumes the next byte of a caller-supplied buffer; what happens
//!   once the buffer is exhausted is chosen by [`EofPolicy`].
//! - Output `.` appends the current cell to [`Machine::output`] and forwards it
//!   to an optional live sink.
//! - Loops are matched according to [`BracketMatching`]; brackets whose partner
//!   cannot be found are reported before anything executes.
//! - Every other character is a comment: skipped, and not counted as a cycle.
//!
//! Quick start:
//!
//! ```
//! use bf_machine::Machine;
//!
//! let mut machine = Machine::new();
//! machine.load("+++.").expect("fresh machine");
//! machine.run().expect("program should run");
//! assert_eq!(machine.output(), &[3]);
//! assert_eq!(machine.cycle_count(), 4);
//! ```

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, trace};

/// Tape length used by [`Machine::new`] and the CLI.
pub const DEFAULT_TAPE_LENGTH: usize = 30_000;

/// Errors that can occur while loading or running a program.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// `load` was called on a machine that already holds a program.
    #[error("A program is already loaded into this machine")]
    ProgramAlreadyLoaded,

    /// `run` was called before any program was loaded.
    #[error("No program loaded")]
    NoProgramLoaded,

    /// The tape must hold at least one cell.
    #[error("Invalid tape length {0}: the tape needs at least one cell")]
    InvalidTapeLength(usize),

    /// A bracket seek ran off the program without finding its partner.
    #[error("Unmatched bracket: {direction} scan starting at instruction {ip} found no partner")]
    UnmatchedBracket { ip: usize, direction: ScanDirection },

    /// `,` executed with no input left and [`EofPolicy::Fail`] in effect.
    #[error("Input exhausted at instruction {ip}")]
    InputExhausted { ip: usize },

    /// Execution aborted due to step limit.
    #[error("Execution aborted: step limit exceeded ({limit})")]
    StepLimitExceeded { limit: u64 },

    /// Execution aborted due to cooperative cancellation (e.g., timeout)
    #[error("Execution aborted: cancelled")]
    Canceled,
}

/// Which way a bracket seek was travelling when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDirection {
    /// From a `[` towards the end of the program.
    Forward,
    /// From a `]` towards the start of the program.
    Backward,
}

impl ScanDirection {
    /// The bracket the scan started from.
    pub fn bracket(self) -> char {
        match self {
            ScanDirection::Forward => '[',
            ScanDirection::Backward => ']',
        }
    }
}

impl fmt::Display for ScanDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDirection::Forward => write!(f, "forward"),
            ScanDirection::Backward => write!(f, "backward"),
        }
    }
}

/// How `[` and `]` find their partners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BracketMatching {
    /// Track nesting depth, so `[[.]]` pairs the outer brackets together.
    #[default]
    Nested,
    /// Stop at the first bare `]` (forward) or `[` (backward), ignoring
    /// nesting. Nested loops mis-jump under this policy.
    Flat,
}

/// What `,` does once the input buffer is exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EofPolicy {
    /// Store 0 in the current cell.
    #[default]
    Zero,
    /// Leave the current cell untouched.
    Unchanged,
    /// Abort the run with [`MachineError::InputExhausted`].
    Fail,
}

/// Construction-time knobs for a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineOptions {
    pub tape_length: usize,
    pub bracket_matching: BracketMatching,
    pub eof_policy: EofPolicy,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            tape_length: DEFAULT_TAPE_LENGTH,
            bracket_matching: BracketMatching::default(),
            eof_policy: EofPolicy::default(),
        }
    }
}

/// Controls for cooperative cancellation and step limiting.
#[derive(Clone, Default)]
pub struct StepControl {
    pub max_steps: Option<u64>,
    pub cancel_flag: Arc<AtomicBool>,
}

impl StepControl {
    pub fn new(max_steps: Option<u64>, cancel_flag: Arc<AtomicBool>) -> Self {
        Self { max_steps, cancel_flag }
    }
}

/// One of the eight recognized instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Right,
    Left,
    Increment,
    Decrement,
    Output,
    Input,
    LoopStart,
    LoopEnd,
}

impl Instruction {
    /// Decode a program character; `None` means the character is a comment.
    pub fn decode(c: char) -> Option<Self> {
        Some(match c {
            '>' => Instruction::Right,
            '<' => Instruction::Left,
            '+' => Instruction::Increment,
            '-' => Instruction::Decrement,
            '.' => Instruction::Output,
            ',' => Instruction::Input,
            '[' => Instruction::LoopStart,
            ']' => Instruction::LoopEnd,
            _ => return None,
        })
    }
}

/// Scan forward from the `[` at `start` for its partner `]`.
///
/// Returns `None` when the scan runs off the end of `program`.
pub fn seek_forward(
    program: &[char],
    start: usize,
    matching: BracketMatching,
) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &c) in program.iter().enumerate().skip(start + 1) {
        match (c, matching) {
            (']', BracketMatching::Flat) => return Some(i),
            (']', BracketMatching::Nested) if depth == 0 => return Some(i),
            (']', BracketMatching::Nested) => depth -= 1,
            ('[', BracketMatching::Nested) => depth += 1,
            _ => {}
        }
    }
    None
}

/// Scan backward from the `]` at `start` for its partner `[`.
///
/// Returns `None` when the scan runs off the start of `program`.
pub fn seek_backward(
    program: &[char],
    start: usize,
    matching: BracketMatching,
) -> Option<usize> {
    let mut depth = 0usize;
    for i in (0..start).rev() {
        match (program[i], matching) {
            ('[', BracketMatching::Flat) => return Some(i),
            ('[', BracketMatching::Nested) if depth == 0 => return Some(i),
            ('[', BracketMatching::Nested) => depth -= 1,
            (']', BracketMatching::Nested) => depth += 1,
            _ => {}
        }
    }
    None
}

/// Resolve the partner of every bracket in `program`, in linear time.
///
/// `jump_map[i]` holds the partner index for a bracket at `i` and `None`
/// everywhere else. Each entry equals what [`seek_forward`] or
/// [`seek_backward`] would return for that bracket. When several brackets
/// have no partner, the one earliest in the program is reported.
fn build_jump_map(
    program: &[char],
    matching: BracketMatching,
) -> Result<Vec<Option<usize>>, MachineError> {
    match matching {
        BracketMatching::Nested => nested_jump_map(program),
        BracketMatching::Flat => flat_jump_map(program),
    }
}

fn nested_jump_map(program: &[char]) -> Result<Vec<Option<usize>>, MachineError> {
    let mut jump_map: Vec<Option<usize>> = vec![None; program.len()];
    let mut stack: Vec<usize> = Vec::new();
    for (i, &c) in program.iter().enumerate() {
        if c == '[' {
            stack.push(i);
        } else if c == ']' {
            let Some(open_index) = stack.pop() else {
                return Err(MachineError::UnmatchedBracket {
                    ip: i,
                    direction: ScanDirection::Backward,
                });
            };
            jump_map[open_index] = Some(i);
            jump_map[i] = Some(open_index);
        }
    }

    // Every unmatched '[' sits after the last unmatched ']', so the bottom of
    // the stack is the earliest failure.
    if let Some(&unmatched_open) = stack.first() {
        return Err(MachineError::UnmatchedBracket {
            ip: unmatched_open,
            direction: ScanDirection::Forward,
        });
    }
    Ok(jump_map)
}

fn flat_jump_map(program: &[char]) -> Result<Vec<Option<usize>>, MachineError> {
    let mut jump_map: Vec<Option<usize>> = vec![None; program.len()];

    // '[' pairs with the next ']' after it.
    let mut next_close = None;
    for (i, &c) in program.iter().enumerate().rev() {
        match c {
            '[' => jump_map[i] = next_close,
            ']' => next_close = Some(i),
            _ => {}
        }
    }

    // ']' pairs with the last '[' before it.
    let mut last_open = None;
    for (ip, &c) in program.iter().enumerate() {
        match c {
            '[' => {
                if jump_map[ip].is_none() {
                    return Err(MachineError::UnmatchedBracket {
                        ip,
                        direction: ScanDirection::Forward,
                    });
                }
                last_open = Some(ip);
            }
            ']' => {
                let Some(open_index) = last_open else {
                    return Err(MachineError::UnmatchedBracket {
                        ip,
                        direction: ScanDirection::Backward,
                    });
                };
                jump_map[ip] = Some(open_index);
            }
            _ => {}
        }
    }
    Ok(jump_map)
}

/// Step `i` one cell right over `[0, len)`, wrapping to 0.
fn wrapping_next(i: usize, len: usize) -> usize {
    if i + 1 == len { 0 } else { i + 1 }
}

/// Step `i` one cell left over `[0, len)`, wrapping to `len - 1`.
fn wrapping_prev(i: usize, len: usize) -> usize {
    if i == 0 { len - 1 } else { i - 1 }
}

type OutputSink = Box<dyn FnMut(&[u8]) + Send>;

/// A single-use tape machine.
///
/// The machine maintains:
/// - a fixed-length tape of zeroed cells and a data pointer into it,
/// - the program (bound exactly once) and an instruction pointer into it,
/// - the input buffer with its cursor, the accumulated output, and the
///   number of instructions executed so far.
pub struct Machine {
    tape: Vec<u8>,
    data_pointer: usize,
    instruction_pointer: usize,
    program: Option<Vec<char>>,
    input: Vec<u8>,
    input_cursor: usize,
    output: Vec<u8>,
    cycle_count: u64,
    options: MachineOptions,
    output_sink: Option<OutputSink>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("tape_length", &self.tape.len())
            .field("data_pointer", &self.data_pointer)
            .field("instruction_pointer", &self.instruction_pointer)
            .field("program_len", &self.program_len())
            .field("input_cursor", &self.input_cursor)
            .field("output_len", &self.output.len())
            .field("cycle_count", &self.cycle_count)
            .field("options", &self.options)
            .finish()
    }
}

impl Machine {
    /// Create an empty machine with the default options.
    ///
    /// The memory tape is initialized to 30,000 zeroed cells.
    pub fn new() -> Self {
        Self::build(MachineOptions::default())
    }

    /// Create an empty machine with custom options.
    pub fn with_options(options: MachineOptions) -> Result<Self, MachineError> {
        if options.tape_length == 0 {
            return Err(MachineError::InvalidTapeLength(0));
        }
        Ok(Self::build(options))
    }

    fn build(options: MachineOptions) -> Self {
        Self {
            tape: vec![0; options.tape_length],
            data_pointer: 0,
            instruction_pointer: 0,
            program: None,
            input: Vec::new(),
            input_cursor: 0,
            output: Vec::new(),
            cycle_count: 0,
            options,
            output_sink: None,
        }
    }

    /// Bind `program` to this machine. A machine accepts exactly one program.
    pub fn load(&mut self, program: &str) -> Result<(), MachineError> {
        if self.program.is_some() {
            return Err(MachineError::ProgramAlreadyLoaded);
        }
        self.program = Some(program.chars().collect());
        Ok(())
    }

    /// Provide the bytes consumed, in order, by `,`.
    pub fn set_input(&mut self, input: impl Into<Vec<u8>>) {
        self.input = input.into();
        self.input_cursor = 0;
    }

    /// Provide an output sink. Every `.` sends its byte to the sink as a
    /// one-byte slice, in addition to recording it in [`Machine::output`].
    pub fn set_output_sink<F>(&mut self, sink: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.output_sink = Some(Box::new(sink));
    }

    /// Execute the loaded program until the instruction pointer runs off its end.
    ///
    /// Returns `Ok(())` on success or a [`MachineError`] on failure.
    pub fn run(&mut self) -> Result<(), MachineError> {
        self.execute(None)
    }

    /// Execute with cooperative cancellation and optional step limit.
    pub fn run_with_control(&mut self, step_control: StepControl) -> Result<(), MachineError> {
        self.execute(Some(&step_control))
    }

    fn execute(&mut self, step_control: Option<&StepControl>) -> Result<(), MachineError> {
        let program = self.program.take().ok_or(MachineError::NoProgramLoaded)?;
        let result = self.dispatch(&program, step_control);
        self.program = Some(program);
        result
    }

    fn dispatch(
        &mut self,
        program: &[char],
        step_control: Option<&StepControl>,
    ) -> Result<(), MachineError> {
        let jump_map = build_jump_map(program, self.options.bracket_matching)?;
        let tape_len = self.tape.len();

        debug!(
            program_len = program.len(),
            tape_len,
            brackets = ?self.options.bracket_matching,
            eof = ?self.options.eof_policy,
            "starting run"
        );

        while self.instruction_pointer < program.len() {
            let ip = self.instruction_pointer;
            let Some(instr) = Instruction::decode(program[ip]) else {
                self.instruction_pointer += 1;
                continue;
            };

            if let Some(ctrl) = step_control {
                if ctrl.cancel_flag.load(Ordering::Relaxed) {
                    return Err(MachineError::Canceled);
                }
                if let Some(max) = ctrl.max_steps {
                    if self.cycle_count >= max {
                        return Err(MachineError::StepLimitExceeded { limit: max });
                    }
                }
            }

            let ptr = self.data_pointer;
            match instr {
                Instruction::Right => self.data_pointer = wrapping_next(ptr, tape_len),
                Instruction::Left => self.data_pointer = wrapping_prev(ptr, tape_len),
                Instruction::Increment => self.tape[ptr] = self.tape[ptr].wrapping_add(1),
                Instruction::Decrement => self.tape[ptr] = self.tape[ptr].wrapping_sub(1),
                Instruction::Output => {
                    let b = [self.tape[ptr]];
                    self.output.push(b[0]);
                    if let Some(sink) = self.output_sink.as_mut() {
                        (sink)(&b);
                    }
                }
                Instruction::Input => match self.input.get(self.input_cursor) {
                    Some(&b) => {
                        self.tape[ptr] = b;
                        self.input_cursor += 1;
                    }
                    None => match self.options.eof_policy {
                        EofPolicy::Zero => self.tape[ptr] = 0,
                        EofPolicy::Unchanged => {}
                        EofPolicy::Fail => return Err(MachineError::InputExhausted { ip }),
                    },
                },
                // Land on the partner bracket; the increment below steps past it.
                Instruction::LoopStart => {
                    if self.tape[ptr] == 0 {
                        if let Some(j) = jump_map[ip] {
                            self.instruction_pointer = j;
                        }
                    }
                }
                Instruction::LoopEnd => {
                    if self.tape[ptr] != 0 {
                        if let Some(j) = jump_map[ip] {
                            self.instruction_pointer = j;
                        }
                    }
                }
            }

            trace!(
                cycle = self.cycle_count,
                ip,
                instr = %program[ip],
                ptr = self.data_pointer,
                cell = self.tape[self.data_pointer],
                "step"
            );

            self.instruction_pointer += 1;
            self.cycle_count += 1;
        }

        debug!(cycles = self.cycle_count, output_len = self.output.len(), "run finished");
        Ok(())
    }

    /// Every byte written by `.`, in execution order.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Consume the machine, keeping only its output.
    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    /// Number of recognized instructions executed so far.
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn data_pointer(&self) -> usize {
        self.data_pointer
    }

    pub fn instruction_pointer(&self) -> usize {
        self.instruction_pointer
    }

    pub fn tape(&self) -> &[u8] {
        &self.tape
    }

    /// Length of the loaded program in characters (0 if none is loaded).
    pub fn program_len(&self) -> usize {
        self.program.as_ref().map_or(0, Vec::len)
    }

    pub fn options(&self) -> &MachineOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn machine_with(code: &str, tape_length: usize, bracket_matching: BracketMatching) -> Machine {
        let mut m = Machine::with_options(MachineOptions {
            tape_length,
            bracket_matching,
            ..MachineOptions::default()
        })
        .expect("valid options");
        m.load(code).expect("fresh machine");
        m
    }

    fn run_small(code: &str) -> Machine {
        let mut m = machine_with(code, 10, BracketMatching::Nested);
        m.run().expect("program should run");
        m
    }

    fn chars(code: &str) -> Vec<char> {
        code.chars().collect()
    }

    #[test]
    fn second_load_is_rejected() {
        let mut m = Machine::new();
        m.load("+").unwrap();
        assert!(matches!(m.load("-"), Err(MachineError::ProgramAlreadyLoaded)));
        m.run().unwrap();
        assert_eq!(m.tape()[0], 1, "first program stays bound");
    }

    #[test]
    fn run_without_program_errors() {
        let mut m = Machine::new();
        assert!(matches!(m.run(), Err(MachineError::NoProgramLoaded)));
    }

    #[test]
    fn zero_length_tape_is_rejected() {
        let options = MachineOptions { tape_length: 0, ..MachineOptions::default() };
        assert!(matches!(Machine::with_options(options), Err(MachineError::InvalidTapeLength(0))));
    }

    #[test]
    fn default_tape_has_thirty_thousand_cells() {
        let m = Machine::new();
        assert_eq!(m.tape().len(), 30_000);
        assert!(m.tape().iter().all(|&c| c == 0));
    }

    #[test]
    fn right_from_last_cell_wraps_to_zero() {
        let m = run_small(&">".repeat(10));
        assert_eq!(m.data_pointer(), 0);
    }

    #[test]
    fn left_from_cell_zero_wraps_to_last() {
        let m = run_small("<");
        assert_eq!(m.data_pointer(), 9);
    }

    #[test]
    fn single_cell_tape_stays_on_cell_zero() {
        let mut m = machine_with("><<>>+", 1, BracketMatching::Nested);
        m.run().unwrap();
        assert_eq!(m.data_pointer(), 0);
        assert_eq!(m.tape(), &[1]);
    }

    #[test]
    fn wrapping_subtraction() {
        let m = run_small("-");
        assert_eq!(m.tape()[0], 255);
    }

    #[test]
    fn wrapping_addition() {
        let m = run_small(&"+".repeat(257));
        assert_eq!(m.tape()[0], 1);
        assert_eq!(m.cycle_count(), 257);
    }

    #[test]
    fn dots_output_initial_zeros() {
        let mut m = Machine::new();
        m.load("...").unwrap();
        m.run().unwrap();
        assert_eq!(m.output(), &[0, 0, 0]);
        assert_eq!(m.cycle_count(), 3);
    }

    #[test]
    fn increments_then_output() {
        let mut m = Machine::new();
        m.load("+++.").unwrap();
        m.run().unwrap();
        assert_eq!(m.output(), &[3]);
        assert_eq!(m.cycle_count(), 4);
    }

    #[test]
    fn comments_do_not_count_as_cycles() {
        let m = run_small("+a+");
        assert_eq!(m.cycle_count(), 2);
        assert_eq!(m.tape()[0], 2);
        assert_eq!(m.instruction_pointer(), 3);
    }

    #[test]
    fn empty_program_runs_zero_cycles() {
        let m = run_small("");
        assert_eq!(m.cycle_count(), 0);
        assert!(m.output().is_empty());
    }

    #[test]
    fn unmatched_open_bracket_is_reported_before_execution() {
        let mut m = machine_with("+[.", 10, BracketMatching::Nested);
        let result = m.run();
        assert!(matches!(
            result,
            Err(MachineError::UnmatchedBracket { ip: 1, direction: ScanDirection::Forward })
        ));
        assert_eq!(m.cycle_count(), 0);
        assert!(m.output().is_empty());
    }

    #[test]
    fn unmatched_close_bracket_is_reported() {
        let mut m = machine_with("+.]", 10, BracketMatching::Nested);
        assert!(matches!(
            m.run(),
            Err(MachineError::UnmatchedBracket { ip: 2, direction: ScanDirection::Backward })
        ));
    }

    #[test]
    fn flat_matching_reports_unmatched_brackets_too() {
        let mut m = machine_with("[", 10, BracketMatching::Flat);
        assert!(matches!(
            m.run(),
            Err(MachineError::UnmatchedBracket { ip: 0, direction: ScanDirection::Forward })
        ));
    }

    #[test]
    fn nested_extra_open_bracket_is_unmatched() {
        // The outer '[' has no partner once the inner pair is accounted for.
        let mut m = machine_with("[[]", 10, BracketMatching::Nested);
        assert!(matches!(
            m.run(),
            Err(MachineError::UnmatchedBracket { ip: 0, direction: ScanDirection::Forward })
        ));
        // Flat pairs both '[' with the single ']'.
        let mut m = machine_with("[[]", 10, BracketMatching::Flat);
        assert!(m.run().is_ok());
    }

    #[test]
    fn seeks_follow_the_matching_policy() {
        let program = chars("[[]]");
        assert_eq!(seek_forward(&program, 0, BracketMatching::Nested), Some(3));
        assert_eq!(seek_forward(&program, 0, BracketMatching::Flat), Some(2));
        assert_eq!(seek_backward(&program, 3, BracketMatching::Nested), Some(0));
        assert_eq!(seek_backward(&program, 3, BracketMatching::Flat), Some(1));
        assert_eq!(seek_forward(&program, 1, BracketMatching::Nested), Some(2));
        assert_eq!(seek_backward(&chars("]"), 0, BracketMatching::Nested), None);
        assert_eq!(seek_forward(&chars("[a+"), 0, BracketMatching::Flat), None);
    }

    #[test]
    fn skipped_loop_resumes_after_closing_bracket() {
        // Stop right after '[' executes on a zero cell.
        let mut m = machine_with("[-]+", 10, BracketMatching::Nested);
        let result = m.run_with_control(StepControl::new(Some(1), Arc::default()));
        assert!(matches!(result, Err(MachineError::StepLimitExceeded { limit: 1 })));
        assert_eq!(m.instruction_pointer(), 3);
        assert_eq!(m.cycle_count(), 1);
    }

    #[test]
    fn repeated_loop_resumes_at_first_body_instruction() {
        // + + [ - ] : the ']' sees 1 and jumps, landing on index 3.
        let mut m = machine_with("++[-]", 10, BracketMatching::Nested);
        let result = m.run_with_control(StepControl::new(Some(5), Arc::default()));
        assert!(matches!(result, Err(MachineError::StepLimitExceeded { limit: 5 })));
        assert_eq!(m.instruction_pointer(), 3);
        assert_eq!(m.tape()[0], 1);
    }

    #[test]
    fn loop_cycle_counts_include_bracket_tests() {
        // +,+,[,-,] then -,] : the '[' is not re-tested on repeat.
        let m = run_small("++[-]");
        assert_eq!(m.cycle_count(), 7);
        assert_eq!(m.tape()[0], 0);

        let m = run_small("[.]");
        assert_eq!(m.cycle_count(), 1);
        assert!(m.output().is_empty());
    }

    #[test]
    fn nested_skip_jumps_over_the_whole_loop() {
        let m = run_small("[[.]]");
        assert_eq!(m.cycle_count(), 1);
        assert!(m.output().is_empty());
    }

    #[test]
    fn flat_skip_stops_at_inner_closing_bracket() {
        // '[' at 0 lands on the ']' at 3, so execution resumes with the ']' at 4.
        let mut m = machine_with("[[.]]", 10, BracketMatching::Flat);
        m.run().unwrap();
        assert_eq!(m.cycle_count(), 2);
        assert!(m.output().is_empty());

        // Work placed between the two closing brackets runs under flat matching.
        let mut m = machine_with("[[.]+.-]", 10, BracketMatching::Flat);
        m.run().unwrap();
        assert_eq!(m.output(), &[1]);
        assert_eq!(m.cycle_count(), 5);

        let m = run_small("[[.]+.-]");
        assert!(m.output().is_empty());
        assert_eq!(m.cycle_count(), 1);
    }

    #[test]
    fn nested_loops_run_to_completion() {
        // c0 = 1, c1 = 2; the outer loop runs twice, clearing c0 on its first pass.
        let m = run_small("+>++[<[-]>-]");
        assert_eq!(m.cycle_count(), 17);
        assert_eq!(&m.tape()[..3], &[0, 0, 0]);
    }

    #[test]
    fn flat_backward_jump_lands_on_inner_loop() {
        // The outer ']' jumps to the inner '[' and the program marches right.
        let mut m = machine_with("+>++[<[-]>-]", 8, BracketMatching::Flat);
        let result = m.run_with_control(StepControl::new(Some(16), Arc::default()));
        assert!(matches!(result, Err(MachineError::StepLimitExceeded { limit: 16 })));
        assert_eq!(m.data_pointer(), 2);
        assert_eq!(m.tape()[2], 255);
        assert_eq!(m.instruction_pointer(), 11);
    }

    #[test]
    fn deeply_nested_program_validates_quickly() {
        let code = format!("{}{}", "[".repeat(40_000), "]".repeat(40_000));

        let mut m = machine_with(&code, 10, BracketMatching::Nested);
        m.run().unwrap();
        assert_eq!(m.cycle_count(), 1);

        // Flat: the first '[' lands on the first ']', then every ']' falls through.
        let mut m = machine_with(&code, 10, BracketMatching::Flat);
        m.run().unwrap();
        assert_eq!(m.cycle_count(), 40_000);
    }

    #[test]
    fn earliest_unmatched_bracket_is_reported() {
        let cases = [
            ("]][", BracketMatching::Nested, 0, ScanDirection::Backward),
            ("[]][[", BracketMatching::Nested, 2, ScanDirection::Backward),
            ("+[[[]", BracketMatching::Nested, 1, ScanDirection::Forward),
            ("][]", BracketMatching::Flat, 0, ScanDirection::Backward),
            ("[]+[", BracketMatching::Flat, 3, ScanDirection::Forward),
        ];
        for (code, matching, want_ip, want_direction) in cases {
            let mut m = machine_with(code, 10, matching);
            match m.run() {
                Err(MachineError::UnmatchedBracket { ip, direction }) => {
                    assert_eq!((ip, direction), (want_ip, want_direction), "{code}");
                }
                other => panic!("{code}: expected unmatched bracket, got {other:?}"),
            }
        }
    }

    #[test]
    fn hello_world_prints() {
        let code = concat!(
            "++++++++++[>+++++++>++++++++++>+++>+<<<<-]",
            ">++.>+.+++++++..+++.>++.<<+++++++++++++++.>.+++.------.--------.>+.>.",
        );
        let mut m = Machine::new();
        m.load(code).unwrap();
        m.run().unwrap();
        assert_eq!(m.output(), b"Hello World!\n");
    }

    #[test]
    fn input_is_consumed_in_order() {
        let mut m = machine_with(",.,.,.", 10, BracketMatching::Nested);
        m.set_input(b"abc".to_vec());
        m.run().unwrap();
        assert_eq!(m.output(), b"abc");
        assert_eq!(m.cycle_count(), 6);
    }

    #[test]
    fn exhausted_input_follows_eof_policy() {
        let run = |eof_policy| {
            let options = MachineOptions { eof_policy, ..MachineOptions::default() };
            let mut m = Machine::with_options(options).unwrap();
            m.load("+++,.").unwrap();
            m.set_input(Vec::new());
            let result = m.run();
            (result, m.into_output())
        };

        let (result, out) = run(EofPolicy::Zero);
        assert!(result.is_ok());
        assert_eq!(out, vec![0]);

        let (result, out) = run(EofPolicy::Unchanged);
        assert!(result.is_ok());
        assert_eq!(out, vec![3]);

        let (result, out) = run(EofPolicy::Fail);
        assert!(matches!(result, Err(MachineError::InputExhausted { ip: 3 })));
        assert!(out.is_empty());
    }

    #[test]
    fn output_sink_sees_every_byte() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let mut m = machine_with("+.+.+.", 10, BracketMatching::Nested);
        m.set_output_sink(move |bytes| sink_seen.lock().unwrap().extend_from_slice(bytes));
        m.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(m.output(), &[1, 2, 3]);
    }

    #[test]
    fn cancel_flag_stops_execution() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut m = machine_with("+[]", 10, BracketMatching::Nested);
        let result = m.run_with_control(StepControl::new(None, cancel));
        assert!(matches!(result, Err(MachineError::Canceled)));
        assert_eq!(m.cycle_count(), 0);
    }

    #[test]
    fn step_limit_ignores_comments() {
        let mut m = machine_with("+ comment +", 10, BracketMatching::Nested);
        assert!(m.run_with_control(StepControl::new(Some(2), Arc::default())).is_ok());
        assert_eq!(m.cycle_count(), 2);
    }

    #[test]
    fn identical_runs_are_deterministic() {
        let run = || {
            let mut m = Machine::new();
            m.load(",[.-]").unwrap();
            m.set_input(b"\x05".to_vec());
            m.run().unwrap();
            (m.output().to_vec(), m.cycle_count())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn instruction_decoding() {
        assert_eq!(Instruction::decode('>'), Some(Instruction::Right));
        assert_eq!(Instruction::decode(']'), Some(Instruction::LoopEnd));
        assert_eq!(Instruction::decode('a'), None);
        assert_eq!(Instruction::decode('\n'), None);
    }
}
