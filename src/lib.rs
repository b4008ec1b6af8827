//! A tiny tape machine for the eight-instruction `><+-.,[]` language.
//!
//! The crate is built around [`Machine`]: construct one, load exactly one
//! program into it, hand it an input buffer, run it, then read back the
//! output bytes and the number of cycles (executed instructions) it took.
//!
//! ```
//! use bf_machine::{BracketMatching, EofPolicy, Machine, MachineOptions};
//!
//! let mut machine = Machine::with_options(MachineOptions {
//!     bracket_matching: BracketMatching::Nested,
//!     eof_policy: EofPolicy::Zero,
//!     ..MachineOptions::default()
//! })
//! .expect("valid options");
//! machine.load(",[.,]").expect("fresh machine");
//! machine.set_input(b"hi".to_vec());
//! machine.run().expect("program should run");
//! assert_eq!(machine.output(), b"hi");
//! ```

pub mod cli_util;
pub mod config;
pub mod machine;

pub use config::{ConfigError, Settings};
pub use machine::{
    seek_backward, seek_forward, BracketMatching, EofPolicy, Instruction, Machine, MachineError,
    MachineOptions, ScanDirection, StepControl, DEFAULT_TAPE_LENGTH,
};
