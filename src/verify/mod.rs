//! Transaction verification: output parsing and golden-value comparison.

pub mod parser;
pub mod runner;

pub use parser::{parse_detect_output, parse_dump_output};
pub use runner::TransactionRunner;
