//! Error types for BSP I2C validation.
//!
//! `BspError` is the single error type returned by every collaborator trait and by
//! the procedures that drive them. The variants follow how a failure affects a
//! scenario:
//!
//! - **`Provision`**: the kernel rejected adapter creation or teardown. Fatal for the
//!   scenario, but the scoped-adapter guard still attempts teardown.
//! - **`DetectionFault`**: probing a device hit a bus-access fault. This is distinct
//!   from a device that simply does not answer, which is `Ok(false)`.
//! - **`DeviceMissing`**: a declared device did not acknowledge its address.
//! - **`Verification`**: a transaction returned something other than the golden value.
//!   Recorded with full context; sibling transactions keep running.
//! - **`Aggregate`**: every failure collected behind a join barrier. Nothing is dropped
//!   in favor of something else.
//! - **`Tool`**: an i2c-tools invocation could not be run, exited non-zero, or timed out.
//! - **`Topology`** / **`Config`**: the board description is malformed or inconsistent.
//!
//! With `#[from]`, I/O and figment errors convert directly so `?` works across the crate.

use std::fmt;

use thiserror::Error;

use crate::topology::{I2cAddress, Register, RegisterValue};

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, BspError>;

#[derive(Error, Debug)]
pub enum BspError {
    #[error("Provisioning error for aux device '{aux}': {message}")]
    Provision { aux: String, message: String },

    #[error("Detection fault on bus {bus} at {address}: {message}")]
    DetectionFault {
        bus: u32,
        address: I2cAddress,
        message: String,
    },

    #[error("No device responded on bus {bus} at {address}")]
    DeviceMissing { bus: u32, address: I2cAddress },

    #[error(transparent)]
    Verification(#[from] VerificationFailure),

    #[error("{} failure(s): {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<BspError>),

    #[error("Tool '{program}' failed: {message}")]
    Tool { program: String, message: String },

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Task(String),
}

fn join_messages(errors: &[BspError]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<figment::Error> for BspError {
    fn from(value: figment::Error) -> Self {
        BspError::Config(Box::new(value))
    }
}

impl BspError {
    /// Merge a list of failures into one error.
    ///
    /// Returns `Ok(())` for an empty list and the lone error unchanged for a single
    /// entry, so callers only see `Aggregate` when there really is more than one.
    /// Nested aggregates are flattened.
    pub fn aggregate(errors: Vec<BspError>) -> Result<()> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                BspError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(BspError::Aggregate(flat)),
        }
    }

    /// Attach a second failure (typically from teardown) without losing this one.
    pub fn combine(self, other: BspError) -> BspError {
        let mut errors = match self {
            BspError::Aggregate(inner) => inner,
            err => vec![err],
        };
        match other {
            BspError::Aggregate(inner) => errors.extend(inner),
            err => errors.push(err),
        }
        BspError::Aggregate(errors)
    }

    /// Flattened view of every individual failure carried by this error.
    pub fn failures(&self) -> Vec<&BspError> {
        match self {
            BspError::Aggregate(inner) => inner.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }

    /// True when the error is a golden-value mismatch rather than an access fault.
    pub fn is_verification(&self) -> bool {
        matches!(self, BspError::Verification(_))
    }

    pub(crate) fn provision(aux: impl Into<String>, message: impl Into<String>) -> Self {
        BspError::Provision {
            aux: aux.into(),
            message: message.into(),
        }
    }

    pub(crate) fn tool(program: impl Into<String>, message: impl Into<String>) -> Self {
        BspError::Tool {
            program: program.into(),
            message: message.into(),
        }
    }
}

/// Which kind of transaction produced a verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Ranged `i2cdump` read.
    Dump,
    /// Single-register `i2cget` read.
    Get,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Dump => write!(f, "i2cdump"),
            TransactionKind::Get => write!(f, "i2cget"),
        }
    }
}

/// What a transaction observed versus what the topology declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Dump results, one value per register in the requested range.
    Registers {
        actual: Vec<RegisterValue>,
        expected: Vec<RegisterValue>,
        /// First register whose value differs, or `None` when only the lengths differ.
        first_mismatch: Option<Mismatch>,
    },
    /// Get results, compared textually after trimming.
    Text { actual: String, expected: String },
}

/// The first differing register of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub offset: Register,
    pub actual: RegisterValue,
    pub expected: RegisterValue,
}

/// A transaction result that does not match its golden value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} verification failed for {address} on bus {bus} at {location}: {observation}")]
pub struct VerificationFailure {
    pub address: I2cAddress,
    pub bus: u32,
    pub kind: TransactionKind,
    /// Register range (`0x00-0x0f`) or single register (`0x10`) that was read.
    pub location: String,
    pub observation: Observation,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Registers {
                actual,
                expected,
                first_mismatch,
            } => {
                if let Some(m) = first_mismatch {
                    write!(
                        f,
                        "mismatch at offset {} (actual {} vs expected {}); ",
                        m.offset, m.actual, m.expected
                    )?;
                } else {
                    write!(
                        f,
                        "read {} value(s) but expected {}; ",
                        actual.len(),
                        expected.len()
                    )?;
                }
                write!(
                    f,
                    "actual {} expected {}",
                    render_values(actual),
                    render_values(expected)
                )
            }
            Observation::Text { actual, expected } => {
                write!(f, "output '{actual}' did not match expected '{expected}'")
            }
        }
    }
}

fn render_values(values: &[RegisterValue]) -> String {
    let inner = values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{inner}]")
}
