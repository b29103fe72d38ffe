//! Ports and the data they carry.
//!
//! # Data
//!
//! Every output port created by a process owns a [`DataSpec`], which
//! describes the samples flowing through the port: a data class name, an
//! opaque structure string interpreted only by the components, and a fixed
//! sample size in bytes. The engine treats samples as opaque bytes.
//!
//! # Ring buffers
//!
//! Samples of an output port are stored in a [`Ring`] with one writer, the
//! producing process, and one reader per consumer. The capacity of the ring
//! is one more than the largest lag among its consumers, and its lock
//! discipline guarantees that a reader never observes a partially written
//! sample:
//!
//! ```text
//!          due slot: sample k is written here next
//!              │
//!   ┌───────┬──▼────┬───────┬───────┐
//!   │ k - 1 │ k - 4 │ k - 3 │ k - 2 │   slot = sample mod capacity
//!   └───────┴───────┴───────┴───────┘
//!              ▲
//!     the writer waits until every reader
//!     released sample k - 4
//! ```
//!
//! A process serviced at base time `T` reads, on an input with lag `L`, the
//! writer sample `floor(T / P_w) - L` where `P_w` is the writer's sample
//! period. The minimum lag is 1: a sample produced at time `T` is visible to
//! consumers from the writer's next period on.

mod ring;

pub use ring::{ReadGuard, ReaderId, Ring, RingBuilder, SlotState, WriteGuard};

use std::fmt;

/// Description of the samples carried by an output port.
#[derive(Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataSpec {
    class: String,
    structure: String,
    sample_bytes: usize,
}

impl DataSpec {
    /// Creates a description of `sample_bytes`-byte samples of class
    /// `class`.
    pub fn new(class: impl Into<String>, sample_bytes: usize) -> Self {
        Self {
            class: class.into(),
            structure: String::new(),
            sample_bytes,
        }
    }

    /// Sets the structure string.
    pub fn with_structure(mut self, structure: impl Into<String>) -> Self {
        self.structure = structure.into();
        self
    }

    /// Returns the data class.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns the structure string.
    pub fn structure(&self) -> &str {
        &self.structure
    }

    /// Returns the size of a sample in bytes.
    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }
}

impl fmt::Debug for DataSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] ({} bytes)", self.class, self.structure, self.sample_bytes)
    }
}
