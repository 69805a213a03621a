//! # svi-io
//!
//! The byte-level substrate of the SVI wire protocol: a growable binary
//! writer, a positioned reader, and a self-describing map format keyed by
//! small numeric field ids. `svi-wire` builds the object-level reducers
//! and producers on top of these primitives.

pub mod error;
pub mod reader;
pub mod value;
pub mod writer;

pub use error::{IoError, IoResult};
pub use reader::MemoryReader;
pub use value::{WireMap, WireValue};
pub use writer::BinaryWriter;
