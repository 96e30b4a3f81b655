//! Wire-level packet types: the fragment header codec and the wraparound
//! sequence number used for both bus sequencing and dispatcher/receiver
//! keys.

pub mod header;
pub mod seq;

pub use header::{FragmentHeader, FragmentType};
pub use seq::Seq;
