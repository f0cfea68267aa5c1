//! Feature modules: journaling (with the snapshot access hooks) and the
//! snapshot engine itself.

pub mod journaling;
pub mod snapshot;

pub use journaling::{JournalConfig, JournalError, JournalManager, Transaction};
