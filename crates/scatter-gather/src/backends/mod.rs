//! Reference [`crate::Persistence`] adapters. Adapters contain no protocol
//! logic of their own: they translate the port's operations into native
//! calls and nothing more.

pub mod dynamodb;
pub mod mongodb;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

/// Part rows are written and deleted in fixed-size chunks so that adapters
/// behave identically regardless of a given backend's own batch limit.
pub(crate) const BATCH_CHUNK_SIZE: usize = 25;
