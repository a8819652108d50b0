pub mod error;
pub mod mapped;
pub mod model;
pub mod store;

pub use crate::error::{Result, StoreError};
pub use crate::model::{MatchingRecord, NewRecord, RecordHash, Stats, MAX_LINKS};
pub use crate::store::{Config, RecordStore};
