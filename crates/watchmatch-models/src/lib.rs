pub mod friend;
pub mod normalized_key;
pub mod watchlist;
pub mod match_result;
pub mod metadata;
pub mod sync_job;

pub use friend::{Friend, FriendId};
pub use normalized_key::{KeyConfidence, NormalizedKey};
pub use watchlist::{GenerationId, RawEntry, WatchlistEntry};
pub use match_result::{MatchMode, MatchResult};
pub use metadata::MovieMetadata;
pub use sync_job::{JobState, SyncJob};
