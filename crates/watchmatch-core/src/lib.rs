pub mod normalize;
pub mod matching;
pub mod store;
pub mod writer;
pub mod events;
pub mod enrichment;
pub mod sync;
pub mod export;

pub use normalize::{normalize, normalize_entry, normalize_text};
pub use matching::{compute_matches, friend_view, intersect, FriendViewFilter, FriendViewRow, WatchlistSnapshot};
pub use store::{JobHistoryRow, NormalizedEntry, Store, StoreError, StoreStats};
pub use writer::{spawn_writer, WriterHandle};
pub use events::{EventHub, ProgressEvent, SyncEvent, SyncObserver};
pub use enrichment::{EnrichedMatch, MetadataClient};
pub use sync::{committed_keys, BatchStatus, BatchSummary, SyncError, SyncHandle, SyncOptions, SyncOrchestrator, SyncRequest};
pub use export::{export_matches_csv, write_matches_csv};
