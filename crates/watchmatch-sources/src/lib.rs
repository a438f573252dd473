pub mod error;
pub mod fetcher;
pub mod parser;
pub mod retry;
pub mod session;
pub mod tmdb;

pub use error::SourceError;
pub use fetcher::{HttpPageFetcher, PageFetcher, PageTransport, ReqwestTransport, TransportResponse};
pub use parser::{detect_format, parse_page, PageFormat, PageParser, WatchlistPage};
pub use retry::{Attempted, RetryPolicy};
pub use session::{SessionContext, SessionManager, SessionProvider, StaticSessionProvider};
pub use tmdb::{MetadataProvider, MetadataQuery, MovieDetails, ProviderMovie, TmdbProvider};
