use crate::store::{Store, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use watchmatch_models::{MatchResult, MovieMetadata, NormalizedKey};
use watchmatch_sources::{MetadataProvider, MetadataQuery, MovieDetails, ProviderMovie, RetryPolicy, SessionManager};

/// A match result with whatever metadata could be found for it
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrichedMatch {
    #[serde(flatten)]
    pub result: MatchResult,
    /// `None` when the provider has no match or could not be reached
    pub metadata: Option<MovieMetadata>,
}

impl EnrichedMatch {
    pub fn bare(result: MatchResult) -> Self {
        Self { result, metadata: None }
    }
}

/// Cache-first metadata lookups against the external provider.
///
/// Fresh cache entries (including negative ones) are served without a
/// request. Misses and expired entries are batched up to the provider's
/// limit, each batch taking one slot from the provider's rate-limit bucket.
/// Throttling is retried with backoff; once retries run out the affected
/// movies come back without metadata and nothing is cached for them.
///
/// Each movie the provider finds gets one more request for its details
/// (runtime, genres, director) through the same bucket and retry policy. If
/// that request gives up, the movie is cached without details.
pub struct MetadataClient {
    store: Arc<Store>,
    provider: Arc<dyn MetadataProvider>,
    sessions: Arc<SessionManager>,
    retry: RetryPolicy,
    ttl: chrono::Duration,
    batch_size: usize,
}

impl MetadataClient {
    pub fn new(store: Arc<Store>, provider: Arc<dyn MetadataProvider>, sessions: Arc<SessionManager>) -> Self {
        Self {
            store,
            provider,
            sessions,
            retry: RetryPolicy::default(),
            ttl: chrono::Duration::days(30),
            batch_size: 20,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Metadata for one movie; `Ok(None)` when it could not be fetched
    pub async fn lookup(&self, query: MetadataQuery) -> Result<Option<MovieMetadata>, StoreError> {
        let mut found = self.lookup_many(vec![query]).await?;
        Ok(found.pop().flatten())
    }

    /// Metadata for each query, in query order
    pub async fn lookup_many(&self, queries: Vec<MetadataQuery>) -> Result<Vec<Option<MovieMetadata>>, StoreError> {
        let now = Utc::now();
        let keys: Vec<NormalizedKey> = queries.iter().map(|q| q.key.clone()).collect();
        let cached = self
            .store
            .call(move |store| keys.iter().map(|k| store.get_metadata(k)).collect::<Result<Vec<_>, _>>())
            .await?;

        let mut results: Vec<Option<MovieMetadata>> = Vec::with_capacity(queries.len());
        let mut pending: Vec<(usize, MetadataQuery)> = Vec::new();
        for (index, (query, cached)) in queries.into_iter().zip(cached).enumerate() {
            match cached {
                Some(entry) if !entry.is_expired(now) => results.push(Some(entry)),
                _ => {
                    results.push(None);
                    pending.push((index, query));
                }
            }
        }

        debug!(
            operation = "metadata_lookup",
            cached = results.len() - pending.len(),
            pending = pending.len(),
            "Metadata cache checked"
        );
        if pending.is_empty() {
            return Ok(results);
        }

        let chunk_size = self.batch_size.min(self.provider.max_batch()).max(1);
        for chunk in pending.chunks(chunk_size) {
            let chunk_queries: Vec<MetadataQuery> = chunk.iter().map(|(_, q)| q.clone()).collect();
            let Some(answers) = self.fetch_batch(&chunk_queries).await else {
                continue;
            };

            let mut entries: Vec<MovieMetadata> = Vec::with_capacity(chunk_queries.len());
            for (query, answer) in chunk_queries.iter().zip(answers) {
                let details = match &answer {
                    Some(movie) if self.provider.has_details() => self.fetch_details(movie.external_id).await,
                    _ => None,
                };
                entries.push(self.to_metadata(query.key.clone(), answer, details, Utc::now()));
            }

            let to_store = entries.clone();
            self.store
                .call(move |store| to_store.iter().try_for_each(|entry| store.put_metadata(entry)))
                .await?;

            for ((index, _), entry) in chunk.iter().zip(entries) {
                results[*index] = Some(entry);
            }
        }

        Ok(results)
    }

    async fn fetch_batch(&self, queries: &[MetadataQuery]) -> Option<Vec<Option<ProviderMovie>>> {
        let provider = self.provider.as_ref();
        let sessions = self.sessions.as_ref();
        let outcome = self
            .retry
            .run(move |_| async move {
                sessions.acquire_slot(provider.host()).await?;
                provider.lookup_batch(queries).await
            })
            .await;

        match outcome.result {
            Ok(answers) if answers.len() == queries.len() => Some(answers),
            Ok(answers) => {
                warn!(
                    operation = "metadata_batch",
                    expected = queries.len(),
                    received = answers.len(),
                    "Provider returned a mismatched batch; skipping"
                );
                None
            }
            Err(e) => {
                warn!(
                    operation = "metadata_batch",
                    attempts = outcome.attempts,
                    batch = queries.len(),
                    error = %e,
                    "Metadata lookup gave up; continuing without metadata"
                );
                None
            }
        }
    }

    async fn fetch_details(&self, external_id: u64) -> Option<MovieDetails> {
        let provider = self.provider.as_ref();
        let sessions = self.sessions.as_ref();
        let outcome = self
            .retry
            .run(move |_| async move {
                sessions.acquire_slot(provider.host()).await?;
                provider.details(external_id).await
            })
            .await;

        match outcome.result {
            Ok(details) => details,
            Err(e) => {
                warn!(
                    operation = "metadata_details",
                    id = external_id,
                    attempts = outcome.attempts,
                    error = %e,
                    "Details lookup gave up; keeping search result only"
                );
                None
            }
        }
    }

    fn to_metadata(
        &self,
        key: NormalizedKey,
        answer: Option<ProviderMovie>,
        details: Option<MovieDetails>,
        fetched_at: chrono::DateTime<Utc>,
    ) -> MovieMetadata {
        let details = details.unwrap_or_default();
        match answer {
            Some(movie) => MovieMetadata {
                normalized_key: key,
                external_id: Some(movie.external_id),
                title: Some(movie.title),
                poster_url: movie.poster_url,
                rating: movie.rating,
                overview: movie.overview,
                release_date: movie.release_date,
                runtime_minutes: details.runtime_minutes,
                genres: details.genres,
                director: details.director,
                fetched_at,
                ttl_expires_at: fetched_at + self.ttl,
            },
            None => MovieMetadata::not_found(key, fetched_at, self.ttl),
        }
    }

    /// Attach metadata to each match. Negative cache entries and failed
    /// lookups both leave `metadata` empty.
    pub async fn enrich(&self, matches: Vec<MatchResult>) -> Result<Vec<EnrichedMatch>, StoreError> {
        let queries: Vec<MetadataQuery> = matches
            .iter()
            .map(|m| MetadataQuery {
                key: m.normalized_key.clone(),
                title: m.title.clone(),
                year: m.year,
            })
            .collect();

        let metadata = self.lookup_many(queries).await?;
        let enriched: Vec<EnrichedMatch> = matches
            .into_iter()
            .zip(metadata)
            .map(|(result, metadata)| EnrichedMatch {
                result,
                metadata: metadata.filter(MovieMetadata::is_found),
            })
            .collect();

        info!(
            operation = "enrich_matches",
            matches = enriched.len(),
            with_metadata = enriched.iter().filter(|m| m.metadata.is_some()).count(),
            "Enriched match results"
        );
        Ok(enriched)
    }
}
