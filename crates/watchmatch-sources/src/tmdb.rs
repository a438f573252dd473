use crate::error::SourceError;
use crate::fetcher::{classify_status, parse_retry_after};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use watchmatch_models::NormalizedKey;

/// What the metadata client asks the provider about one movie
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataQuery {
    pub key: NormalizedKey,
    /// Human-readable title used as the search string
    pub title: String,
    pub year: Option<u16>,
}

/// Provider answer for a movie it recognised
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMovie {
    pub external_id: u64,
    pub title: String,
    pub poster_url: Option<String>,
    pub rating: Option<f32>,
    pub overview: Option<String>,
    pub release_date: Option<String>,
}

/// Per-movie details that the search endpoint does not return
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovieDetails {
    pub runtime_minutes: Option<u32>,
    pub genres: Vec<String>,
    /// Comma separated when the movie has several directors
    pub director: Option<String>,
}

/// External movie metadata API.
///
/// `lookup_batch` returns one answer per query, in query order; `Ok(None)`
/// means the provider has no match. A `Throttled` error applies to the whole
/// batch.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Rate limit bucket key
    fn host(&self) -> &str;

    /// Largest number of queries one `lookup_batch` call accepts
    fn max_batch(&self) -> usize {
        1
    }

    async fn lookup_batch(&self, queries: &[MetadataQuery]) -> Result<Vec<Option<ProviderMovie>>, SourceError>;

    /// Whether [`MetadataProvider::details`] makes a request
    fn has_details(&self) -> bool {
        false
    }

    /// Runtime, genres and director for a movie `lookup_batch` found.
    /// `Ok(None)` when the provider has no details for it.
    async fn details(&self, _external_id: u64) -> Result<Option<MovieDetails>, SourceError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: u64,
    title: String,
    #[serde(default)]
    poster_path: Option<String>,
    #[serde(default)]
    vote_average: Option<f32>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    runtime: Option<u32>,
    #[serde(default)]
    genres: Vec<Genre>,
    #[serde(default)]
    credits: Option<Credits>,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Credits {
    #[serde(default)]
    crew: Vec<CrewMember>,
}

#[derive(Debug, Deserialize)]
struct CrewMember {
    name: String,
    #[serde(default)]
    job: Option<String>,
}

impl From<DetailsResponse> for MovieDetails {
    fn from(response: DetailsResponse) -> Self {
        let directors: Vec<String> = response
            .credits
            .map(|credits| credits.crew)
            .unwrap_or_default()
            .into_iter()
            .filter(|member| member.job.as_deref() == Some("Director"))
            .map(|member| member.name)
            .collect();
        Self {
            runtime_minutes: response.runtime.filter(|minutes| *minutes > 0),
            genres: response.genres.into_iter().map(|g| g.name).collect(),
            director: (!directors.is_empty()).then(|| directors.join(", ")),
        }
    }
}

/// TMDB client: `search/movie` for lookups, `movie/{id}` with credits for
/// details. One query per request.
pub struct TmdbProvider {
    client: Client,
    api_key: String,
    base_url: String,
    image_base_url: String,
    host: String,
}

impl TmdbProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        image_base_url: impl Into<String>,
        host: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::permanent("", format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            image_base_url: image_base_url.into().trim_end_matches('/').to_string(),
            host: host.into(),
        })
    }

    /// GET `url` with the API key and decode the JSON body
    async fn get_json<T: DeserializeOwned>(&self, url: &str, mut params: Vec<(&str, String)>) -> Result<T, SourceError> {
        params.push(("api_key", self.api_key.clone()));
        params.push(("language", "en-US".to_string()));

        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(|e| SourceError::transient(url, e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            return Err(SourceError::Throttled {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        classify_status(url, status, parse_retry_after(response.headers()))?;

        response
            .json()
            .await
            .map_err(|e| SourceError::Parse(format!("invalid TMDB response from {}: {}", url, e)))
    }

    async fn search(&self, query: &MetadataQuery) -> Result<Option<ProviderMovie>, SourceError> {
        let url = format!("{}/search/movie", self.base_url);
        let mut params = vec![("query", query.title.clone())];
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }
        let body: SearchResponse = self.get_json(&url, params).await?;

        let best = pick_best(body.results, query.year);
        debug!(query = %query.title, year = ?query.year, found = best.is_some(), "TMDB search");
        Ok(best.map(|r| ProviderMovie {
            external_id: r.id,
            title: r.title,
            poster_url: r
                .poster_path
                .filter(|p| !p.is_empty())
                .map(|p| format!("{}{}", self.image_base_url, p)),
            rating: r.vote_average,
            overview: r.overview.filter(|o| !o.is_empty()),
            release_date: r.release_date.filter(|d| !d.is_empty()),
        }))
    }
}

/// Prefer a result released in the requested year, else the top hit
fn pick_best(results: Vec<SearchResult>, year: Option<u16>) -> Option<SearchResult> {
    let year_prefix = year.map(|y| y.to_string());
    let mut results = results.into_iter();
    let first = results.next()?;

    let Some(prefix) = year_prefix else {
        return Some(first);
    };
    if first.release_date.as_deref().is_some_and(|d| d.starts_with(&prefix)) {
        return Some(first);
    }
    Some(
        results
            .find(|r| r.release_date.as_deref().is_some_and(|d| d.starts_with(&prefix)))
            .unwrap_or(first),
    )
}

#[async_trait]
impl MetadataProvider for TmdbProvider {
    fn host(&self) -> &str {
        &self.host
    }

    async fn lookup_batch(&self, queries: &[MetadataQuery]) -> Result<Vec<Option<ProviderMovie>>, SourceError> {
        let mut answers = Vec::with_capacity(queries.len());
        for query in queries {
            answers.push(self.search(query).await?);
        }
        Ok(answers)
    }

    fn has_details(&self) -> bool {
        true
    }

    async fn details(&self, external_id: u64) -> Result<Option<MovieDetails>, SourceError> {
        let url = format!("{}/movie/{}", self.base_url, external_id);
        let params = vec![("append_to_response", "credits".to_string())];
        match self.get_json::<DetailsResponse>(&url, params).await {
            Ok(response) => {
                let details = MovieDetails::from(response);
                debug!(id = external_id, runtime = ?details.runtime_minutes, "TMDB details");
                Ok(Some(details))
            }
            Err(SourceError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
