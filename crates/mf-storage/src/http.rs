//! Paced HTTP fetching shared by every fundamentals provider.
//!
//! Each provider gets its own pacer and its own notion of "throttled":
//! besides 429 (and 503 carrying `Retry-After`), some providers answer a
//! quota breach with a 200 whose JSON body holds a marker key such as
//! Alpha Vantage's `Note`. A throttled answer pushes the provider's pacer
//! back so no other request to it starts during the pause.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Longest `Retry-After` the fetcher will wait out inside one call.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// What one exchange with a provider amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// The provider asked us to slow down, optionally saying for how long.
    Throttled(Option<Duration>),
    Transient,
    Reject,
}

pub fn judge_status(status: StatusCode, retry_after: Option<Duration>) -> Verdict {
    match status {
        s if s.is_success() => Verdict::Accept,
        StatusCode::TOO_MANY_REQUESTS => Verdict::Throttled(retry_after),
        StatusCode::SERVICE_UNAVAILABLE if retry_after.is_some() => Verdict::Throttled(retry_after),
        s if s.is_server_error() => Verdict::Transient,
        _ => Verdict::Reject,
    }
}

/// A successful body is a disguised throttle when it is a JSON object
/// carrying one of the provider's marker keys.
pub fn judge_body(markers: &[String], body: &[u8]) -> Verdict {
    if markers.is_empty() {
        return Verdict::Accept;
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) if markers.iter().any(|m| map.contains_key(m)) => Verdict::Throttled(None),
        _ => Verdict::Accept,
    }
}

fn judge_transport(err: &reqwest::Error) -> Verdict {
    if err.is_timeout() || err.is_connect() {
        Verdict::Transient
    } else {
        Verdict::Reject
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// How many extra attempts one fetch may make, and how long it waits.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub attempts: usize,
    pub first_delay: Duration,
    /// Upper bound for transient waits, and the pause used when a throttle
    /// comes without `Retry-After`.
    pub ceiling: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 2,
            first_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    pub fn none() -> Self {
        Self {
            attempts: 0,
            first_delay: Duration::ZERO,
            ceiling: Duration::ZERO,
        }
    }

    /// Doubles from `first_delay` per retry.
    pub fn transient_delay(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }

    pub fn throttle_pause(&self, retry_after: Option<Duration>) -> Duration {
        retry_after.map_or(self.ceiling, |wait| wait.min(MAX_RETRY_AFTER))
    }
}

/// `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPacing {
    pub burst: u32,
    pub interval: Duration,
}

impl ProviderPacing {
    /// `calls` requests per `window`, evenly spread once the burst is spent.
    pub fn per_window(calls: u32, window: Duration) -> Self {
        let calls = calls.max(1);
        Self {
            burst: calls,
            interval: window / calls,
        }
    }
}

/// Cell-rate pacer: `next_free` is the theoretical time the next request
/// may start, and up to `burst - 1` intervals of it may be borrowed ahead.
#[derive(Debug)]
pub struct ProviderPacer {
    interval: Duration,
    tolerance: Duration,
    next_free: Mutex<Instant>,
}

impl ProviderPacer {
    pub fn new(pacing: ProviderPacing) -> Self {
        Self {
            interval: pacing.interval,
            tolerance: pacing.interval.saturating_mul(pacing.burst.max(1) - 1),
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Reserves the next slot and waits for it outside the lock.
    pub async fn acquire(&self) {
        let wait = {
            let mut next_free = self.next_free.lock().await;
            let now = Instant::now();
            let slot = (*next_free).max(now);
            *next_free = slot + self.interval;
            slot.saturating_duration_since(now).saturating_sub(self.tolerance)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// No request starts before `pause` has passed, burst allowance included.
    pub async fn hold_off(&self, pause: Duration) {
        let mut next_free = self.next_free.lock().await;
        let resume = Instant::now() + pause + self.tolerance;
        if resume > *next_free {
            *next_free = resume;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub retry: RetrySchedule,
    /// Keyed by provider id.
    pub pacing: HashMap<String, ProviderPacing>,
    /// Top-level JSON keys that turn a 200 into a throttle, keyed by provider id.
    pub throttle_markers: HashMap<String, Vec<String>>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            retry: RetrySchedule::default(),
            pacing: HashMap::new(),
            throttle_markers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{source_id} is throttling requests")]
    Throttled { source_id: String },
    #[error("response body is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::HttpStatus { status: 429, .. })
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacers: HashMap<String, Arc<ProviderPacer>>,
    throttle_markers: HashMap<String, Vec<String>>,
    retry: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacers = config
            .pacing
            .iter()
            .map(|(source_id, pacing)| (source_id.clone(), Arc::new(ProviderPacer::new(*pacing))))
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacers,
            throttle_markers: config.throttle_markers,
            retry: config.retry,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %redact_api_keys(url));
        self.fetch_bytes_inner(source_id, url).instrument(span).await
    }

    async fn fetch_bytes_inner(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let pacer = self.pacers.get(source_id);
        let markers = self.throttle_markers.get(source_id).map(Vec::as_slice).unwrap_or(&[]);
        let mut retry = 0;
        loop {
            if let Some(pacer) = pacer {
                pacer.acquire().await;
            }

            let (verdict, error) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let wait = retry_after(resp.headers());
                    match judge_status(status, wait) {
                        Verdict::Accept => {
                            let body = resp.bytes().await?.to_vec();
                            match judge_body(markers, &body) {
                                Verdict::Accept => {
                                    return Ok(FetchedResponse {
                                        status,
                                        final_url,
                                        body,
                                    })
                                }
                                verdict => (
                                    verdict,
                                    FetchError::Throttled {
                                        source_id: source_id.to_string(),
                                    },
                                ),
                            }
                        }
                        verdict => (
                            verdict,
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: redact_api_keys(&final_url),
                            },
                        ),
                    }
                }
                Err(err) => (judge_transport(&err), FetchError::Request(err.without_url())),
            };

            let delay = match verdict {
                Verdict::Throttled(wait) => {
                    let pause = self.retry.throttle_pause(wait);
                    warn!(source_id, pause_ms = pause.as_millis() as u64, "provider throttled, pausing");
                    match pacer {
                        Some(pacer) => {
                            pacer.hold_off(pause).await;
                            Duration::ZERO
                        }
                        None => pause,
                    }
                }
                Verdict::Transient => self.retry.transient_delay(retry),
                Verdict::Accept | Verdict::Reject => return Err(error),
            };
            if retry >= self.retry.attempts {
                return Err(error);
            }
            debug!(error = %error, retry, "retrying request");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retry += 1;
        }
    }

    pub async fn fetch_json(&self, source_id: &str, url: &str) -> Result<JsonValue, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(source_id, url).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }
}

/// Mask `apiKey=` / `apikey=` query values so keys never reach the logs.
pub fn redact_api_keys(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((name, _)) if name.eq_ignore_ascii_case("apikey") => format!("{name}=***"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn av_markers() -> Vec<String> {
        vec!["Note".to_string(), "Information".to_string()]
    }

    #[test]
    fn statuses_map_to_provider_verdicts() {
        let wait = Some(Duration::from_secs(7));
        assert_eq!(judge_status(StatusCode::OK, None), Verdict::Accept);
        assert_eq!(judge_status(StatusCode::TOO_MANY_REQUESTS, None), Verdict::Throttled(None));
        assert_eq!(judge_status(StatusCode::SERVICE_UNAVAILABLE, wait), Verdict::Throttled(wait));
        assert_eq!(judge_status(StatusCode::SERVICE_UNAVAILABLE, None), Verdict::Transient);
        assert_eq!(judge_status(StatusCode::BAD_GATEWAY, None), Verdict::Transient);
        assert_eq!(judge_status(StatusCode::NOT_FOUND, None), Verdict::Reject);
        assert_eq!(judge_status(StatusCode::UNAUTHORIZED, None), Verdict::Reject);
    }

    #[test]
    fn quota_notes_in_a_success_body_are_throttles() {
        let note = json!({ "Note": "Our standard API call frequency is 5 calls per minute" });
        let overview = json!({ "Symbol": "IBM", "Name": "International Business Machines" });

        let note = serde_json::to_vec(&note).expect("json");
        assert_eq!(judge_body(&av_markers(), &note), Verdict::Throttled(None));
        assert_eq!(judge_body(&[], &note), Verdict::Accept);
        let overview = serde_json::to_vec(&overview).expect("json");
        assert_eq!(judge_body(&av_markers(), &overview), Verdict::Accept);
        assert_eq!(judge_body(&av_markers(), b"<html>not json</html>"), Verdict::Accept);
    }

    #[test]
    fn retry_after_is_honoured_up_to_a_minute() {
        let schedule = RetrySchedule {
            attempts: 5,
            first_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        assert_eq!(schedule.transient_delay(0), Duration::from_millis(100));
        assert_eq!(schedule.transient_delay(2), Duration::from_millis(350));
        assert_eq!(schedule.throttle_pause(None), Duration::from_millis(350));
        assert_eq!(schedule.throttle_pause(Some(Duration::from_secs(20))), Duration::from_secs(20));
        assert_eq!(schedule.throttle_pause(Some(Duration::from_secs(3600))), MAX_RETRY_AFTER);

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "12".parse().expect("header"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().expect("header"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn api_keys_are_redacted() {
        assert_eq!(
            redact_api_keys("https://api.polygon.io/v3/reference/tickers/AAPL?apiKey=secret"),
            "https://api.polygon.io/v3/reference/tickers/AAPL?apiKey=***"
        );
        assert_eq!(
            redact_api_keys("https://x.test/query?function=OVERVIEW&symbol=IBM&apikey=k"),
            "https://x.test/query?function=OVERVIEW&symbol=IBM&apikey=***"
        );
        assert_eq!(redact_api_keys("https://x.test/plain"), "https://x.test/plain");
    }

    #[test]
    fn free_tier_pacing_spreads_calls_over_the_window() {
        let pacing = ProviderPacing::per_window(5, Duration::from_secs(60));
        assert_eq!(pacing.burst, 5);
        assert_eq!(pacing.interval, Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_allows_the_burst_then_one_call_per_interval() {
        let pacer = ProviderPacer::new(ProviderPacing {
            burst: 2,
            interval: Duration::from_secs(10),
        });
        let started = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        pacer.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        pacer.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_off_blocks_even_an_unused_burst() {
        let pacer = ProviderPacer::new(ProviderPacing::per_window(5, Duration::from_secs(60)));
        pacer.hold_off(Duration::from_secs(30)).await;

        let started = Instant::now();
        pacer.acquire().await;
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    fn fetcher(attempts: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            retry: RetrySchedule {
                attempts,
                ..RetrySchedule::none()
            },
            throttle_markers: HashMap::from([("alpha_vantage".to_string(), av_markers())]),
            ..HttpClientConfig::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn success_with_a_quota_note_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Note": "call frequency exceeded" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Symbol": "IBM" })))
            .mount(&server)
            .await;

        let body = fetcher(1)
            .fetch_json("alpha_vantage", &format!("{}/query", server.uri()))
            .await
            .expect("second attempt succeeds");
        assert_eq!(body["Symbol"], "IBM");
    }

    #[tokio::test]
    async fn persistent_quota_note_surfaces_as_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Information": "daily limit reached" })))
            .expect(3)
            .mount(&server)
            .await;
        let url = format!("{}/query", server.uri());

        let err = fetcher(1).fetch_json("alpha_vantage", &url).await.expect_err("throttled");
        assert!(matches!(&err, FetchError::Throttled { source_id } if source_id == "alpha_vantage"));
        assert!(err.is_rate_limited());

        // Providers without markers take the body at face value.
        let body = fetcher(1).fetch_json("polygon", &url).await.expect("plain body");
        assert_eq!(body["Information"], "daily limit reached");
    }
}
