//! Concurrent retrieval from a set of equivalent HTTP endpoints.
//!
//! One GET is issued per URL and the first `required` answers win. All requests
//! share a single deadline; whatever is still in flight when the quorum is met or
//! the deadline passes is aborted.

use regex::Regex;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::{task::JoinSet, time::Instant};
use tracing::{debug, info, instrument, warn};

/// Reason a single endpoint did not produce a candidate answer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("empty response body")]
    EmptyBody,
}

/// What to fetch and how many answers are needed.
#[derive(Debug, Clone)]
pub struct Retrieval<'a> {
    /// Label used in log lines, e.g. `YK-KSM`.
    pub ident: &'a str,
    pub urls: &'a [String],
    pub required: usize,
    /// Advisory pattern: matches are logged, non-matching bodies are still answers.
    pub pattern: &'a Regex,
    /// Prefix each answer with `url=<source>\n`.
    pub include_source_url: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Retriever {
    client: Client,
}

impl Retriever {
    /// Build a retriever whose connections are never reused between calls.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch every URL concurrently and collect up to `required` answers.
    ///
    /// Returns fewer answers than requested (possibly none) when the deadline
    /// elapses or every endpoint has failed.
    #[instrument(skip(self, request), fields(ident = request.ident, urls = request.urls.len()))]
    pub async fn retrieve(&self, request: &Retrieval<'_>) -> Vec<String> {
        let deadline = Instant::now() + request.timeout;
        let mut answers = Vec::with_capacity(request.required);

        if request.required == 0 {
            return answers;
        }

        let mut in_flight = JoinSet::new();
        for url in request.urls {
            let client = self.client.clone();
            let url = url.clone();
            let timeout = request.timeout;
            in_flight.spawn(async move {
                let result = fetch(&client, &url, timeout).await;
                (url, result)
            });
        }

        loop {
            let joined = match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                Err(_) => {
                    info!("{}: deadline reached with {} answer(s)", request.ident, answers.len());
                    break;
                }
                Ok(None) => {
                    debug!("{}: all endpoints done", request.ident);
                    break;
                }
                Ok(Some(joined)) => joined,
            };

            let (url, result) = match joined {
                Ok(completed) => completed,
                Err(err) => {
                    warn!("{}: endpoint task failed: {}", request.ident, err);
                    continue;
                }
            };

            let body = match result {
                Ok(body) => body,
                Err(err) => {
                    info!("{}: {} error: {}", request.ident, url, err);
                    continue;
                }
            };

            if request.pattern.is_match(&body) {
                debug!("{}: response matches {}", request.ident, request.pattern);
            }

            if request.include_source_url {
                answers.push(format!("url={url}\n{body}"));
            } else {
                answers.push(body);
            }

            if answers.len() >= request.required {
                break;
            }
        }

        // Cancel whatever is still running.
        in_flight.abort_all();

        answers
    }
}

async fn fetch(client: &Client, url: &str, timeout: Duration) -> Result<String, FetchError> {
    let response = client.get(url).timeout(timeout).send().await?;

    if response.status() != StatusCode::OK {
        return Err(FetchError::Status(response.status()));
    }

    let body = response.text().await?;
    if body.is_empty() {
        return Err(FetchError::EmptyBody);
    }

    Ok(body)
}
