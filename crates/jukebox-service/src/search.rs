//! Turning free-text queries into selectable audio results.
//!
//! Ranking is left entirely to the [`SearchProvider`]; this module only picks the top results and
//! links them to the audio endpoint.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::SearchConfig;
use crate::fetch::expand_placeholders;
use crate::types::FetchKey;

/// One entry returned by a [`SearchProvider`], in ranking order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchCandidate {
    pub id: Option<String>,
    pub title: Option<String>,
    pub artists: Vec<String>,
}

pub trait SearchProvider: Send + Sync + 'static {
    /// Returns up to `limit` ranked candidates for `query`.
    fn search<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchCandidate>>>;
}

/// A result that can be offered to a user and played through `/audio/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InlineAudioResult {
    /// The position of the candidate in the provider's ranking.
    pub id: String,
    pub audio_url: String,
    pub title: String,
    pub performer: String,
}

/// Searches for `query` and maps the first `limit` candidates to audio results.
///
/// Candidates without a usable id are skipped, but still count towards `limit`. Provider
/// failures are logged and produce no results.
pub async fn inline_results(
    provider: &dyn SearchProvider,
    query: &str,
    base_url: &str,
    limit: usize,
) -> Vec<InlineAudioResult> {
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }

    let candidates = match provider.search(query, limit).await {
        Ok(candidates) => candidates,
        Err(err) => {
            tracing::error!(error = ?err, query, "Search failed");
            metric!(counter("search.failed") += 1);
            return Vec::new();
        }
    };

    let base_url = base_url.trim_end_matches('/');
    let results: Vec<_> = candidates
        .into_iter()
        .take(limit)
        .enumerate()
        .filter_map(|(position, candidate)| {
            let Some(id) = candidate.id else {
                tracing::debug!(position, "Skipping search result without id");
                return None;
            };
            let key = match FetchKey::parse(&id) {
                Ok(key) => key,
                Err(err) => {
                    tracing::debug!(position, %id, %err, "Skipping search result");
                    return None;
                }
            };
            let performer = if candidate.artists.is_empty() {
                "Unknown".to_owned()
            } else {
                candidate.artists.join(", ")
            };
            Some(InlineAudioResult {
                id: position.to_string(),
                audio_url: format!("{base_url}/audio/{key}"),
                title: candidate.title.unwrap_or_else(|| key.to_string()),
                performer,
            })
        })
        .collect();

    tracing::info!(query, results = results.len(), "Answered search");
    metric!(time_raw("search.results") = results.len() as u64);
    results
}

/// Searches by running an external program that prints one JSON object per line.
///
/// This matches the output of `yt-dlp --flat-playlist --dump-json`.
#[derive(Clone, Debug)]
pub struct CommandSearchProvider {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSearchProvider {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
        }
    }

    async fn run(&self, query: &str, limit: usize) -> Result<Vec<SearchCandidate>> {
        let limit = limit.to_string();
        let vars = [("query", query), ("limit", limit.as_str())];
        let args: Vec<_> = self
            .args
            .iter()
            .map(|arg| expand_placeholders(arg, &vars))
            .collect();

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.program.display()))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("search timed out after {:?}", self.timeout))?
            .context("failed to wait for search program")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            );
        }

        Ok(parse_json_lines(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl SearchProvider for CommandSearchProvider {
    fn search<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<SearchCandidate>>> {
        Box::pin(self.run(query, limit))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArtist {
    Name(String),
    Object { name: Option<String> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEntry {
    id: Option<String>,
    title: Option<String>,
    artists: Option<Vec<RawArtist>>,
    artist: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
}

impl From<RawEntry> for SearchCandidate {
    fn from(entry: RawEntry) -> Self {
        let mut artists: Vec<String> = entry
            .artists
            .unwrap_or_default()
            .into_iter()
            .filter_map(|artist| match artist {
                RawArtist::Name(name) => Some(name),
                RawArtist::Object { name } => name,
            })
            .collect();
        if artists.is_empty() {
            artists.extend(entry.artist.or(entry.channel).or(entry.uploader));
        }

        Self {
            id: entry.id,
            title: entry.title,
            artists,
        }
    }
}

fn parse_json_lines(stdout: &str) -> Vec<SearchCandidate> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<RawEntry>(line) {
            Ok(entry) => Some(entry.into()),
            Err(err) => {
                tracing::debug!(%err, "Skipping malformed search output line");
                None
            }
        })
        .collect()
}
