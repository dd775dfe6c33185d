//! Credit eligibility gate.
//!
//! Scores come from an external scoring service and are treated as
//! best-effort: a lookup that fails, times out or reports no score counts as
//! zero, which fails every positive requirement. Nothing here is persisted.

use crate::error::{Disqualified, Error, Result};
use crate::models::Address;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default per-lookup timeout.
pub const DEFAULT_SCORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Response fields that may carry the score, in order of preference.
const SCORE_FIELDS: [&str; 3] = ["creditScore", "score", "credit_score"];

/// What the scoring service said about a participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreLookup {
    Score(f64),
    NotAvailable,
}

/// An external source of eligibility scores.
#[async_trait]
pub trait ScoreSource: Send + Sync {
    /// Look up the score for `participant`.
    async fn lookup(&self, participant: &Address) -> Result<ScoreLookup>;
}

/// Scoring service reached over HTTP (`GET {base}/api/borrower/{address}`).
pub struct HttpScoreSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpScoreSource {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, participant: &Address) -> String {
        format!("{}/api/borrower/{}", self.base_url, participant)
    }
}

#[async_trait]
impl ScoreSource for HttpScoreSource {
    async fn lookup(&self, participant: &Address) -> Result<ScoreLookup> {
        let response = self
            .client
            .get(self.url(participant))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "score service returned {} for {}",
                status, participant
            )));
        }

        let body: Value = response.json().await?;
        Ok(extract_score(&body))
    }
}

/// Pull a score out of a scoring-service response.
///
/// The first non-empty, non-zero candidate wins; top-level fields before the
/// nested `data` object. `null`, `"N/A"` and non-numeric text mean no score.
pub fn extract_score(body: &Value) -> ScoreLookup {
    let nested = body.get("data");
    let candidates = SCORE_FIELDS
        .iter()
        .map(|field| body.get(*field))
        .chain(["creditScore", "score"].iter().map(|field| nested.and_then(|d| d.get(*field))));

    for candidate in candidates.flatten() {
        match candidate {
            Value::Number(n) => match n.as_f64() {
                Some(score) if score != 0.0 => return ScoreLookup::Score(score),
                _ => continue,
            },
            Value::String(s) if !s.trim().is_empty() => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("n/a") {
                    return ScoreLookup::NotAvailable;
                }
                return match s.parse::<f64>() {
                    Ok(score) if score.is_finite() => ScoreLookup::Score(score),
                    _ => ScoreLookup::NotAvailable,
                };
            }
            _ => continue,
        }
    }
    ScoreLookup::NotAvailable
}

/// Fixed scores held in memory; unknown participants have no score.
#[derive(Debug, Default, Clone)]
pub struct StaticScoreSource {
    scores: HashMap<Address, ScoreLookup>,
}

impl StaticScoreSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a participant's score.
    pub fn with_score(mut self, participant: Address, score: f64) -> Self {
        self.scores.insert(participant, ScoreLookup::Score(score));
        self
    }

    /// Mark a participant as having no score.
    pub fn with_unavailable(mut self, participant: Address) -> Self {
        self.scores.insert(participant, ScoreLookup::NotAvailable);
        self
    }
}

#[async_trait]
impl ScoreSource for StaticScoreSource {
    async fn lookup(&self, participant: &Address) -> Result<ScoreLookup> {
        Ok(self
            .scores
            .get(participant)
            .copied()
            .unwrap_or(ScoreLookup::NotAvailable))
    }
}

/// Outcome of checking one participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eligibility {
    Pass,
    Fail { score: f64 },
}

/// Outcome of checking a group; lists every participant that failed.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEligibility {
    Pass,
    Fail(Vec<Disqualified>),
}

/// Decides whether participants meet a credit requirement.
#[derive(Clone)]
pub struct EligibilityGate {
    source: Arc<dyn ScoreSource>,
    timeout: Duration,
}

impl EligibilityGate {
    /// Create a gate over `source` with the default lookup timeout.
    pub fn new(source: Arc<dyn ScoreSource>) -> Self {
        Self {
            source,
            timeout: DEFAULT_SCORE_TIMEOUT,
        }
    }

    /// Bound each lookup by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Score of `participant`, zero when unavailable.
    pub async fn score_of(&self, participant: &Address) -> f64 {
        self.score_before(participant, Instant::now() + self.timeout)
            .await
    }

    /// Score of `participant`, giving up at `deadline` (or the gate's own
    /// timeout, whichever is sooner).
    pub async fn score_before(&self, participant: &Address, deadline: Instant) -> f64 {
        let deadline = deadline.min(Instant::now() + self.timeout);
        match tokio::time::timeout_at(deadline, self.source.lookup(participant)).await {
            Ok(Ok(ScoreLookup::Score(score))) if score.is_finite() && score >= 0.0 => score,
            Ok(Ok(ScoreLookup::Score(score))) => {
                tracing::debug!("Unusable score {} for {}; counting as 0", score, participant);
                0.0
            }
            Ok(Ok(ScoreLookup::NotAvailable)) => {
                tracing::debug!("No score for {}; counting as 0", participant);
                0.0
            }
            Ok(Err(e)) => {
                tracing::warn!("Score lookup for {} failed: {}; counting as 0", participant, e);
                0.0
            }
            Err(_) => {
                tracing::warn!("Score lookup for {} timed out; counting as 0", participant);
                0.0
            }
        }
    }

    /// Scores for every participant, looked up concurrently.
    pub async fn scores(&self, participants: &[Address]) -> Vec<(Address, f64)> {
        self.scores_before(participants, Instant::now() + self.timeout)
            .await
    }

    /// [`scores`](Self::scores) with a caller deadline.
    pub async fn scores_before(
        &self,
        participants: &[Address],
        deadline: Instant,
    ) -> Vec<(Address, f64)> {
        join_all(participants.iter().map(|p| async move {
            (p.clone(), self.score_before(p, deadline).await)
        }))
        .await
    }

    /// Mean score rounded to two decimals; zero for nobody.
    pub async fn average_score(&self, participants: &[Address]) -> f64 {
        let scores: Vec<f64> = self
            .scores(participants)
            .await
            .into_iter()
            .map(|(_, s)| s)
            .collect();
        mean_score(&scores)
    }

    /// Whether `participant` meets `threshold`. A threshold of zero or less
    /// disables the check without a lookup.
    pub async fn check_threshold(&self, participant: &Address, threshold: f64) -> Eligibility {
        if !gated(threshold) {
            return Eligibility::Pass;
        }
        let score = self.score_of(participant).await;
        if score >= threshold {
            Eligibility::Pass
        } else {
            Eligibility::Fail { score }
        }
    }

    /// Check every participant and report all that fall short.
    pub async fn check_all(&self, participants: &[Address], threshold: f64) -> GroupEligibility {
        self.check_all_before(participants, threshold, Instant::now() + self.timeout)
            .await
    }

    /// [`check_all`](Self::check_all) with a caller deadline.
    pub async fn check_all_before(
        &self,
        participants: &[Address],
        threshold: f64,
        deadline: Instant,
    ) -> GroupEligibility {
        if !gated(threshold) {
            return GroupEligibility::Pass;
        }
        judge(&self.scores_before(participants, deadline).await, threshold)
    }
}

fn gated(threshold: f64) -> bool {
    threshold > 0.0
}

/// Judge already-fetched scores against `threshold`.
pub fn judge(scores: &[(Address, f64)], threshold: f64) -> GroupEligibility {
    if !gated(threshold) {
        return GroupEligibility::Pass;
    }
    let failures: Vec<Disqualified> = scores
        .iter()
        .filter(|(_, score)| *score < threshold)
        .map(|(participant, score)| Disqualified {
            participant: participant.clone(),
            score: *score,
        })
        .collect();

    if failures.is_empty() {
        GroupEligibility::Pass
    } else {
        GroupEligibility::Fail(failures)
    }
}

/// Arithmetic mean rounded to two decimals; zero for an empty set.
///
/// Accumulated as a running mean so that scores near `f64::MAX` stay finite.
pub fn mean_score(scores: &[f64]) -> f64 {
    let mean = scores
        .iter()
        .enumerate()
        .fold(0.0, |mean, (i, &score)| mean + (score - mean) / (i + 1) as f64);
    if !mean.is_finite() {
        return 0.0;
    }
    let scaled = mean * 100.0;
    if scaled.is_finite() {
        scaled.round() / 100.0
    } else {
        mean
    }
}
