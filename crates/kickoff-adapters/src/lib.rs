//! Upstream feed adapter: HTTP access, payload contracts and fixture normalization.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kickoff_core::{
    catalog_midnight, catalog_offset, normalize_stage, stage_code, Competition, FixtureDraft, MatchStatus,
};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "kickoff-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://api.football-data.org/v4";

/// Header carrying the static upstream credential.
pub const API_KEY_HEADER: &str = "X-Auth-Token";

/// A competition whose last matchday is further back than this is not polled.
pub const FRESHNESS_WINDOW_DAYS: i64 = 1;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid api key header: {0}")]
    InvalidApiKey(#[from] reqwest::header::InvalidHeaderValue),
}

#[derive(Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_key: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_key: None,
            global_concurrency: 4,
        }
    }
}

impl fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("global_concurrency", &self.global_concurrency)
            .finish()
    }
}

/// Single-attempt HTTP client. Failures surface to the caller; the next scheduled
/// pass is the retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            let mut value = HeaderValue::from_str(api_key)?;
            value.set_sensitive(true);
            headers.insert(API_KEY_HEADER, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let resp = self
            .client
            .get(url)
            .send()
            .instrument(info_span!("http_fetch", url))
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompetitionsPayload {
    #[serde(default)]
    pub competitions: Vec<CompetitionListing>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitionListing {
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub current_season: Option<SeasonPayload>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonPayload {
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchesPayload {
    pub competition: Option<CompetitionRef>,
    #[serde(default)]
    pub filters: FiltersPayload,
    pub result_set: Option<ResultSetPayload>,
    #[serde(default)]
    pub matches: Vec<MatchPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompetitionRef {
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersPayload {
    pub season: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultSetPayload {
    pub first: Option<String>,
    pub last: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPayload {
    #[serde(default)]
    pub home_team: TeamPayload,
    #[serde(default)]
    pub away_team: TeamPayload,
    pub utc_date: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stage: String,
    pub matchday: Option<u32>,
    #[serde(default)]
    pub score: ScorePayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamPayload {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorePayload {
    #[serde(default)]
    pub full_time: GoalsPayload,
    pub penalties: Option<GoalsPayload>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct GoalsPayload {
    pub home: Option<i32>,
    pub away: Option<i32>,
}

/// Why a fixture was left out of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingTeam,
    UnmappedStage,
    BadKickoff,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFixtures {
    pub drafts: Vec<FixtureDraft>,
    pub missing_team: usize,
    pub unmapped_stage: usize,
    pub bad_kickoff: usize,
}

impl ParsedFixtures {
    pub fn rejected(&self) -> usize {
        self.missing_team + self.unmapped_stage + self.bad_kickoff
    }

    fn reject(&mut self, reason: Rejection) {
        match reason {
            Rejection::MissingTeam => self.missing_team += 1,
            Rejection::UnmappedStage => self.unmapped_stage += 1,
            Rejection::BadKickoff => self.bad_kickoff += 1,
        }
    }
}

/// Goal counts with shootout goals taken back out, plus the shootout winner:
/// 1/2 for the winning side, 0 without a shootout, `None` before kickoff.
pub fn extract_result(score: &ScorePayload) -> (Option<i32>, Option<i32>, Option<i16>) {
    let GoalsPayload { home, away } = score.full_time;
    let shootout = score
        .penalties
        .and_then(|p| Some((p.home?, p.away?)));

    match (shootout, home, away) {
        (Some((pen_home, pen_away)), Some(home), Some(away)) => {
            let winner = if pen_home > pen_away { 1 } else { 2 };
            (Some(home - pen_home), Some(away - pen_away), Some(winner))
        }
        (_, None, _) => (home, away, None),
        _ => (home, away, Some(0)),
    }
}

fn non_empty(name: &Option<String>) -> Option<&str> {
    name.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_kickoff(raw: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw?)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn normalize_fixture(
    payload: &MatchPayload,
    competition_id: i64,
) -> Result<FixtureDraft, Rejection> {
    let (Some(first_team), Some(second_team)) =
        (non_empty(&payload.home_team.name), non_empty(&payload.away_team.name))
    else {
        return Err(Rejection::MissingTeam);
    };
    let stage = normalize_stage(&stage_code(&payload.stage, payload.matchday))
        .ok_or(Rejection::UnmappedStage)?;
    let kickoff = parse_kickoff(payload.utc_date.as_deref()).ok_or(Rejection::BadKickoff)?;
    let (first_team_goals, second_team_goals, penalty_winner) = extract_result(&payload.score);

    Ok(FixtureDraft {
        first_team: first_team.to_string(),
        second_team: second_team.to_string(),
        competition_id,
        kickoff,
        first_team_goals,
        second_team_goals,
        penalty_winner,
        stage,
        status: MatchStatus::from_tag(&payload.status),
    })
}

pub fn parse_matches(payload: &MatchesPayload, competition: &Competition) -> ParsedFixtures {
    let mut parsed = ParsedFixtures::default();
    for entry in &payload.matches {
        match normalize_fixture(entry, competition.id) {
            Ok(draft) => parsed.drafts.push(draft),
            Err(reason) => {
                debug!(
                    ?reason,
                    home = ?entry.home_team.name,
                    away = ?entry.away_team.name,
                    stage = %entry.stage,
                    "fixture dropped"
                );
                parsed.reject(reason);
            }
        }
    }
    parsed
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Competitions from the listing whose code is whitelisted and whose current season is
/// well formed.
pub fn parse_competitions(
    payload: &CompetitionsPayload,
    codes: &[String],
    base_url: &str,
) -> Vec<Competition> {
    let mut out = Vec::new();
    for listing in &payload.competitions {
        let Some(code) = listing.code.as_deref() else {
            continue;
        };
        if !codes.iter().any(|c| c == code) {
            continue;
        }
        let Some(season) = &listing.current_season else {
            warn!(code, "whitelisted competition has no current season");
            continue;
        };
        let (Some(start), Some(end)) = (parse_date(&season.start_date), parse_date(&season.end_date))
        else {
            warn!(code, start = %season.start_date, end = %season.end_date, "unparseable season dates");
            continue;
        };
        let label = start.format("%Y").to_string();
        out.push(Competition::discovered(
            code,
            &label,
            matches_url(base_url, code),
            catalog_midnight(start),
            catalog_midnight(end),
        ));
    }
    out
}

pub fn matches_url(base_url: &str, code: &str) -> String {
    format!("{}/competitions/{code}/matches", base_url.trim_end_matches('/'))
}

/// True once the competition's last matchday lies more than a calendar day behind `now`.
/// The last matchday is the end date as read in the catalog offset, so a final played
/// late in the evening stays pollable through the following day.
pub fn is_stale(competition: &Competition, now: DateTime<Utc>) -> bool {
    let last_matchday = competition.end_date.with_timezone(&catalog_offset()).date_naive();
    now.date_naive() > last_matchday + chrono::Duration::days(FRESHNESS_WINDOW_DAYS)
}

#[async_trait]
pub trait FixtureSource: Send + Sync {
    /// Current-season metadata for the whitelisted competition codes.
    async fn discover_competitions(&self, codes: &[String]) -> Result<Vec<Competition>, FetchError>;

    /// Normalized fixtures of one competition. Empty for stale competitions.
    async fn fetch_fixtures(
        &self,
        competition: &Competition,
        now: DateTime<Utc>,
    ) -> Result<Vec<FixtureDraft>, FetchError>;
}

#[derive(Debug)]
pub struct FootballDataAdapter {
    http: HttpFetcher,
    base_url: String,
}

impl FootballDataAdapter {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl FixtureSource for FootballDataAdapter {
    async fn discover_competitions(&self, codes: &[String]) -> Result<Vec<Competition>, FetchError> {
        let url = format!("{}/competitions", self.base_url.trim_end_matches('/'));
        let payload: CompetitionsPayload = self.http.get_json(&url).await?;
        let found = parse_competitions(&payload, codes, &self.base_url);
        info!(listed = payload.competitions.len(), matched = found.len(), "competition listing fetched");
        Ok(found)
    }

    async fn fetch_fixtures(
        &self,
        competition: &Competition,
        now: DateTime<Utc>,
    ) -> Result<Vec<FixtureDraft>, FetchError> {
        if is_stale(competition, now) {
            info!(end_date = %competition.end_date, "last matchday is behind us, not polling");
            return Ok(Vec::new());
        }

        let payload: MatchesPayload = self.http.get_json(&competition.api_url).await?;
        if let Some(code) = payload.competition.as_ref().and_then(|c| c.code.as_deref()) {
            if code != competition.code {
                warn!(expected = %competition.code, got = code, "feed answered for another competition");
            }
        }
        debug!(
            season = ?payload.filters.season,
            first = ?payload.result_set.as_ref().and_then(|r| r.first.clone()),
            last = ?payload.result_set.as_ref().and_then(|r| r.last.clone()),
            "fixture payload received"
        );

        let parsed = parse_matches(&payload, competition);
        info!(
            kept = parsed.drafts.len(),
            missing_team = parsed.missing_team,
            unmapped_stage = parsed.unmapped_stage,
            bad_kickoff = parsed.bad_kickoff,
            "fixtures normalized"
        );
        Ok(parsed.drafts)
    }
}

pub fn load_matches_payload(path: impl AsRef<Path>) -> anyhow::Result<MatchesPayload> {
    read_json_file(path)
}

pub fn load_competitions_payload(path: impl AsRef<Path>) -> anyhow::Result<CompetitionsPayload> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
