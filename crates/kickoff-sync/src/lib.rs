//! Synchronization pass: competition discovery and pruning, per-competition fetch and
//! reconciliation against the catalog.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kickoff_adapters::{
    FixtureSource, FootballDataAdapter, HttpClientConfig, HttpFetcher, DEFAULT_API_BASE_URL,
};
use kickoff_core::{Competition, FixtureDraft, MatchRecord, ResultUpdate, StoredResult};
use kickoff_storage::{CatalogStore, PgCatalog};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kickoff-sync";

/// Active competitions stay fetchable this long past their end date.
pub const PRUNE_GRACE_DAYS: i64 = 2;

pub const DEFAULT_COMPETITION_CODES: [&str; 3] = ["WC", "CL", "EC"];

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

#[derive(Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub competition_codes: Vec<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub concurrency: usize,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        Self {
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
                host: lookup("PG_host").unwrap_or_else(|| "localhost".to_string()),
                port: parsed(&lookup, "PG_port").unwrap_or(6432),
                user: lookup("PG_user").unwrap_or_else(|| "postgres".to_string()),
                password: lookup("PG_password").unwrap_or_default(),
                name: lookup("PG_db").unwrap_or_else(|| "postgres".to_string()),
                max_connections: parsed(&lookup, "KICKOFF_DB_MAX_CONNECTIONS").unwrap_or(5),
            },
            api_key: lookup("API_KEY").filter(|v| !v.trim().is_empty()),
            api_base_url: lookup("KICKOFF_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            competition_codes: lookup("KICKOFF_COMPETITION_CODES")
                .map(|raw| parse_codes(&raw))
                .unwrap_or_else(|| DEFAULT_COMPETITION_CODES.map(String::from).to_vec()),
            http_timeout_secs: parsed(&lookup, "KICKOFF_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: lookup("KICKOFF_USER_AGENT")
                .unwrap_or_else(|| "kickoff-bot/0.1".to_string()),
            concurrency: parsed(&lookup, "KICKOFF_SYNC_CONCURRENCY").unwrap_or(1usize).max(1),
        }
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .context("API_KEY must be set to reach the upstream feed")
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let db = &self.database;
        match &db.url {
            Some(url) => url
                .parse::<PgConnectOptions>()
                .context("parsing DATABASE_URL"),
            None => Ok(PgConnectOptions::new()
                .host(&db.host)
                .port(db.port)
                .username(&db.user)
                .password(&db.password)
                .database(&db.name)),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let db = &self.database;
        f.debug_struct("SyncConfig")
            .field("database_url", &db.url.as_ref().map(|_| "<redacted>"))
            .field("database_host", &db.host)
            .field("database_port", &db.port)
            .field("database_user", &db.user)
            .field("database_name", &db.name)
            .field("db_max_connections", &db.max_connections)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("competition_codes", &self.competition_codes)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

fn parse_codes(raw: &str) -> Vec<String> {
    let mut codes = Vec::new();
    for code in raw.split(',').map(|c| c.trim().to_ascii_uppercase()) {
        if !code.is_empty() && !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub inserts: Vec<MatchRecord>,
    pub updates: Vec<ResultUpdate>,
    pub unchanged: usize,
}

/// Pairs each fixture with its identifier, keeping the first fixture per identifier.
pub fn keyed_fixtures(fixtures: Vec<FixtureDraft>) -> Vec<(i64, FixtureDraft)> {
    let mut seen = HashSet::with_capacity(fixtures.len());
    fixtures
        .into_iter()
        .filter_map(|fixture| {
            let id = fixture.match_id();
            seen.insert(id).then_some((id, fixture))
        })
        .collect()
}

/// Decides insert / result fill-in / no-op for every fixture.
///
/// A stored match only receives a result while both of its goal columns are null and the
/// fetched fixture is finished; once goals are stored they are authoritative.
pub fn plan_reconciliation(
    keyed: Vec<(i64, FixtureDraft)>,
    stored: &HashMap<i64, StoredResult>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for (id, fixture) in keyed {
        match stored.get(&id) {
            None => plan.inserts.push(fixture.into_record()),
            Some(existing)
                if existing.is_open() && fixture.status.is_concluded() && fixture.has_result() =>
            {
                plan.updates.push(ResultUpdate {
                    id,
                    first_team_goals: fixture.first_team_goals,
                    second_team_goals: fixture.second_team_goals,
                    penalty_winner: fixture.penalty_winner,
                });
            }
            Some(_) => plan.unchanged += 1,
        }
    }
    plan
}

/// Applies one competition's fetched batch inside a single transaction. Any error drops
/// the transaction uncommitted.
pub async fn reconcile(
    store: &dyn CatalogStore,
    competition_id: i64,
    fixtures: Vec<FixtureDraft>,
) -> Result<ReconcileOutcome> {
    let (own, foreign): (Vec<_>, Vec<_>) = fixtures
        .into_iter()
        .partition(|f| f.competition_id == competition_id);
    if !foreign.is_empty() {
        warn!(count = foreign.len(), "ignoring fixtures tagged with another competition");
    }

    let keyed = keyed_fixtures(own);
    if keyed.is_empty() {
        info!("nothing to reconcile");
        return Ok(ReconcileOutcome::default());
    }
    let ids: Vec<i64> = keyed.iter().map(|(id, _)| *id).collect();

    let mut tx = store.begin().await.context("opening match transaction")?;
    let stored = tx
        .stored_results(&ids)
        .await
        .context("loading stored match results")?;
    let plan = plan_reconciliation(keyed, &stored);

    let inserted = tx
        .insert_matches(&plan.inserts)
        .await
        .context("inserting new matches")?;
    let updated = tx
        .fill_results(&plan.updates)
        .await
        .context("filling match results")?;
    tx.commit().await.context("committing match transaction")?;

    info!(
        inserted,
        updated,
        unchanged = plan.unchanged,
        "competition reconciled"
    );
    Ok(ReconcileOutcome { inserted, updated })
}

#[derive(Debug, Clone, Serialize)]
pub struct CompetitionReport {
    pub competition_id: i64,
    pub name: String,
    pub fetched: usize,
    pub inserted: u64,
    pub updated: u64,
    pub error: Option<String>,
}

impl CompetitionReport {
    fn new(competition: &Competition) -> Self {
        Self {
            competition_id: competition.id,
            name: competition.name.clone(),
            fetched: 0,
            inserted: 0,
            updated: 0,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub pruned: u64,
    pub active_competitions: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub fetched_fixtures: usize,
    pub inserted: u64,
    pub updated: u64,
    pub competitions: Vec<CompetitionReport>,
}

fn competition_span(competition: &Competition) -> Span {
    info_span!(
        "competition",
        competition_id = competition.id,
        code = %competition.code,
        name = %competition.name
    )
}

/// One competition's unit of work. Failures end up in the report, never in the caller.
async fn sync_unit(
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn FixtureSource>,
    competition: Competition,
    now: DateTime<Utc>,
) -> CompetitionReport {
    let mut report = CompetitionReport::new(&competition);

    let fixtures = match source.fetch_fixtures(&competition, now).await {
        Ok(fixtures) => fixtures,
        Err(err) => {
            error!(error = %err, "upstream fetch failed");
            report.error = Some(format!("fetch: {err}"));
            return report;
        }
    };
    report.fetched = fixtures.len();

    match reconcile(store.as_ref(), competition.id, fixtures).await {
        Ok(outcome) => {
            report.inserted = outcome.inserted;
            report.updated = outcome.updated;
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "reconciliation rolled back");
            report.error = Some(format!("reconcile: {err:#}"));
        }
    }
    report
}

pub struct SyncPipeline {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn FixtureSource>,
    competition_codes: Vec<String>,
    concurrency: usize,
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn CatalogStore>, source: Arc<dyn FixtureSource>) -> Self {
        Self {
            store,
            source,
            competition_codes: DEFAULT_COMPETITION_CODES.map(String::from).to_vec(),
            concurrency: 1,
        }
    }

    pub fn with_competition_codes(mut self, codes: Vec<String>) -> Self {
        self.competition_codes = codes;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Postgres catalog plus the football-data adapter, wired from `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let api_key = config.require_api_key()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            api_key: Some(api_key.to_string()),
            global_concurrency: config.concurrency,
        })
        .context("building upstream http client")?;
        let source = FootballDataAdapter::new(http, config.api_base_url.clone());
        let store = connect_catalog(config).await?;

        Ok(Self::new(Arc::new(store), Arc::new(source))
            .with_competition_codes(config.competition_codes.clone())
            .with_concurrency(config.concurrency))
    }

    /// Inserts whitelisted competitions the catalog does not know yet, flagged active.
    /// Known competitions are left untouched, so a pruned one stays pruned.
    pub async fn discover_new(&self) -> Result<usize> {
        let listed = self
            .source
            .discover_competitions(&self.competition_codes)
            .await
            .context("fetching competition listing")?;

        let mut seen = HashSet::new();
        let listed: Vec<Competition> = listed.into_iter().filter(|c| seen.insert(c.id)).collect();
        if listed.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = listed.iter().map(|c| c.id).collect();
        let known = self
            .store
            .existing_competition_ids(&ids)
            .await
            .context("checking known competitions")?;
        let fresh: Vec<Competition> = listed
            .into_iter()
            .filter(|c| !known.contains(&c.id))
            .map(|mut c| {
                c.need_to_parse = true;
                c
            })
            .collect();
        if fresh.is_empty() {
            info!("no new competitions");
            return Ok(0);
        }

        let inserted = self
            .store
            .insert_competitions(&fresh)
            .await
            .context("inserting discovered competitions")?;
        for competition in &fresh {
            info!(
                competition_id = competition.id,
                name = %competition.name,
                "competition discovered"
            );
        }
        Ok(inserted as usize)
    }

    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        prune_ended(self.store.as_ref(), now).await
    }

    pub async fn sync_competition(
        &self,
        competition: &Competition,
        now: DateTime<Utc>,
    ) -> CompetitionReport {
        sync_unit(
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            competition.clone(),
            now,
        )
        .instrument(competition_span(competition))
        .await
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_once_at(Utc::now()).await
    }

    /// One pass as of `now`: discover, prune, then fetch and reconcile every active
    /// competition. Only a failure to list active competitions aborts the pass.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_pass(run_id, now).instrument(span).await
    }

    async fn run_pass(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();

        let discovered = match self.discover_new().await {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "competition discovery failed; continuing with known competitions");
                0
            }
        };
        let pruned = match self.prune_expired(now).await {
            Ok(count) => count,
            Err(err) => {
                error!(error = %format!("{err:#}"), "competition pruning failed");
                0
            }
        };

        let active = self
            .store
            .active_competitions()
            .await
            .context("loading active competitions")?;
        info!(active = active.len(), "starting competition sync");

        let reports = if self.concurrency <= 1 {
            let mut reports = Vec::with_capacity(active.len());
            for competition in &active {
                reports.push(self.sync_competition(competition, now).await);
            }
            reports
        } else {
            self.sync_concurrently(&active, now).await
        };

        let succeeded = reports.iter().filter(|r| r.succeeded()).count();
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            discovered,
            pruned,
            active_competitions: active.len(),
            succeeded,
            failed: active.len() - succeeded,
            fetched_fixtures: reports.iter().map(|r| r.fetched).sum(),
            inserted: reports.iter().map(|r| r.inserted).sum(),
            updated: reports.iter().map(|r| r.updated).sum(),
            competitions: reports,
        };
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            inserted = summary.inserted,
            updated = summary.updated,
            "sync pass finished"
        );
        Ok(summary)
    }

    async fn sync_concurrently(
        &self,
        active: &[Competition],
        now: DateTime<Utc>,
    ) -> Vec<CompetitionReport> {
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, competition) in active.iter().enumerate() {
            let store = Arc::clone(&self.store);
            let source = Arc::clone(&self.source);
            let limit = Arc::clone(&limit);
            let span = competition_span(competition);
            let competition = competition.clone();
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                    (index, sync_unit(store, source, competition, now).await)
                }
                .instrument(span),
            );
        }

        let mut reports = Vec::with_capacity(active.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                Err(err) => error!(error = %err, "competition task aborted"),
            }
        }
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

/// Retires every active competition whose end date is more than the grace window
/// behind `now`.
pub async fn prune_ended(store: &dyn CatalogStore, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = now - chrono::Duration::days(PRUNE_GRACE_DAYS);
    let pruned = store
        .deactivate_ended_before(cutoff)
        .await
        .context("retiring ended competitions")?;
    if pruned > 0 {
        info!(pruned, %cutoff, "competitions retired");
    }
    Ok(pruned)
}

pub async fn connect_catalog(config: &SyncConfig) -> Result<PgCatalog> {
    PgCatalog::connect(config.connect_options()?, config.database.max_connections)
        .await
        .context("connecting to catalog database")
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use kickoff_adapters::FetchError;
    use kickoff_core::{MatchStatus, Stage};
    use kickoff_storage::MemoryCatalog;
    use std::sync::Mutex;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 10, 12, 0, 0).single().unwrap()
    }

    fn competition(code: &str, season: &str, end: DateTime<Utc>) -> Competition {
        Competition::discovered(
            code,
            season,
            format!("https://feed.test/competitions/{code}/matches"),
            end - chrono::Duration::days(30),
            end,
        )
    }

    fn draft(
        competition: &Competition,
        home: &str,
        away: &str,
        goals: Option<(i32, i32)>,
        status: &str,
    ) -> FixtureDraft {
        FixtureDraft {
            first_team: home.to_string(),
            second_team: away.to_string(),
            competition_id: competition.id,
            kickoff: Utc.with_ymd_and_hms(2024, 7, 14, 19, 0, 0).single().unwrap(),
            first_team_goals: goals.map(|g| g.0),
            second_team_goals: goals.map(|g| g.1),
            penalty_winner: goals.map(|_| 0),
            stage: Stage::Final,
            status: MatchStatus::from_tag(status),
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        listing: Vec<Competition>,
        listing_fails: bool,
        fixtures: Mutex<HashMap<i64, Vec<FixtureDraft>>>,
        failing: HashSet<i64>,
        fetched: Mutex<Vec<i64>>,
    }

    impl ScriptedSource {
        fn serve(&self, competition_id: i64, fixtures: Vec<FixtureDraft>) {
            self.fixtures.lock().unwrap().insert(competition_id, fixtures);
        }

        fn fetched(&self) -> Vec<i64> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FixtureSource for ScriptedSource {
        async fn discover_competitions(
            &self,
            codes: &[String],
        ) -> Result<Vec<Competition>, FetchError> {
            if self.listing_fails {
                return Err(FetchError::HttpStatus {
                    status: 429,
                    url: "https://feed.test/competitions".to_string(),
                });
            }
            Ok(self
                .listing
                .iter()
                .filter(|c| codes.contains(&c.code))
                .cloned()
                .collect())
        }

        async fn fetch_fixtures(
            &self,
            competition: &Competition,
            _now: DateTime<Utc>,
        ) -> Result<Vec<FixtureDraft>, FetchError> {
            self.fetched.lock().unwrap().push(competition.id);
            if self.failing.contains(&competition.id) {
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: competition.api_url.clone(),
                });
            }
            Ok(self
                .fixtures
                .lock()
                .unwrap()
                .get(&competition.id)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn finished_fixture_is_inserted_with_its_result() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now());
        let fixture = draft(&euro, "Alpha", "Beta", Some((2, 1)), "FINISHED");
        let id = fixture.match_id();

        let outcome = reconcile(&store, euro.id, vec![fixture]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { inserted: 1, updated: 0 });

        let row = store.match_record(id).await.unwrap();
        assert_eq!(row.first_team_goals, Some(2));
        assert_eq!(row.second_team_goals, Some(1));
        assert_eq!(row.penalty_winner, Some(0));
        assert_eq!(row.stage, "final");
        assert_eq!(row.competition_id, euro.id);
    }

    #[tokio::test]
    async fn reconciling_an_unchanged_batch_twice_is_a_noop() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now());
        let batch = vec![
            draft(&euro, "Alpha", "Beta", Some((2, 1)), "FINISHED"),
            draft(&euro, "Gamma", "Delta", None, "TIMED"),
        ];

        let first = reconcile(&store, euro.id, batch.clone()).await.unwrap();
        assert_eq!(first.inserted, 2);
        let second = reconcile(&store, euro.id, batch).await.unwrap();
        assert_eq!(second, ReconcileOutcome::default());
        assert_eq!(store.matches().await.len(), 2);
    }

    #[tokio::test]
    async fn open_match_receives_result_once_finished() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now());
        let scheduled = draft(&euro, "Alpha", "Beta", None, "TIMED");
        let id = scheduled.match_id();
        reconcile(&store, euro.id, vec![scheduled]).await.unwrap();
        assert_eq!(store.match_record(id).await.unwrap().penalty_winner, None);

        let finished = draft(&euro, "Alpha", "Beta", Some((3, 0)), "FINISHED");
        let outcome = reconcile(&store, euro.id, vec![finished]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome { inserted: 0, updated: 1 });

        let row = store.match_record(id).await.unwrap();
        assert_eq!((row.first_team_goals, row.second_team_goals), (Some(3), Some(0)));
        assert_eq!(row.penalty_winner, Some(0));
    }

    #[tokio::test]
    async fn stored_goals_are_never_overwritten() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now());
        let original = draft(&euro, "Alpha", "Beta", Some((2, 1)), "FINISHED");
        let id = original.match_id();
        reconcile(&store, euro.id, vec![original]).await.unwrap();

        let corrected = draft(&euro, "Alpha", "Beta", Some((4, 4)), "FINISHED");
        let outcome = reconcile(&store, euro.id, vec![corrected]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());

        let row = store.match_record(id).await.unwrap();
        assert_eq!((row.first_team_goals, row.second_team_goals), (Some(2), Some(1)));
    }

    #[tokio::test]
    async fn in_progress_fixture_does_not_fill_results() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now());
        reconcile(&store, euro.id, vec![draft(&euro, "Alpha", "Beta", None, "TIMED")])
            .await
            .unwrap();

        let live = draft(&euro, "Alpha", "Beta", Some((1, 0)), "IN_PLAY");
        let outcome = reconcile(&store, euro.id, vec![live.clone()]).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(store.match_record(live.match_id()).await.unwrap().first_team_goals, None);
    }

    #[tokio::test]
    async fn duplicate_fixture_in_one_batch_is_inserted_once() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now());
        let fixture = draft(&euro, "Alpha", "Beta", None, "TIMED");
        let outcome = reconcile(&store, euro.id, vec![fixture.clone(), fixture])
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.commit_count().await, 1);
    }

    #[tokio::test]
    async fn empty_batch_does_not_open_a_transaction() {
        let store = MemoryCatalog::new();
        let outcome = reconcile(&store, 1, Vec::new()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::default());
        assert_eq!(store.commit_count().await, 0);
    }

    #[test]
    fn plan_partitions_inserts_updates_and_noops() {
        let euro = competition("EC", "2024", now());
        let fresh = draft(&euro, "A", "B", None, "TIMED");
        let to_fill = draft(&euro, "C", "D", Some((1, 1)), "FINISHED");
        let settled = draft(&euro, "E", "F", Some((0, 2)), "FINISHED");

        let stored = HashMap::from([
            (to_fill.match_id(), StoredResult::default()),
            (
                settled.match_id(),
                StoredResult {
                    first_team_goals: Some(0),
                    second_team_goals: Some(1),
                    penalty_winner: Some(0),
                },
            ),
        ]);
        let plan = plan_reconciliation(keyed_fixtures(vec![fresh, to_fill.clone(), settled]), &stored);

        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].id, to_fill.match_id());
        assert_eq!(plan.unchanged, 1);
    }

    #[tokio::test]
    async fn expired_competition_is_retired_before_fetching() {
        let store = MemoryCatalog::new();
        let ended = competition("WC", "2022", now() - chrono::Duration::days(3));
        let running = competition("EC", "2024", now() + chrono::Duration::days(4));
        store.put_competition(ended.clone()).await;
        store.put_competition(running.clone()).await;

        let source = Arc::new(ScriptedSource::default());
        let pipeline = SyncPipeline::new(Arc::new(store.clone()), source.clone());
        let summary = pipeline.run_once_at(now()).await.unwrap();

        assert_eq!(summary.pruned, 1);
        assert_eq!(summary.active_competitions, 1);
        assert_eq!(source.fetched(), vec![running.id]);
        assert!(!store.competition(ended.id).await.unwrap().need_to_parse);

        // Within the grace window the competition keeps being fetched.
        let recent = competition("CL", "2023", now() - chrono::Duration::days(1));
        store.put_competition(recent.clone()).await;
        pipeline.run_once_at(now()).await.unwrap();
        assert!(store.competition(recent.id).await.unwrap().need_to_parse);
    }

    #[tokio::test]
    async fn failing_competition_does_not_stop_the_pass() {
        let store = MemoryCatalog::new();
        let broken = competition("CL", "2024", now() + chrono::Duration::days(10));
        let healthy = competition("EC", "2024", now() + chrono::Duration::days(5));
        store.put_competition(broken.clone()).await;
        store.put_competition(healthy.clone()).await;

        let source = Arc::new(ScriptedSource {
            failing: HashSet::from([broken.id]),
            ..Default::default()
        });
        source.serve(healthy.id, vec![draft(&healthy, "Alpha", "Beta", Some((2, 1)), "FINISHED")]);

        let pipeline = SyncPipeline::new(Arc::new(store.clone()), source.clone());
        let summary = pipeline.run_once_at(now()).await.unwrap();

        assert_eq!(summary.active_competitions, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.inserted, 1);
        let broken_report = summary
            .competitions
            .iter()
            .find(|r| r.competition_id == broken.id)
            .unwrap();
        assert!(broken_report.error.as_deref().unwrap().contains("503"));
        assert_eq!(store.matches().await.len(), 1);
    }

    #[tokio::test]
    async fn discovery_adds_only_unknown_competitions() {
        let store = MemoryCatalog::new();
        let mut retired = competition("WC", "2022", now() - chrono::Duration::days(200));
        retired.need_to_parse = false;
        store.put_competition(retired.clone()).await;

        let euro = competition("EC", "2024", now() + chrono::Duration::days(4));
        let premier = competition("PL", "2024", now() + chrono::Duration::days(300));
        let source = Arc::new(ScriptedSource {
            listing: vec![retired.clone(), euro.clone(), premier.clone()],
            ..Default::default()
        });
        let pipeline = SyncPipeline::new(Arc::new(store.clone()), source);

        assert_eq!(pipeline.discover_new().await.unwrap(), 1);
        assert!(store.competition(euro.id).await.unwrap().need_to_parse);
        assert!(store.competition(premier.id).await.is_none());
        assert!(!store.competition(retired.id).await.unwrap().need_to_parse);
        assert_eq!(pipeline.discover_new().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_discovery_still_syncs_known_competitions() {
        let store = MemoryCatalog::new();
        let euro = competition("EC", "2024", now() + chrono::Duration::days(4));
        store.put_competition(euro.clone()).await;

        let source = Arc::new(ScriptedSource {
            listing_fails: true,
            ..Default::default()
        });
        source.serve(euro.id, vec![draft(&euro, "Alpha", "Beta", None, "TIMED")]);

        let pipeline = SyncPipeline::new(Arc::new(store.clone()), source);
        let summary = pipeline.run_once_at(now()).await.unwrap();
        assert_eq!(summary.discovered, 0);
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn concurrent_pass_matches_sequential_outcome() {
        let store = MemoryCatalog::new();
        let source = Arc::new(ScriptedSource::default());
        let mut ids = Vec::new();
        for (i, code) in ["WC", "CL", "EC", "BSA"].iter().enumerate() {
            let c = competition(code, "2024", now() + chrono::Duration::days(i as i64 + 1));
            source.serve(
                c.id,
                vec![
                    draft(&c, "Alpha", "Beta", Some((1, 0)), "FINISHED"),
                    draft(&c, "Gamma", "Delta", None, "SCHEDULED"),
                ],
            );
            ids.push(c.id);
            store.put_competition(c).await;
        }

        let pipeline = SyncPipeline::new(Arc::new(store.clone()), source).with_concurrency(3);
        let summary = pipeline.run_once_at(now()).await.unwrap();
        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.inserted, 8);
        let reported: Vec<i64> = summary.competitions.iter().map(|r| r.competition_id).collect();
        let active: Vec<i64> = store
            .active_competitions()
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(reported, active);

        let again = pipeline.run_once_at(now()).await.unwrap();
        assert_eq!((again.inserted, again.updated), (0, 0));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PG_host", "db.internal"),
            ("PG_user", "bets"),
            ("PG_password", "p@ss:word"),
            ("PG_db", "bets"),
            ("API_KEY", "token-123"),
            ("KICKOFF_COMPETITION_CODES", " wc, ec ,,WC"),
            ("KICKOFF_SYNC_CONCURRENCY", "0"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 6432);
        assert!(config.database.url.is_none());
        assert_eq!(config.competition_codes, vec!["WC".to_string(), "EC".to_string()]);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.require_api_key().unwrap(), "token-123");
        assert!(config.connect_options().is_ok());

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("token-123"));
        assert!(!rendered.contains("p@ss:word"));
    }

    #[tokio::test]
    async fn env_pass_refuses_to_start_without_api_key() {
        std::env::remove_var("API_KEY");
        let err = run_sync_once_from_env().await.unwrap_err();
        assert!(format!("{err:#}").contains("API_KEY"));
    }

    #[test]
    fn missing_api_key_is_reported() {
        let config = SyncConfig::from_lookup(|_| None);
        assert!(config.require_api_key().is_err());
        assert_eq!(
            config.competition_codes,
            vec!["WC".to_string(), "CL".to_string(), "EC".to_string()]
        );
    }
}
