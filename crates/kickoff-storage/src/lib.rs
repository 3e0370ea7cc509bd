//! Relational catalog store for competitions and matches.
//!
//! Every match write happens inside a [`MatchTx`] scoped to one competition. Dropping a
//! transaction without calling [`MatchTx::commit`] discards it, so the underlying
//! connection goes back to the pool on every exit path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kickoff_core::{Competition, MatchRecord, ResultUpdate, StoredResult};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "kickoff-storage";

/// Rows per multi-values INSERT; keeps each statement well under the bind limit.
const INSERT_CHUNK: usize = 500;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Subset of `ids` already present in `competitions`.
    async fn existing_competition_ids(&self, ids: &[i64]) -> Result<HashSet<i64>>;

    /// Inserts new competitions; rows whose id already exists are skipped.
    async fn insert_competitions(&self, competitions: &[Competition]) -> Result<u64>;

    /// Clears `need_to_parse` on every active competition that ended before `cutoff`.
    async fn deactivate_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn active_competitions(&self) -> Result<Vec<Competition>>;

    async fn begin(&self) -> Result<Box<dyn MatchTx>>;
}

#[async_trait]
pub trait MatchTx: Send {
    /// Stored result columns for those of `ids` that already exist.
    async fn stored_results(&mut self, ids: &[i64]) -> Result<HashMap<i64, StoredResult>>;

    /// Inserts rows, skipping ids that are already present. Returns rows written.
    async fn insert_matches(&mut self, rows: &[MatchRecord]) -> Result<u64>;

    /// Writes results onto rows whose goal columns are both still null. Returns rows written.
    async fn fill_results(&mut self, updates: &[ResultUpdate]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(options: PgConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn competition_from_row(row: &PgRow) -> Result<Competition> {
    Ok(Competition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        season: row.try_get("year")?,
        api_url: row.try_get("api_url")?,
        code: row.try_get("competition_code")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        need_to_parse: row.try_get("need_to_parse")?,
    })
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn existing_competition_ids(&self, ids: &[i64]) -> Result<HashSet<i64>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM competitions
             WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("id").map_err(StoreError::from))
            .collect()
    }

    async fn insert_competitions(&self, competitions: &[Competition]) -> Result<u64> {
        if competitions.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO competitions \
             (id, name, year, need_to_parse, api_url, competition_code, start_date, end_date) ",
        );
        qb.push_values(competitions, |mut b, c| {
            b.push_bind(c.id)
                .push_bind(c.name.as_str())
                .push_bind(c.season.as_str())
                .push_bind(c.need_to_parse)
                .push_bind(c.api_url.as_str())
                .push_bind(c.code.as_str())
                .push_bind(c.start_date)
                .push_bind(c.end_date);
        });
        qb.push(" ON CONFLICT (id) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE competitions
               SET need_to_parse = FALSE
             WHERE need_to_parse
               AND end_date < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn active_competitions(&self) -> Result<Vec<Competition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, year, need_to_parse, api_url, competition_code, start_date, end_date
              FROM competitions
             WHERE need_to_parse
             ORDER BY start_date, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(competition_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn MatchTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgMatchTx { tx }))
    }
}

pub struct PgMatchTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MatchTx for PgMatchTx {
    async fn stored_results(&mut self, ids: &[i64]) -> Result<HashMap<i64, StoredResult>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, first_team_goals, second_team_goals, penalty_winner
              FROM matches
             WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(
                row.try_get("id")?,
                StoredResult {
                    first_team_goals: row.try_get("first_team_goals")?,
                    second_team_goals: row.try_get("second_team_goals")?,
                    penalty_winner: row.try_get("penalty_winner")?,
                },
            );
        }
        Ok(out)
    }

    async fn insert_matches(&mut self, rows: &[MatchRecord]) -> Result<u64> {
        let mut written = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO matches \
                 (id, first_team, second_team, competition_id, dt, \
                  first_team_goals, second_team_goals, penalty_winner, stage) ",
            );
            qb.push_values(chunk, |mut b, m| {
                b.push_bind(m.id)
                    .push_bind(m.first_team.as_str())
                    .push_bind(m.second_team.as_str())
                    .push_bind(m.competition_id)
                    .push_bind(m.kickoff)
                    .push_bind(m.first_team_goals)
                    .push_bind(m.second_team_goals)
                    .push_bind(m.penalty_winner)
                    .push_bind(m.stage.as_str());
            });
            // A concurrent pass may have inserted the same fixture first.
            qb.push(" ON CONFLICT (id) DO NOTHING");
            let result = qb.build().execute(&mut *self.tx).await?;
            let affected = result.rows_affected();
            if affected < chunk.len() as u64 {
                debug!(
                    skipped = chunk.len() as u64 - affected,
                    "match rows already present"
                );
            }
            written += affected;
        }
        Ok(written)
    }

    async fn fill_results(&mut self, updates: &[ResultUpdate]) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = updates.iter().map(|u| u.id).collect();
        let first: Vec<Option<i32>> = updates.iter().map(|u| u.first_team_goals).collect();
        let second: Vec<Option<i32>> = updates.iter().map(|u| u.second_team_goals).collect();
        let penalties: Vec<Option<i16>> = updates.iter().map(|u| u.penalty_winner).collect();

        let result = sqlx::query(
            r#"
            UPDATE matches AS m
               SET first_team_goals = u.first_team_goals,
                   second_team_goals = u.second_team_goals,
                   penalty_winner = u.penalty_winner
              FROM UNNEST($1::int8[], $2::int4[], $3::int4[], $4::int2[])
                   AS u(id, first_team_goals, second_team_goals, penalty_winner)
             WHERE m.id = u.id
               AND m.first_team_goals IS NULL
               AND m.second_team_goals IS NULL
            "#,
        )
        .bind(ids)
        .bind(first)
        .bind(second)
        .bind(penalties)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    competitions: BTreeMap<i64, Competition>,
    matches: BTreeMap<i64, MatchRecord>,
    commits: usize,
}

/// Process-local catalog with the same write semantics as [`PgCatalog`].
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_competition(&self, competition: Competition) {
        let mut state = self.state.lock().await;
        state.competitions.insert(competition.id, competition);
    }

    pub async fn put_match(&self, record: MatchRecord) {
        let mut state = self.state.lock().await;
        state.matches.insert(record.id, record);
    }

    pub async fn competition(&self, id: i64) -> Option<Competition> {
        self.state.lock().await.competitions.get(&id).cloned()
    }

    pub async fn competitions(&self) -> Vec<Competition> {
        self.state.lock().await.competitions.values().cloned().collect()
    }

    pub async fn match_record(&self, id: i64) -> Option<MatchRecord> {
        self.state.lock().await.matches.get(&id).cloned()
    }

    pub async fn matches(&self) -> Vec<MatchRecord> {
        self.state.lock().await.matches.values().cloned().collect()
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn existing_competition_ids(&self, ids: &[i64]) -> Result<HashSet<i64>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.competitions.contains_key(id))
            .collect())
    }

    async fn insert_competitions(&self, competitions: &[Competition]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut written = 0;
        for competition in competitions {
            if !state.competitions.contains_key(&competition.id) {
                state.competitions.insert(competition.id, competition.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn deactivate_ended_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut flipped = 0;
        for competition in state.competitions.values_mut() {
            if competition.need_to_parse && competition.end_date < cutoff {
                competition.need_to_parse = false;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn active_competitions(&self) -> Result<Vec<Competition>> {
        let state = self.state.lock().await;
        let mut active: Vec<_> = state
            .competitions
            .values()
            .filter(|c| c.need_to_parse)
            .cloned()
            .collect();
        active.sort_by_key(|c| (c.start_date, c.id));
        Ok(active)
    }

    async fn begin(&self) -> Result<Box<dyn MatchTx>> {
        Ok(Box::new(MemoryMatchTx {
            state: Arc::clone(&self.state),
            inserts: Vec::new(),
            updates: Vec::new(),
        }))
    }
}

/// Staged writes; applied to the shared state only on commit.
pub struct MemoryMatchTx {
    state: Arc<Mutex<MemoryState>>,
    inserts: Vec<MatchRecord>,
    updates: Vec<ResultUpdate>,
}

#[async_trait]
impl MatchTx for MemoryMatchTx {
    async fn stored_results(&mut self, ids: &[i64]) -> Result<HashMap<i64, StoredResult>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state.matches.get(id).map(|m| {
                    (
                        *id,
                        StoredResult {
                            first_team_goals: m.first_team_goals,
                            second_team_goals: m.second_team_goals,
                            penalty_winner: m.penalty_winner,
                        },
                    )
                })
            })
            .collect())
    }

    async fn insert_matches(&mut self, rows: &[MatchRecord]) -> Result<u64> {
        let state = self.state.lock().await;
        let mut written = 0;
        for row in rows {
            let staged = self.inserts.iter().any(|m| m.id == row.id);
            if !staged && !state.matches.contains_key(&row.id) {
                self.inserts.push(row.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn fill_results(&mut self, updates: &[ResultUpdate]) -> Result<u64> {
        let state = self.state.lock().await;
        let mut written = 0;
        for update in updates {
            let open = state
                .matches
                .get(&update.id)
                .map(|m| m.first_team_goals.is_none() && m.second_team_goals.is_none())
                .unwrap_or(false);
            if open {
                self.updates.push(*update);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in self.inserts {
            state.matches.entry(row.id).or_insert(row);
        }
        for update in self.updates {
            if let Some(m) = state.matches.get_mut(&update.id) {
                if m.first_team_goals.is_none() && m.second_team_goals.is_none() {
                    m.first_team_goals = update.first_team_goals;
                    m.second_team_goals = update.second_team_goals;
                    m.penalty_winner = update.penalty_winner;
                }
            }
        }
        state.commits += 1;
        Ok(())
    }
}
