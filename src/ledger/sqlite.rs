//! SQLite-backed ledger.
//!
//! One `BEGIN IMMEDIATE` transaction per [`Ledger::transaction`] call, so
//! concurrent writers serialize on the database lock and the
//! insert-if-absent-then-increment sequences below are atomic. Uniqueness is
//! enforced by the schema (`ON CONFLICT DO NOTHING`), never by a read-then-write
//! check in Rust.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{
    ArmStatistic, Interaction, InteractionKind, InteractionOutcome, Ledger, LedgerTx,
    RankLogEntry, RankLogQuery, RankingCycle,
};
use crate::candidates::CandidateFilter;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::rank::ArmCounts;
use crate::{ActorId, ArmId, CycleId, OfficeId};

const SCHEMA_VERSION: i64 = 1;

/// Max bound parameters per `IN (...)` query, well under SQLite's limit.
const IN_CHUNK: usize = 500;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS ranking_cycles (
  cycle_id INTEGER PRIMARY KEY AUTOINCREMENT,
  office_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  arm_id INTEGER NOT NULL,
  page_offset INTEGER NOT NULL CHECK (page_offset >= 0),
  filters_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ranking_cycles_actor_arm
  ON ranking_cycles(actor_id, arm_id, created_at, cycle_id);

CREATE TABLE IF NOT EXISTS arm_statistics (
  stat_id INTEGER PRIMARY KEY AUTOINCREMENT,
  cycle_id INTEGER NOT NULL,
  office_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  arm_id INTEGER NOT NULL,
  pulls INTEGER NOT NULL DEFAULT 0 CHECK (pulls >= 0),
  successes INTEGER NOT NULL DEFAULT 0 CHECK (successes >= 0),
  bookmarks INTEGER NOT NULL DEFAULT 0 CHECK (bookmarks >= 0),
  adds INTEGER NOT NULL DEFAULT 0 CHECK (adds >= 0),
  last_interaction TEXT,
  UNIQUE (office_id, actor_id, arm_id, cycle_id),
  FOREIGN KEY (cycle_id) REFERENCES ranking_cycles(cycle_id)
);

CREATE INDEX IF NOT EXISTS idx_arm_statistics_actor_arm
  ON arm_statistics(actor_id, arm_id);

CREATE TABLE IF NOT EXISTS impressions (
  impression_id INTEGER PRIMARY KEY AUTOINCREMENT,
  actor_id TEXT NOT NULL,
  arm_id INTEGER NOT NULL,
  session_id TEXT NOT NULL,
  cycle_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (actor_id, arm_id, session_id, cycle_id),
  FOREIGN KEY (cycle_id) REFERENCES ranking_cycles(cycle_id)
);

CREATE TABLE IF NOT EXISTS interactions (
  interaction_id INTEGER PRIMARY KEY AUTOINCREMENT,
  cycle_id INTEGER NOT NULL,
  office_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  arm_id INTEGER NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('click', 'bookmark', 'add')),
  created_at TEXT NOT NULL,
  FOREIGN KEY (cycle_id) REFERENCES ranking_cycles(cycle_id)
);

CREATE INDEX IF NOT EXISTS idx_interactions_cycle_kind
  ON interactions(cycle_id, actor_id, arm_id, kind);

CREATE INDEX IF NOT EXISTS idx_interactions_office
  ON interactions(office_id, interaction_id);

CREATE TRIGGER IF NOT EXISTS trg_interactions_no_update
BEFORE UPDATE ON interactions
BEGIN
  SELECT RAISE(FAIL, 'interactions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_interactions_no_delete
BEFORE DELETE ON interactions
BEGIN
  SELECT RAISE(FAIL, 'interactions is append-only');
END;

CREATE TABLE IF NOT EXISTS rank_logs (
  log_id INTEGER PRIMARY KEY AUTOINCREMENT,
  office_id TEXT NOT NULL,
  actor_id TEXT NOT NULL,
  session_id TEXT NOT NULL,
  arm_id INTEGER NOT NULL,
  rank_position INTEGER NOT NULL CHECK (rank_position >= 1),
  pulls INTEGER NOT NULL,
  successes INTEGER NOT NULL,
  ucb REAL NOT NULL,
  t REAL NOT NULL,
  c REAL NOT NULL,
  topics_json TEXT NOT NULL DEFAULT '[]',
  date_min TEXT,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rank_logs_created
  ON rank_logs(created_at, office_id, actor_id);
"#;

/// Ledger stored in a SQLite database.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open (creating if needed) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            Error::Persistence(format!("failed to open {}: {e}", path.display()))
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(conn)
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wrap an existing connection and apply the schema.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;
    conn.execute_batch(SCHEMA_V1)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![SCHEMA_VERSION, format_ts(Utc::now())],
    )?;
    if inserted == 1 {
        debug!(version = SCHEMA_VERSION, "applied ledger schema");
    }
    Ok(())
}

impl Ledger for SqliteLedger {
    fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut handle = SqliteTx { tx };
        // Dropping an uncommitted `rusqlite::Transaction` rolls it back.
        let out = f(&mut handle)?;
        handle.tx.commit()?;
        Ok(out)
    }
}

struct SqliteTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

// Timestamps are fixed-width RFC 3339 in UTC, so text order is time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_sql_int<T: TryInto<i64>>(value: T, what: &str) -> Result<i64> {
    value
        .try_into()
        .map_err(|_| Error::Persistence(format!("{what} does not fit in a SQLite integer")))
}

fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<RankingCycle> {
    let filters_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(RankingCycle {
        id: CycleId(row.get(0)?),
        office: row.get::<_, String>(1)?.into(),
        actor: row.get::<_, String>(2)?.into(),
        session: row.get::<_, String>(3)?.into(),
        arm: ArmId(row.get(4)?),
        page_offset: row.get::<_, i64>(5)?.max(0) as usize,
        filters: parse_json(6, &filters_json)?,
        created_at: parse_ts(7, &created_at)?,
    })
}

fn statistic_from_row(row: &Row<'_>) -> rusqlite::Result<ArmStatistic> {
    let last: Option<String> = row.get(8)?;
    Ok(ArmStatistic {
        cycle: CycleId(row.get(0)?),
        office: row.get::<_, String>(1)?.into(),
        actor: row.get::<_, String>(2)?.into(),
        arm: ArmId(row.get(3)?),
        pulls: count_col(row, 4)?,
        successes: count_col(row, 5)?,
        bookmarks: count_col(row, 6)?,
        adds: count_col(row, 7)?,
        last_interaction: last.as_deref().map(|s| parse_ts(8, s)).transpose()?,
    })
}

fn interaction_from_row(row: &Row<'_>) -> rusqlite::Result<Interaction> {
    let kind: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(Interaction {
        cycle: CycleId(row.get(0)?),
        office: row.get::<_, String>(1)?.into(),
        actor: row.get::<_, String>(2)?.into(),
        session: row.get::<_, String>(3)?.into(),
        arm: ArmId(row.get(4)?),
        kind: kind
            .parse::<InteractionKind>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        created_at: parse_ts(6, &created_at)?,
    })
}

fn rank_log_from_row(row: &Row<'_>) -> rusqlite::Result<RankLogEntry> {
    let topics_json: String = row.get(10)?;
    let date_min: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    Ok(RankLogEntry {
        office: row.get::<_, String>(0)?.into(),
        actor: row.get::<_, String>(1)?.into(),
        session: row.get::<_, String>(2)?.into(),
        arm: ArmId(row.get(3)?),
        rank: row.get::<_, i64>(4)?.max(1) as usize,
        pulls: count_col(row, 5)?,
        successes: count_col(row, 6)?,
        ucb: row.get(7)?,
        t: row.get(8)?,
        c: row.get(9)?,
        topics: parse_json(10, &topics_json)?,
        date_min: date_min.as_deref().map(|s| parse_date(11, s)).transpose()?,
        created_at: parse_ts(12, &created_at)?,
    })
}

impl SqliteTx<'_> {
    fn insert_statistic_row(&self, cycle: CycleId, who: &Identity, arm: ArmId) -> Result<()> {
        self.tx.execute(
            "INSERT INTO arm_statistics(cycle_id, office_id, actor_id, arm_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(office_id, actor_id, arm_id, cycle_id) DO NOTHING",
            params![cycle.0, who.office.as_str(), who.actor.as_str(), arm.0],
        )?;
        Ok(())
    }

    fn latest_cycle(&self, actor: &ActorId, arm: ArmId) -> Result<Option<CycleId>> {
        let id = self
            .tx
            .query_row(
                "SELECT cycle_id FROM ranking_cycles
                 WHERE actor_id = ?1 AND arm_id = ?2
                 ORDER BY created_at DESC, cycle_id DESC
                 LIMIT 1",
                params![actor.as_str(), arm.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.map(CycleId))
    }
}

impl LedgerTx for SqliteTx<'_> {
    fn load_aggregate_counts(
        &mut self,
        actor: &ActorId,
        arms: &[ArmId],
    ) -> Result<BTreeMap<ArmId, ArmCounts>> {
        let mut out = BTreeMap::new();
        for chunk in arms.chunks(IN_CHUNK) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT arm_id, COALESCE(SUM(pulls), 0), COALESCE(SUM(successes), 0)
                 FROM arm_statistics
                 WHERE actor_id = ?1 AND arm_id IN ({placeholders})
                 GROUP BY arm_id"
            );
            let mut bind: Vec<Value> = Vec::with_capacity(chunk.len() + 1);
            bind.push(Value::Text(actor.as_str().to_string()));
            bind.extend(chunk.iter().map(|a| Value::Integer(a.0)));

            let mut stmt = self.tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(bind), |row| {
                Ok((
                    ArmId(row.get(0)?),
                    ArmCounts::new(count_col(row, 1)?, count_col(row, 2)?),
                ))
            })?;
            for row in rows {
                let (arm, counts) = row?;
                out.insert(arm, counts);
            }
        }
        Ok(out)
    }

    fn open_cycle(
        &mut self,
        who: &Identity,
        arm: ArmId,
        page_offset: usize,
        filters: &CandidateFilter,
    ) -> Result<CycleId> {
        let filters_json = serde_json::to_string(filters)?;
        let id: i64 = self.tx.query_row(
            "INSERT INTO ranking_cycles(
                office_id, actor_id, session_id, arm_id, page_offset, filters_json, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             RETURNING cycle_id",
            params![
                who.office.as_str(),
                who.actor.as_str(),
                who.session.as_str(),
                arm.0,
                to_sql_int(page_offset, "page offset")?,
                filters_json,
                format_ts(Utc::now()),
            ],
            |row| row.get(0),
        )?;
        Ok(CycleId(id))
    }

    fn ensure_statistic_row(&mut self, cycle: CycleId, who: &Identity, arm: ArmId) -> Result<()> {
        self.insert_statistic_row(cycle, who, arm)
    }

    fn record_impression(&mut self, who: &Identity, arm: ArmId, cycle: CycleId) -> Result<bool> {
        self.insert_statistic_row(cycle, who, arm)?;
        let inserted = self.tx.execute(
            "INSERT INTO impressions(actor_id, arm_id, session_id, cycle_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(actor_id, arm_id, session_id, cycle_id) DO NOTHING",
            params![
                who.actor.as_str(),
                arm.0,
                who.session.as_str(),
                cycle.0,
                format_ts(Utc::now()),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        self.tx.execute(
            "UPDATE arm_statistics SET pulls = pulls + 1
             WHERE cycle_id = ?1 AND office_id = ?2 AND actor_id = ?3 AND arm_id = ?4",
            params![cycle.0, who.office.as_str(), who.actor.as_str(), arm.0],
        )?;
        Ok(true)
    }

    fn record_interaction(
        &mut self,
        who: &Identity,
        arm: ArmId,
        kind: InteractionKind,
        click_increment: u64,
    ) -> Result<InteractionOutcome> {
        let cycle = self
            .latest_cycle(&who.actor, arm)?
            .ok_or_else(|| Error::NoActiveCycle {
                actor: who.actor.clone(),
                arm,
            })?;

        if kind == InteractionKind::Click {
            let already: bool = self.tx.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM interactions
                    WHERE cycle_id = ?1 AND actor_id = ?2 AND arm_id = ?3 AND kind = 'click'
                 )",
                params![cycle.0, who.actor.as_str(), arm.0],
                |row| row.get(0),
            )?;
            if already {
                return Ok(InteractionOutcome::DuplicateClickIgnored { cycle });
            }
        }

        let now = format_ts(Utc::now());
        self.tx.execute(
            "INSERT INTO interactions(
                cycle_id, office_id, actor_id, session_id, arm_id, kind, created_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                cycle.0,
                who.office.as_str(),
                who.actor.as_str(),
                who.session.as_str(),
                arm.0,
                kind.as_str(),
                now,
            ],
        )?;
        self.insert_statistic_row(cycle, who, arm)?;

        let (column, amount) = match kind {
            InteractionKind::Click => {
                ("successes", to_sql_int(click_increment, "click increment")?)
            }
            InteractionKind::Bookmark => ("bookmarks", 1),
            InteractionKind::Add => ("adds", 1),
        };
        let sql = format!(
            "UPDATE arm_statistics SET {column} = {column} + ?1, last_interaction = ?2
             WHERE cycle_id = ?3 AND office_id = ?4 AND actor_id = ?5 AND arm_id = ?6"
        );
        self.tx.execute(
            &sql,
            params![
                amount,
                now,
                cycle.0,
                who.office.as_str(),
                who.actor.as_str(),
                arm.0
            ],
        )?;
        Ok(InteractionOutcome::Recorded { cycle, kind })
    }

    fn append_rank_log(&mut self, entries: &[RankLogEntry]) -> Result<()> {
        let mut stmt = self.tx.prepare(
            "INSERT INTO rank_logs(
                office_id, actor_id, session_id, arm_id, rank_position,
                pulls, successes, ucb, t, c,
                topics_json, date_min, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for e in entries {
            stmt.execute(params![
                e.office.as_str(),
                e.actor.as_str(),
                e.session.as_str(),
                e.arm.0,
                to_sql_int(e.rank, "rank")?,
                to_sql_int(e.pulls, "pulls")?,
                to_sql_int(e.successes, "successes")?,
                e.ucb,
                e.t,
                e.c,
                serde_json::to_string(&e.topics)?,
                e.date_min.map(|d| d.format("%Y-%m-%d").to_string()),
                format_ts(e.created_at),
            ])?;
        }
        Ok(())
    }

    fn cycles_for_actor(&mut self, actor: &ActorId) -> Result<Vec<RankingCycle>> {
        let mut stmt = self.tx.prepare(
            "SELECT cycle_id, office_id, actor_id, session_id, arm_id, page_offset,
                    filters_json, created_at
             FROM ranking_cycles
             WHERE actor_id = ?1
             ORDER BY created_at DESC, cycle_id DESC",
        )?;
        let rows = stmt.query_map(params![actor.as_str()], cycle_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn statistics_for_actor(&mut self, actor: &ActorId) -> Result<Vec<ArmStatistic>> {
        let mut stmt = self.tx.prepare(
            "SELECT cycle_id, office_id, actor_id, arm_id, pulls, successes, bookmarks, adds,
                    last_interaction
             FROM arm_statistics
             WHERE actor_id = ?1
             ORDER BY cycle_id ASC, office_id ASC",
        )?;
        let rows = stmt.query_map(params![actor.as_str()], statistic_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn rank_logs(&mut self, query: &RankLogQuery) -> Result<Vec<RankLogEntry>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut bind: Vec<Value> = Vec::new();
        let mut push = |clause: &str, value: Value| {
            bind.push(value);
            clauses.push(format!("{clause} ?{}", bind.len()));
        };
        if let Some(office) = &query.office {
            push("office_id =", Value::Text(office.as_str().to_string()));
        }
        if let Some(actor) = &query.actor {
            push("actor_id =", Value::Text(actor.as_str().to_string()));
        }
        if let Some(session) = &query.session {
            push("session_id =", Value::Text(session.as_str().to_string()));
        }
        if let Some(from) = query.from {
            push("created_at >=", Value::Text(format_ts(from)));
        }
        if let Some(to) = query.to {
            push("created_at <=", Value::Text(format_ts(to)));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT office_id, actor_id, session_id, arm_id, rank_position,
                    pulls, successes, ucb, t, c, topics_json, date_min, created_at
             FROM rank_logs
             {where_sql}
             ORDER BY created_at ASC, rank_position ASC"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), rank_log_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn interactions_for_cycle(&mut self, cycle: CycleId) -> Result<Vec<Interaction>> {
        let mut stmt = self.tx.prepare(
            "SELECT cycle_id, office_id, actor_id, session_id, arm_id, kind, created_at
             FROM interactions
             WHERE cycle_id = ?1
             ORDER BY interaction_id ASC",
        )?;
        let rows = stmt.query_map(params![cycle.0], interaction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn interactions_for_office(&mut self, office: &OfficeId) -> Result<Vec<Interaction>> {
        let mut stmt = self.tx.prepare(
            "SELECT cycle_id, office_id, actor_id, session_id, arm_id, kind, created_at
             FROM interactions
             WHERE office_id = ?1
             ORDER BY interaction_id DESC",
        )?;
        let rows = stmt.query_map(params![office.as_str()], interaction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
