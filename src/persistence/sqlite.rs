//! SQLite result store using `rusqlite`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row};

use super::{
    DistinctField, FieldValue, MetricField, ResultRow, ResultStore, RowId, RunFilter, ThresholdPair, ValueRange,
};
use crate::utils::ensure_dir;
use crate::{Error, Result};

const RUN_COLUMNS: &str = "id, run_id, fingerprint, asset, strategy, timeframe, leverage, \
     short_threshold, long_threshold, max_position_ratio, sharpe_ratio, max_drawdown, win_rate, \
     time_in_market, num_trades, fees, funding, total_return, execution_time_ms, executed_at";

/// Read-only connections kept open between queries. Busier moments open more.
const IDLE_READERS: usize = 4;

/// Thread-safe SQLite wrapper shared across async tasks.
///
/// Writes serialize on one connection. A file-backed store reads through its
/// own read-only connections, so WAL readers never queue behind each other or
/// behind the writer.
#[derive(Clone)]
pub struct SqliteResultStore {
    writer: Arc<Mutex<Connection>>, // driven through spawn_blocking
    readers: Option<Arc<ReaderPool>>,
}

struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().map_err(|_| poisoned())?.pop() {
            return Ok(conn);
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Ok(Connection::open_with_flags(&self.path, flags)?)
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < IDLE_READERS {
                idle.push(conn);
            }
        }
    }
}

fn poisoned() -> Error {
    Error::Query("result store connection lock poisoned".into())
}

impl SqliteResultStore {
    /// Open (or create) the database file, under the user data dir by default.
    pub async fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            | Some(p) => p,
            | None => default_db_path(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir(parent)?;
        }
        info!("Opening result store at {}", path.display());
        let writer_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || Connection::open(writer_path)).await??;
        init_schema(&conn)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Some(Arc::new(ReaderPool { path, idle: Mutex::new(Vec::new()) })),
        })
    }

    /// Private in-memory database, for tests and dry runs. Reads share the
    /// writer connection since nothing else can see the database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { writer: Arc::new(Mutex::new(conn)), readers: None })
    }

    async fn with_writer<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| poisoned())?;
            f(&guard)
        })
        .await?
    }

    async fn with_reader<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let Some(pool) = self.readers.clone() else {
            return self.with_writer(f).await;
        };
        tokio::task::spawn_blocking(move || {
            let conn = pool.checkout()?;
            let out = f(&conn);
            pool.checkin(conn);
            out
        })
        .await?
    }
}

pub(crate) fn default_db_path() -> PathBuf {
    let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("sweepcache");
    p.push("results.db");
    p
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE IF NOT EXISTS backtest_runs (
             id                 INTEGER PRIMARY KEY AUTOINCREMENT,
             run_id             TEXT NOT NULL,
             fingerprint        TEXT,
             asset              TEXT NOT NULL,
             strategy           TEXT NOT NULL,
             timeframe          TEXT NOT NULL,
             leverage           INTEGER NOT NULL,
             short_threshold    REAL NOT NULL,
             long_threshold     REAL NOT NULL,
             max_position_ratio REAL NOT NULL,
             sharpe_ratio       REAL,
             max_drawdown       REAL,
             win_rate           REAL,
             time_in_market     REAL,
             num_trades         INTEGER,
             fees               REAL,
             funding            REAL,
             total_return       REAL,
             execution_time_ms  REAL,
             executed_at        TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_runs_asset ON backtest_runs(asset);
         CREATE INDEX IF NOT EXISTS idx_runs_strategy ON backtest_runs(strategy);
         CREATE INDEX IF NOT EXISTS idx_runs_timeframe ON backtest_runs(timeframe);
         CREATE INDEX IF NOT EXISTS idx_runs_leverage ON backtest_runs(leverage);
         CREATE INDEX IF NOT EXISTS idx_runs_thresholds ON backtest_runs(short_threshold, long_threshold);
         CREATE INDEX IF NOT EXISTS idx_runs_sharpe ON backtest_runs(sharpe_ratio);
         CREATE INDEX IF NOT EXISTS idx_runs_drawdown ON backtest_runs(max_drawdown);
         CREATE INDEX IF NOT EXISTS idx_runs_win_rate ON backtest_runs(win_rate);
         CREATE INDEX IF NOT EXISTS idx_runs_time_in_market ON backtest_runs(time_in_market);
         CREATE INDEX IF NOT EXISTS idx_runs_num_trades ON backtest_runs(num_trades);
         CREATE INDEX IF NOT EXISTS idx_runs_fees ON backtest_runs(fees);
         CREATE INDEX IF NOT EXISTS idx_runs_funding ON backtest_runs(funding);
         CREATE INDEX IF NOT EXISTS idx_runs_total_return ON backtest_runs(total_return);
         CREATE INDEX IF NOT EXISTS idx_runs_execution_time ON backtest_runs(execution_time_ms);
         CREATE INDEX IF NOT EXISTS idx_runs_fingerprint ON backtest_runs(fingerprint);",
    )?;
    Ok(())
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<ResultRow> {
    Ok(ResultRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        fingerprint: row.get(2)?,
        asset: row.get(3)?,
        strategy: row.get(4)?,
        timeframe: row.get(5)?,
        leverage: row.get(6)?,
        short_threshold: row.get(7)?,
        long_threshold: row.get(8)?,
        max_position_ratio: row.get(9)?,
        sharpe_ratio: row.get::<_, Option<f64>>(10)?.unwrap_or_default(),
        max_drawdown: row.get::<_, Option<f64>>(11)?.unwrap_or_default(),
        win_rate: row.get::<_, Option<f64>>(12)?.unwrap_or_default(),
        time_in_market: row.get::<_, Option<f64>>(13)?.unwrap_or_default(),
        num_trades: row.get::<_, Option<i64>>(14)?.map_or(0, |n| n.max(0) as u64),
        fees: row.get::<_, Option<f64>>(15)?.unwrap_or_default(),
        funding: row.get::<_, Option<f64>>(16)?.unwrap_or_default(),
        total_return: row.get::<_, Option<f64>>(17)?.unwrap_or_default(),
        execution_time_ms: row.get::<_, Option<f64>>(18)?.unwrap_or_default(),
        executed_at: row.get(19)?,
    })
}

/// Build the WHERE clause and bound values for a validated filter.
fn filter_clause(filter: &RunFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    let mut push_in = |column: &str, items: Vec<Value>| {
        if items.is_empty() {
            return;
        }
        let marks = vec!["?"; items.len()].join(", ");
        clauses.push(format!("{column} IN ({marks})"));
        values.extend(items);
    };
    push_in("asset", filter.assets.iter().cloned().map(Value::Text).collect());
    push_in("strategy", filter.strategies.iter().cloned().map(Value::Text).collect());
    push_in(
        "leverage",
        filter.leverages.iter().map(|&l| Value::Integer(i64::from(l))).collect(),
    );

    for (field, range) in &filter.ranges {
        clauses.push(format!("{col} BETWEEN ? AND ?", col = field.column()));
        values.push(Value::Real(range.min));
        values.push(Value::Real(range.max));
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (clause, values)
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn append(&self, row: &ResultRow) -> Result<RowId> {
        let r = row.clone();
        self.with_writer(move |conn| {
            conn.execute(
                "INSERT INTO backtest_runs (run_id, fingerprint, asset, strategy, timeframe, leverage,
                     short_threshold, long_threshold, max_position_ratio, sharpe_ratio, max_drawdown,
                     win_rate, time_in_market, num_trades, fees, funding, total_return,
                     execution_time_ms, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    r.run_id,
                    r.fingerprint,
                    r.asset,
                    r.strategy,
                    r.timeframe,
                    r.leverage,
                    r.short_threshold,
                    r.long_threshold,
                    r.max_position_ratio,
                    r.sharpe_ratio,
                    r.max_drawdown,
                    r.win_rate,
                    r.time_in_market,
                    i64::try_from(r.num_trades).unwrap_or(i64::MAX),
                    r.fees,
                    r.funding,
                    r.total_return,
                    r.execution_time_ms,
                    r.executed_at,
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!("Appended run {} as row {}", r.run_id, id);
            Ok(id)
        })
        .await
    }

    async fn count(&self) -> Result<u64> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM backtest_runs", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    async fn query_distinct(&self, field: DistinctField) -> Result<Vec<FieldValue>> {
        self.with_reader(move |conn| {
            let col = field.column();
            let sql = format!("SELECT DISTINCT {col} FROM backtest_runs WHERE {col} IS NOT NULL ORDER BY {col} ASC");
            let mut stmt = conn.prepare(&sql)?;
            let values = stmt
                .query_map([], |row| {
                    Ok(match row.get::<_, Value>(0)? {
                        | Value::Integer(i) => Some(FieldValue::Integer(i)),
                        | Value::Real(f) => Some(FieldValue::Real(f)),
                        | Value::Text(s) => Some(FieldValue::Text(s)),
                        | Value::Null | Value::Blob(_) => None,
                    })
                })?
                .filter_map(|v| v.transpose())
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(values)
        })
        .await
    }

    async fn distinct_threshold_pairs(&self) -> Result<Vec<ThresholdPair>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT short_threshold, long_threshold FROM backtest_runs
                 ORDER BY short_threshold ASC, long_threshold ASC",
            )?;
            let pairs = stmt
                .query_map([], |row| Ok(ThresholdPair { short: row.get(0)?, long: row.get(1)? }))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pairs)
        })
        .await
    }

    async fn query_ranges(&self, fields: &[MetricField]) -> Result<BTreeMap<MetricField, ValueRange>> {
        if fields.is_empty() {
            return Ok(BTreeMap::new());
        }
        let fields = fields.to_vec();
        self.with_reader(move |conn| {
            // one scalar subquery per bound so each can be answered from its index
            let selects: Vec<String> = fields
                .iter()
                .map(|f| {
                    let col = f.column();
                    format!(
                        "(SELECT MIN({col}) FROM backtest_runs), (SELECT MAX({col}) FROM backtest_runs)"
                    )
                })
                .collect();
            let sql = format!("SELECT {}", selects.join(", "));
            conn.query_row(&sql, [], |row| {
                let mut ranges = BTreeMap::new();
                for (i, field) in fields.iter().enumerate() {
                    let min: Option<f64> = row.get(2 * i)?;
                    let max: Option<f64> = row.get(2 * i + 1)?;
                    if let (Some(min), Some(max)) = (min, max) {
                        ranges.insert(*field, ValueRange { min, max });
                    }
                }
                Ok(ranges)
            })
            .map_err(Into::into)
        })
        .await
    }

    async fn query_runs(&self, filter: &RunFilter) -> Result<Vec<ResultRow>> {
        filter.validate()?;
        let filter = filter.clone();
        self.with_reader(move |conn| {
            let (clause, mut values) = filter_clause(&filter);
            let direction = if filter.descending { "DESC" } else { "ASC" };
            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM backtest_runs{clause} ORDER BY {col} {direction}, id ASC LIMIT ?",
                col = filter.order_by.column(),
            );
            values.push(Value::Integer(filter.limit as i64));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values), row_to_result)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

/// Open the store at `path`, creating parent directories.
pub async fn open_at(path: &Path) -> Result<SqliteResultStore> {
    SqliteResultStore::open(Some(path.to_path_buf())).await
}
