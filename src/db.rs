//! Persistence Layer
//! Mission: Durable store for markets, constraints, opportunities and trades
//!
//! SQLite with WAL mode for concurrent reads during writes, a small bounded
//! connection pool, prepared statement caching, and batch upserts inside
//! transactions. Every other component holds transient copies; the rows here
//! are the source of truth.

use crate::models::{
    Event, Market, MarketStatus, Opportunity, OpportunityStatus, PortfolioState, Relationship,
    RelationshipKind, Trade, TradeSignal,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use rusqlite::{params, Connection};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS markets (
    ticker          TEXT PRIMARY KEY,
    event_ticker    TEXT,
    title           TEXT NOT NULL,
    subtitle        TEXT,
    category        TEXT,
    status          TEXT NOT NULL,
    yes_ask         REAL,
    yes_bid         REAL,
    no_ask          REAL,
    no_bid          REAL,
    volume          INTEGER NOT NULL DEFAULT 0,
    open_interest   INTEGER NOT NULL DEFAULT 0,
    close_time      TEXT,
    rules_primary   TEXT,
    updated_at      TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_markets_status ON markets(status);
CREATE INDEX IF NOT EXISTS idx_markets_event ON markets(event_ticker);

CREATE TABLE IF NOT EXISTS price_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker          TEXT NOT NULL,
    yes_ask         REAL,
    yes_bid         REAL,
    snapshot_time   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_ticker ON price_snapshots(ticker, snapshot_time DESC);

CREATE TABLE IF NOT EXISTS events (
    event_ticker    TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    category        TEXT,
    market_tickers  TEXT NOT NULL   -- JSON array
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS relationships (
    id                      TEXT PRIMARY KEY,
    type                    TEXT NOT NULL,
    tickers                 TEXT NOT NULL,  -- JSON array, variant order
    tickers_key             TEXT NOT NULL,  -- JSON array, sorted (dedup key)
    constraint_description  TEXT NOT NULL,
    constraint_formula      TEXT NOT NULL,
    confidence              REAL NOT NULL,
    reasoning               TEXT NOT NULL,
    created_at              TEXT NOT NULL,
    last_validated          TEXT NOT NULL
) WITHOUT ROWID;

CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_dedup
    ON relationships(type, tickers_key);

CREATE TABLE IF NOT EXISTS opportunities (
    id                  TEXT PRIMARY KEY,
    relationship_id     TEXT,
    signal              TEXT NOT NULL,
    magnitude           REAL NOT NULL,
    confidence          REAL NOT NULL,
    score               REAL NOT NULL,
    legs                TEXT NOT NULL,  -- JSON array
    status              TEXT NOT NULL DEFAULT 'DETECTED',
    detected_at         TEXT NOT NULL,
    expires_at          TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_opportunities_status ON opportunities(status, detected_at DESC);

CREATE TABLE IF NOT EXISTS trades (
    id                  TEXT PRIMARY KEY,
    opportunity_id      TEXT,
    ticker              TEXT NOT NULL,
    side                TEXT NOT NULL,
    action              TEXT NOT NULL,
    price               REAL NOT NULL,
    count               INTEGER NOT NULL,
    order_id            TEXT NOT NULL,
    order_status        TEXT NOT NULL,
    filled_count        INTEGER NOT NULL DEFAULT 0,
    fees                REAL NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_opportunity ON trades(opportunity_id);
CREATE INDEX IF NOT EXISTS idx_trades_order ON trades(order_id);

CREATE TABLE IF NOT EXISTS portfolio_state (
    id                  INTEGER PRIMARY KEY CHECK (id = 1),
    balance             REAL NOT NULL DEFAULT 0,
    daily_pnl           REAL NOT NULL DEFAULT 0,
    open_positions      INTEGER NOT NULL DEFAULT 0,
    kill_switch         INTEGER NOT NULL DEFAULT 0,
    last_updated        TEXT NOT NULL
);
"#;

const MAX_CONNECTIONS: usize = 5;

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

struct Pool {
    path: String,
    max: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Pool {
    fn open_connection(path: &str) -> Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to apply connection pragmas")?;
        Ok(conn)
    }
}

/// Checked-out pool connection; returns itself to the pool on drop.
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<Pool>,
}

impl Deref for PooledConn {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.pool.state.lock();
            state.idle.push(conn);
            self.pool.available.notify_one();
        }
    }
}

/// Handle to the store. Cheap to clone; all clones share one bounded pool.
#[derive(Clone)]
pub struct Db {
    pool: Arc<Pool>,
}

impl Db {
    /// Open (or create) the database and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        let first = Pool::open_connection(path)?;
        first
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialise database schema")?;

        let journal_mode: String = first
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("Database initialised at {}", path);

        Ok(Self {
            pool: Arc::new(Pool {
                path: path.to_string(),
                max: MAX_CONNECTIONS,
                state: Mutex::new(PoolState {
                    idle: vec![first],
                    open: 1,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Check out a connection, opening a new one up to the pool cap and
    /// blocking when all are in use.
    pub fn conn(&self) -> Result<PooledConn> {
        let mut state = self.pool.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConn {
                    conn: Some(conn),
                    pool: Arc::clone(&self.pool),
                });
            }
            if state.open < self.pool.max {
                state.open += 1;
                drop(state);
                let conn = match Pool::open_connection(&self.pool.path) {
                    Ok(c) => c,
                    Err(e) => {
                        self.pool.state.lock().open -= 1;
                        return Err(e);
                    }
                };
                return Ok(PooledConn {
                    conn: Some(conn),
                    pool: Arc::clone(&self.pool),
                });
            }
            self.pool.available.wait(&mut state);
        }
    }

    // -----------------------------------------------------------------
    // Markets + snapshots
    // -----------------------------------------------------------------

    /// Transactional batch upsert; also appends a price snapshot for every
    /// market carrying both a yes_ask and a yes_bid.
    pub fn upsert_market_batch(&self, markets: &[Market]) -> Result<usize> {
        if markets.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_iso();
        for m in markets {
            tx.execute(
                "INSERT INTO markets (ticker, event_ticker, title, subtitle, category,
                                      status, yes_ask, yes_bid, no_ask, no_bid,
                                      volume, open_interest, close_time, rules_primary, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(ticker) DO UPDATE SET
                    event_ticker  = excluded.event_ticker,
                    title         = excluded.title,
                    subtitle      = excluded.subtitle,
                    category      = excluded.category,
                    status        = excluded.status,
                    yes_ask       = excluded.yes_ask,
                    yes_bid       = excluded.yes_bid,
                    no_ask        = excluded.no_ask,
                    no_bid        = excluded.no_bid,
                    volume        = excluded.volume,
                    open_interest = excluded.open_interest,
                    close_time    = excluded.close_time,
                    rules_primary = excluded.rules_primary,
                    updated_at    = excluded.updated_at",
                params![
                    m.ticker,
                    m.event_ticker,
                    m.title,
                    m.subtitle,
                    m.category,
                    m.status.as_str(),
                    m.yes_ask,
                    m.yes_bid,
                    m.no_ask,
                    m.no_bid,
                    m.volume,
                    m.open_interest,
                    m.close_time,
                    m.rules_primary,
                    now,
                ],
            )?;

            if let (Some(ask), Some(bid)) = (m.yes_ask, m.yes_bid) {
                tx.execute(
                    "INSERT INTO price_snapshots (ticker, yes_ask, yes_bid, snapshot_time)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![m.ticker, ask, bid, now],
                )?;
            }
        }
        tx.commit()?;
        debug!("Upserted batch of {} markets", markets.len());
        Ok(markets.len())
    }

    pub fn get_market(&self, ticker: &str) -> Result<Option<Market>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, event_ticker, title, subtitle, category, status,
                    yes_ask, yes_bid, no_ask, no_bid, volume, open_interest,
                    close_time, rules_primary, updated_at
             FROM markets WHERE ticker = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([ticker])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_market(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_open_markets(&self) -> Result<Vec<Market>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, event_ticker, title, subtitle, category, status,
                    yes_ask, yes_bid, no_ask, no_bid, volume, open_interest,
                    close_time, rules_primary, updated_at
             FROM markets WHERE status IN ('open', 'active')",
        )?;
        let markets = stmt
            .query_map([], row_to_market)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(markets)
    }

    /// Audit query over the append-only snapshot log.
    pub fn recent_snapshots(&self, ticker: &str, limit: usize) -> Result<Vec<(f64, f64, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT yes_ask, yes_bid, snapshot_time FROM price_snapshots
             WHERE ticker = ?1 ORDER BY snapshot_time DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![ticker, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    pub fn upsert_event_batch(&self, events: &[Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for e in events {
            let tickers_json = serde_json::to_string(&e.market_tickers)?;
            tx.execute(
                "INSERT INTO events (event_ticker, title, category, market_tickers)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(event_ticker) DO UPDATE SET
                    title          = excluded.title,
                    category       = excluded.category,
                    market_tickers = excluded.market_tickers",
                params![e.event_ticker, e.title, e.category, tickers_json],
            )?;
        }
        tx.commit()?;
        Ok(events.len())
    }

    pub fn get_all_events(&self) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT event_ticker, title, category, market_tickers FROM events")?;
        let events = stmt
            .query_map([], |row| {
                let tickers_json: String = row.get(3)?;
                Ok(Event {
                    event_ticker: row.get(0)?,
                    title: row.get(1)?,
                    category: row.get(2)?,
                    market_tickers: serde_json::from_str(&tickers_json).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    // -----------------------------------------------------------------
    // Relationships
    // -----------------------------------------------------------------

    /// Insert a relationship, or refresh `last_validated` and `confidence`
    /// when one with the same (type, sorted tickers) already exists.
    ///
    /// Returns true when a new row was created.
    pub fn upsert_relationship(&self, rel: &Relationship) -> Result<bool> {
        let conn = self.conn()?;
        let tickers_json = serde_json::to_string(&rel.tickers)?;
        let key = rel.dedup_key();
        let now = now_iso();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM relationships WHERE type = ?1 AND tickers_key = ?2 LIMIT 1",
                params![rel.kind.as_str(), key],
                |row| row.get(0),
            )
            .ok();

        if let Some(id) = existing {
            conn.execute(
                "UPDATE relationships SET last_validated = ?1, confidence = ?2 WHERE id = ?3",
                params![now, rel.confidence, id],
            )?;
            debug!("Re-validated existing relationship {}", id);
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO relationships (id, type, tickers, tickers_key,
                                        constraint_description, constraint_formula,
                                        confidence, reasoning, created_at, last_validated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rel.id,
                rel.kind.as_str(),
                tickers_json,
                key,
                rel.constraint_description,
                rel.constraint_formula,
                rel.confidence,
                rel.reasoning,
                rel.created_at.to_rfc3339(),
                rel.last_validated.to_rfc3339(),
            ],
        )?;
        Ok(true)
    }

    /// Relationships that reference at least one still-open market.
    pub fn get_active_relationships(&self) -> Result<Vec<Relationship>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT r.id, r.type, r.tickers, r.constraint_description, r.constraint_formula,
                    r.confidence, r.reasoning, r.created_at, r.last_validated
             FROM relationships r
             WHERE EXISTS (
                 SELECT 1 FROM markets m
                 WHERE m.status IN ('open', 'active')
                   AND r.tickers LIKE '%' || m.ticker || '%'
             )",
        )?;
        let rels = stmt
            .query_map([], row_to_relationship)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rels)
    }

    pub fn get_relationship(&self, id: &str) -> Result<Option<Relationship>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, type, tickers, constraint_description, constraint_formula,
                    confidence, reasoning, created_at, last_validated
             FROM relationships WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_relationship(row)?)),
            None => Ok(None),
        }
    }

    pub fn refresh_relationship(&self, id: &str, confidence: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE relationships SET last_validated = ?1, confidence = ?2 WHERE id = ?3",
            params![now_iso(), confidence, id],
        )?;
        Ok(())
    }

    /// Delete every relationship none of whose markets remain open.
    /// Returns the number removed.
    pub fn cleanup_stale_relationships(&self) -> Result<usize> {
        let conn = self.conn()?;
        let rows: Vec<(String, String)> = {
            let mut stmt = conn.prepare_cached("SELECT id, tickers FROM relationships")?;
            let collected = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            collected
        };

        let mut removed = 0usize;
        for (id, tickers_json) in rows {
            let tickers: Vec<String> = serde_json::from_str(&tickers_json).unwrap_or_default();
            let mut any_open = false;
            for t in &tickers {
                let status: Option<String> = conn
                    .query_row(
                        "SELECT status FROM markets WHERE ticker = ?1",
                        [t],
                        |row| row.get(0),
                    )
                    .ok();
                if matches!(status.as_deref(), Some("open") | Some("active")) {
                    any_open = true;
                    break;
                }
            }
            if !any_open {
                conn.execute("DELETE FROM relationships WHERE id = ?1", [&id])?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Cleaned up {} stale relationships", removed);
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------
    // Opportunities
    // -----------------------------------------------------------------

    pub fn insert_opportunity(&self, opp: &Opportunity) -> Result<()> {
        let conn = self.conn()?;
        let legs_json = serde_json::to_string(&opp.legs)?;
        conn.execute(
            "INSERT INTO opportunities (id, relationship_id, signal, magnitude, confidence,
                                        score, legs, status, detected_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                opp.id,
                opp.relationship_id,
                opp.signal.label(),
                opp.magnitude,
                opp.confidence,
                opp.score,
                legs_json,
                opp.status.as_str(),
                opp.detected_at.to_rfc3339(),
                opp.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_opportunity_status(&self, id: &str, status: OpportunityStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE opportunities SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn get_opportunity(&self, id: &str) -> Result<Option<Opportunity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, relationship_id, signal, magnitude, confidence, score,
                    legs, status, detected_at, expires_at
             FROM opportunities WHERE id = ?1 LIMIT 1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_opportunity(row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------
    // Trades
    // -----------------------------------------------------------------

    pub fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trades (id, opportunity_id, ticker, side, action, price, count,
                                 order_id, order_status, filled_count, fees,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                trade.id,
                trade.opportunity_id,
                trade.ticker,
                trade.side.as_str(),
                trade.action.as_str(),
                trade.price,
                trade.count,
                trade.order_id,
                trade.order_status,
                trade.filled_count,
                trade.fees,
                trade.created_at,
                trade.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Status and filled_count are the only mutable trade fields.
    pub fn update_trade_status(
        &self,
        order_id: &str,
        order_status: &str,
        filled_count: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn()?;
        match filled_count {
            Some(filled) => {
                conn.execute(
                    "UPDATE trades SET order_status = ?1, filled_count = ?2, updated_at = ?3
                     WHERE order_id = ?4",
                    params![order_status, filled, now_iso(), order_id],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE trades SET order_status = ?1, updated_at = ?2 WHERE order_id = ?3",
                    params![order_status, now_iso(), order_id],
                )?;
            }
        }
        Ok(())
    }

    pub fn get_trades_for_opportunity(&self, opportunity_id: &str) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, opportunity_id, ticker, side, action, price, count,
                    order_id, order_status, filled_count, fees, created_at, updated_at
             FROM trades WHERE opportunity_id = ?1 ORDER BY created_at",
        )?;
        let trades = stmt
            .query_map([opportunity_id], row_to_trade)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(trades)
    }

    // -----------------------------------------------------------------
    // Portfolio state (single row, id = 1)
    // -----------------------------------------------------------------

    pub fn get_portfolio_state(&self) -> Result<Option<PortfolioState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT balance, daily_pnl, open_positions, kill_switch, last_updated
             FROM portfolio_state WHERE id = 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(PortfolioState {
                balance: row.get(0)?,
                daily_pnl: row.get(1)?,
                open_positions: row.get(2)?,
                kill_switch: row.get::<_, i64>(3)? != 0,
                last_updated: row.get(4)?,
            })),
            None => Ok(None),
        }
    }

    pub fn upsert_portfolio_state(&self, state: &PortfolioState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO portfolio_state (id, balance, daily_pnl, open_positions, kill_switch, last_updated)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                balance        = excluded.balance,
                daily_pnl      = excluded.daily_pnl,
                open_positions = excluded.open_positions,
                kill_switch    = excluded.kill_switch,
                last_updated   = excluded.last_updated",
            params![
                state.balance,
                state.daily_pnl,
                state.open_positions,
                state.kill_switch as i64,
                now_iso(),
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------

fn row_to_market(row: &rusqlite::Row) -> rusqlite::Result<Market> {
    let status: String = row.get(5)?;
    Ok(Market {
        ticker: row.get(0)?,
        event_ticker: row.get(1)?,
        title: row.get(2)?,
        subtitle: row.get(3)?,
        category: row.get(4)?,
        status: MarketStatus::parse(&status),
        yes_ask: row.get(6)?,
        yes_bid: row.get(7)?,
        no_ask: row.get(8)?,
        no_bid: row.get(9)?,
        volume: row.get(10)?,
        open_interest: row.get(11)?,
        close_time: row.get(12)?,
        rules_primary: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn row_to_relationship(row: &rusqlite::Row) -> rusqlite::Result<Relationship> {
    let kind_str: String = row.get(1)?;
    let tickers_json: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    let last_validated: String = row.get(8)?;
    Ok(Relationship {
        id: row.get(0)?,
        kind: RelationshipKind::parse(&kind_str).ok_or_else(|| {
            rusqlite::Error::ToSqlConversionFailure(
                anyhow!("unknown relationship type {}", kind_str).into(),
            )
        })?,
        tickers: serde_json::from_str(&tickers_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        constraint_description: row.get(3)?,
        constraint_formula: row.get(4)?,
        confidence: row.get(5)?,
        reasoning: row.get(6)?,
        created_at: parse_ts(&created_at),
        last_validated: parse_ts(&last_validated),
    })
}

fn row_to_opportunity(row: &rusqlite::Row) -> rusqlite::Result<Opportunity> {
    let signal_label: String = row.get(2)?;
    let legs_json: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let detected_at: String = row.get(8)?;
    let expires_at: String = row.get(9)?;
    Ok(Opportunity {
        id: row.get(0)?,
        relationship_id: row.get(1)?,
        signal: TradeSignal::from_label(&signal_label).ok_or_else(|| {
            rusqlite::Error::ToSqlConversionFailure(
                anyhow!("unparseable signal {}", signal_label).into(),
            )
        })?,
        magnitude: row.get(3)?,
        confidence: row.get(4)?,
        score: row.get(5)?,
        legs: serde_json::from_str(&legs_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        status: OpportunityStatus::parse(&status_str).unwrap_or(OpportunityStatus::Detected),
        detected_at: parse_ts(&detected_at),
        expires_at: parse_ts(&expires_at),
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Trade> {
    let side: String = row.get(3)?;
    let action: String = row.get(4)?;
    Ok(Trade {
        id: row.get(0)?,
        opportunity_id: row.get(1)?,
        ticker: row.get(2)?,
        side: if side == "no" {
            crate::models::ContractSide::No
        } else {
            crate::models::ContractSide::Yes
        },
        action: if action == "sell" {
            crate::models::LegSide::Sell
        } else {
            crate::models::LegSide::Buy
        },
        price: row.get(5)?,
        count: row.get(6)?,
        order_id: row.get(7)?,
        order_status: row.get(8)?,
        filled_count: row.get(9)?,
        fees: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContractSide, Leg, LegSide};
    use chrono::Duration;
    use uuid::Uuid;

    fn test_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Db::open(path.to_str().unwrap()).unwrap();
        (dir, db)
    }

    fn market(ticker: &str, status: MarketStatus) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_ticker: Some("EVT".to_string()),
            title: format!("Market {}", ticker),
            subtitle: None,
            category: Some("Economics".to_string()),
            status,
            yes_ask: Some(0.40),
            yes_bid: Some(0.38),
            no_ask: Some(0.62),
            no_bid: Some(0.60),
            volume: 100,
            open_interest: 50,
            close_time: None,
            rules_primary: None,
            updated_at: now_iso(),
        }
    }

    fn relationship(kind: RelationshipKind, tickers: &[&str]) -> Relationship {
        Relationship {
            id: Uuid::new_v4().to_string(),
            kind,
            tickers: tickers.iter().map(|t| t.to_string()).collect(),
            constraint_description: "desc".to_string(),
            constraint_formula: "formula".to_string(),
            confidence: 0.9,
            reasoning: "because".to_string(),
            created_at: Utc::now(),
            last_validated: Utc::now(),
        }
    }

    #[test]
    fn market_upsert_is_idempotent() {
        let (_dir, db) = test_db();
        let m = market("AAA", MarketStatus::Open);
        db.upsert_market_batch(&[m.clone()]).unwrap();
        db.upsert_market_batch(&[m]).unwrap();

        let fetched = db.get_market("AAA").unwrap().unwrap();
        assert_eq!(fetched.yes_ask, Some(0.40));
        assert_eq!(db.get_open_markets().unwrap().len(), 1);
        // but each pass appended a snapshot
        assert_eq!(db.recent_snapshots("AAA", 10).unwrap().len(), 2);
    }

    #[test]
    fn relationship_dedup_refreshes_instead_of_duplicating() {
        let (_dir, db) = test_db();
        db.upsert_market_batch(&[market("AAA", MarketStatus::Open)])
            .unwrap();

        let r1 = relationship(RelationshipKind::Subset, &["AAA", "BBB"]);
        assert!(db.upsert_relationship(&r1).unwrap());

        // Same pair in reversed order dedups to the same row
        let mut r2 = relationship(RelationshipKind::Subset, &["BBB", "AAA"]);
        r2.confidence = 0.95;
        assert!(!db.upsert_relationship(&r2).unwrap());

        let active = db.get_active_relationships().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].confidence, 0.95);
        // Semantic order of the original row is preserved
        assert_eq!(active[0].tickers, vec!["AAA", "BBB"]);
    }

    #[test]
    fn stale_relationships_are_removed() {
        let (_dir, db) = test_db();
        db.upsert_market_batch(&[
            market("AAA", MarketStatus::Settled),
            market("BBB", MarketStatus::Open),
        ])
        .unwrap();

        db.upsert_relationship(&relationship(RelationshipKind::Subset, &["AAA", "CCC"]))
            .unwrap();
        db.upsert_relationship(&relationship(RelationshipKind::Subset, &["AAA", "BBB"]))
            .unwrap();

        let removed = db.cleanup_stale_relationships().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(db.get_active_relationships().unwrap().len(), 1);
    }

    #[test]
    fn opportunity_round_trip_and_status() {
        let (_dir, db) = test_db();
        let opp = Opportunity {
            id: Uuid::new_v4().to_string(),
            relationship_id: None,
            signal: TradeSignal::BuyAllPartition,
            magnitude: 0.40,
            confidence: 0.9,
            score: 0.36,
            legs: vec![Leg {
                ticker: "AAA".to_string(),
                side: LegSide::Buy,
                contract: ContractSide::Yes,
                price: 0.20,
                depth: 50,
            }],
            status: OpportunityStatus::Detected,
            detected_at: Utc::now(),
            expires_at: Utc::now() + Duration::minutes(5),
        };
        db.insert_opportunity(&opp).unwrap();
        db.update_opportunity_status(&opp.id, OpportunityStatus::Filled)
            .unwrap();

        let fetched = db.get_opportunity(&opp.id).unwrap().unwrap();
        assert_eq!(fetched.status, OpportunityStatus::Filled);
        assert_eq!(fetched.signal, TradeSignal::BuyAllPartition);
        assert_eq!(fetched.legs.len(), 1);
    }

    #[test]
    fn portfolio_state_single_row() {
        let (_dir, db) = test_db();
        assert!(db.get_portfolio_state().unwrap().is_none());

        let state = PortfolioState {
            balance: 100.0,
            daily_pnl: -5.0,
            open_positions: 2,
            kill_switch: true,
            last_updated: now_iso(),
        };
        db.upsert_portfolio_state(&state).unwrap();
        db.upsert_portfolio_state(&state).unwrap();

        let fetched = db.get_portfolio_state().unwrap().unwrap();
        assert_eq!(fetched.balance, 100.0);
        assert!(fetched.kill_switch);
    }

    #[test]
    fn trade_status_update_touches_only_mutable_fields() {
        let (_dir, db) = test_db();
        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            opportunity_id: Some("opp-1".to_string()),
            ticker: "AAA".to_string(),
            side: ContractSide::Yes,
            action: LegSide::Buy,
            price: 0.50,
            count: 10,
            order_id: "ord-1".to_string(),
            order_status: "pending".to_string(),
            filled_count: 0,
            fees: 0.18,
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        db.insert_trade(&trade).unwrap();
        db.update_trade_status("ord-1", "filled", Some(10)).unwrap();

        let trades = db.get_trades_for_opportunity("opp-1").unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].order_status, "filled");
        assert_eq!(trades[0].filled_count, 10);
        assert_eq!(trades[0].price, 0.50);
    }
}
