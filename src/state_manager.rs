// State Manager for the exchange
// SQLite-based persistence with JSON backup
//
// Stores sessions, orders, trades, holdings, portfolios and the cash ledger,
// every row scoped by session. A settled fill is written in one transaction.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, Row, ToSql};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::oms::{Order, Trade};
use crate::session::Session;
use crate::settlement::{Holding, LedgerEntry, Portfolio, PreparedSettlement};
use crate::{Money, SessionId, Symbol, UserId};

// =============================================================================
// Column conversions
// =============================================================================

impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(_) => value
                .as_str()?
                .parse()
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Integer(i) => Ok(Money::from_i64(i)),
            ValueRef::Real(f) => Ok(Money::from_f64(f)),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

fn opt_id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v as u64))
}

// =============================================================================
// State Manager Implementation
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: Option<PathBuf>,
    auto_backup: bool,
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: P, auto_backup: bool) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Create parent directories
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: Some(json_backup_path.as_ref().to_path_buf()),
            auto_backup,
        };

        manager.create_tables()?;
        info!("SQLite state manager initialized at {}", db_path.display());

        Ok(manager)
    }

    /// Throwaway store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: None,
            auto_backup: false,
        };
        manager.create_tables()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database mutex poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_open INTEGER NOT NULL DEFAULT 0,
                starts_at TEXT,
                ends_at TEXT,
                rules TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS portfolios (
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                cash TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                trade_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS holdings (
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                average_cost TEXT NOT NULL,
                cost_basis TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, user_id, symbol)
            );

            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                limit_price TEXT,
                quantity INTEGER NOT NULL,
                filled_quantity INTEGER NOT NULL,
                remaining_quantity INTEGER NOT NULL,
                average_fill_price TEXT NOT NULL,
                status TEXT NOT NULL,
                commission TEXT NOT NULL,
                reserved_cash TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT
            );

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY,
                fill_id INTEGER NOT NULL,
                order_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price TEXT NOT NULL,
                value TEXT NOT NULL,
                commission TEXT NOT NULL,
                liquidity TEXT NOT NULL,
                counterparty_order INTEGER,
                executed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                balance_after TEXT NOT NULL,
                order_id INTEGER,
                trade_id INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(session_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_trades_user ON trades(session_id, user_id);
            CREATE INDEX IF NOT EXISTS idx_ledger_user ON ledger_entries(session_id, user_id);",
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn save_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn()?;
        let rules_json = serde_json::to_string(&session.rules)?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions (id, name, is_open, starts_at, ends_at, rules)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id.as_str(),
                session.name,
                session.is_open,
                session.starts_at,
                session.ends_at,
                rules_json,
            ],
        )?;
        debug!("Session saved: {} open={}", session.id, session.is_open);
        Ok(())
    }

    pub fn save_order(&self, order: &Order) -> Result<()> {
        let conn = self.conn()?;
        upsert_order(&conn, order)?;
        debug!("Order saved: {} [{}]", order.id, order.status);
        Ok(())
    }

    pub fn save_portfolio(&self, portfolio: &Portfolio) -> Result<()> {
        let conn = self.conn()?;
        upsert_portfolio(&conn, portfolio)
    }

    pub fn append_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        let conn = self.conn()?;
        insert_ledger(&conn, entry)
    }

    /// Write one settled fill: trades, ledger entries, portfolios, holdings
    /// and the orders it touched, all in one transaction.
    pub fn persist_settlement(
        &self,
        prepared: &PreparedSettlement,
        orders: &[&Order],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for trade in prepared.trades() {
            insert_trade(&tx, trade)?;
        }
        for entry in prepared.ledger_entries() {
            insert_ledger(&tx, entry)?;
        }
        for portfolio in prepared.portfolios() {
            upsert_portfolio(&tx, portfolio)?;
        }
        for (session, user, symbol, holding) in prepared.holdings() {
            match holding {
                Some(holding) => upsert_holding(&tx, holding)?,
                None => {
                    tx.execute(
                        "DELETE FROM holdings WHERE session_id = ?1 AND user_id = ?2 AND symbol = ?3",
                        params![session.as_str(), user.as_str(), symbol.as_str()],
                    )?;
                }
            }
        }
        for order in orders {
            upsert_order(&tx, order)?;
        }

        tx.commit().context("Failed to commit settlement")?;
        debug!("Fill {} persisted", prepared.fill_id);

        if self.auto_backup {
            drop(conn);
            self.export_json()?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn load_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, is_open, starts_at, ends_at, rules FROM sessions")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    SessionId::new(row.get::<_, String>(0)?),
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<DateTime<Utc>>>(3)?,
                    row.get::<_, Option<DateTime<Utc>>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, name, is_open, starts_at, ends_at, rules)| {
                let rules = serde_json::from_str(&rules)
                    .with_context(|| format!("Corrupt rules for session {id}"))?;
                Ok(Session {
                    id,
                    name,
                    is_open,
                    starts_at,
                    ends_at,
                    rules,
                })
            })
            .collect()
    }

    pub fn load_portfolios(&self) -> Result<Vec<Portfolio>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, cash, realized_pnl, trade_count, updated_at FROM portfolios",
        )?;
        let portfolios = stmt
            .query_map([], |row| {
                Ok(Portfolio {
                    session: SessionId::new(row.get::<_, String>(0)?),
                    user: UserId::new(row.get::<_, String>(1)?),
                    cash: row.get(2)?,
                    realized_pnl: row.get(3)?,
                    trade_count: id_col(row, 4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(portfolios)
    }

    pub fn load_holdings(&self) -> Result<Vec<Holding>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, symbol, quantity, average_cost, cost_basis, updated_at
             FROM holdings",
        )?;
        let holdings = stmt
            .query_map([], |row| {
                Ok(Holding {
                    session: SessionId::new(row.get::<_, String>(0)?),
                    user: UserId::new(row.get::<_, String>(1)?),
                    symbol: Symbol::new(row.get::<_, String>(2)?),
                    quantity: row.get(3)?,
                    average_cost: row.get(4)?,
                    cost_basis: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(holdings)
    }

    /// Orders, optionally only those still live (open or partially filled)
    pub fn load_orders(&self, active_only: bool) -> Result<Vec<Order>> {
        let conn = self.conn()?;
        let query = if active_only {
            "SELECT * FROM orders WHERE status IN ('open', 'partially_filled') ORDER BY id"
        } else {
            "SELECT * FROM orders ORDER BY id"
        };
        let mut stmt = conn.prepare(query)?;
        let orders = stmt
            .query_map([], order_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        debug!("Loaded {} orders (active_only: {})", orders.len(), active_only);
        Ok(orders)
    }

    pub fn load_trades(&self) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM trades ORDER BY id")?;
        let trades = stmt
            .query_map([], |row| {
                Ok(Trade {
                    id: id_col(row, 0)?,
                    fill_id: id_col(row, 1)?,
                    order_id: id_col(row, 2)?,
                    user: UserId::new(row.get::<_, String>(3)?),
                    session: SessionId::new(row.get::<_, String>(4)?),
                    symbol: Symbol::new(row.get::<_, String>(5)?),
                    side: parse_col(row, 6)?,
                    quantity: id_col(row, 7)?,
                    price: row.get(8)?,
                    value: row.get(9)?,
                    commission: row.get(10)?,
                    liquidity: parse_col(row, 11)?,
                    counterparty_order: opt_id_col(row, 12)?,
                    executed_at: row.get(13)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    pub fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM ledger_entries ORDER BY id")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    id: id_col(row, 0)?,
                    session: SessionId::new(row.get::<_, String>(1)?),
                    user: UserId::new(row.get::<_, String>(2)?),
                    kind: parse_col(row, 3)?,
                    amount: row.get(4)?,
                    balance_after: row.get(5)?,
                    order_id: opt_id_col(row, 6)?,
                    trade_id: opt_id_col(row, 7)?,
                    created_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn export_json(&self) -> Result<()> {
        let Some(path) = &self.json_backup_path else {
            return Ok(());
        };

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "sessions": self.load_sessions()?,
            "portfolios": self.load_portfolios()?,
            "holdings": self.load_holdings()?,
            "open_orders": self.load_orders(true)?,
        });

        std::fs::write(path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("Failed to write backup {}", path.display()))?;
        debug!("State exported to: {}", path.display());
        Ok(())
    }
}

fn upsert_order(conn: &Connection, order: &Order) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO orders
         (id, user_id, session_id, symbol, side, order_type, limit_price, quantity,
          filled_quantity, remaining_quantity, average_fill_price, status, commission,
          reserved_cash, priority, created_at, updated_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            order.id as i64,
            order.user.as_str(),
            order.session.as_str(),
            order.symbol.as_str(),
            order.side.as_str(),
            order.order_type.as_str(),
            order.limit_price,
            order.quantity as i64,
            order.filled_quantity as i64,
            order.remaining_quantity as i64,
            order.average_fill_price,
            order.status.as_str(),
            order.commission,
            order.reserved_cash,
            order.priority as i64,
            order.created_at,
            order.updated_at,
            order.expires_at,
        ],
    )?;
    Ok(())
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: id_col(row, 0)?,
        user: UserId::new(row.get::<_, String>(1)?),
        session: SessionId::new(row.get::<_, String>(2)?),
        symbol: Symbol::new(row.get::<_, String>(3)?),
        side: parse_col(row, 4)?,
        order_type: parse_col(row, 5)?,
        limit_price: row.get(6)?,
        quantity: id_col(row, 7)?,
        filled_quantity: id_col(row, 8)?,
        remaining_quantity: id_col(row, 9)?,
        average_fill_price: row.get(10)?,
        status: parse_col(row, 11)?,
        commission: row.get(12)?,
        reserved_cash: row.get(13)?,
        priority: id_col(row, 14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        expires_at: row.get(17)?,
    })
}

fn upsert_portfolio(conn: &Connection, p: &Portfolio) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO portfolios
         (session_id, user_id, cash, realized_pnl, trade_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            p.session.as_str(),
            p.user.as_str(),
            p.cash,
            p.realized_pnl,
            p.trade_count as i64,
            p.updated_at,
        ],
    )?;
    Ok(())
}

fn upsert_holding(conn: &Connection, h: &Holding) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO holdings
         (session_id, user_id, symbol, quantity, average_cost, cost_basis, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            h.session.as_str(),
            h.user.as_str(),
            h.symbol.as_str(),
            h.quantity,
            h.average_cost,
            h.cost_basis,
            h.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_trade(conn: &Connection, t: &Trade) -> Result<()> {
    conn.execute(
        "INSERT INTO trades
         (id, fill_id, order_id, user_id, session_id, symbol, side, quantity, price,
          value, commission, liquidity, counterparty_order, executed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            t.id as i64,
            t.fill_id as i64,
            t.order_id as i64,
            t.user.as_str(),
            t.session.as_str(),
            t.symbol.as_str(),
            t.side.as_str(),
            t.quantity as i64,
            t.price,
            t.value,
            t.commission,
            t.liquidity.as_str(),
            t.counterparty_order.map(|id| id as i64),
            t.executed_at,
        ],
    )?;
    info!(
        "Trade recorded: {} {} {} @ {} | commission {} | {}",
        t.side.as_str().to_uppercase(),
        t.quantity,
        t.symbol,
        t.price,
        t.commission,
        t.liquidity.as_str()
    );
    Ok(())
}

fn insert_ledger(conn: &Connection, e: &LedgerEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO ledger_entries
         (id, session_id, user_id, kind, amount, balance_after, order_id, trade_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            e.id as i64,
            e.session.as_str(),
            e.user.as_str(),
            e.kind.as_str(),
            e.amount,
            e.balance_after,
            e.order_id.map(|id| id as i64),
            e.trade_id.map(|id| id as i64),
            e.created_at,
        ],
    )?;
    Ok(())
}

// =============================================================================
// Factory Function
// =============================================================================

pub fn create_state_manager<P: AsRef<Path>>(state_dir: P) -> Result<SqliteStateManager> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)?;

    let db_path = state_dir.join("exchange.db");
    let json_path = state_dir.join("exchange_backup.json");

    SqliteStateManager::new(db_path, json_path, false)
}
