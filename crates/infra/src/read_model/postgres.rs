//! Postgres-backed ledger store.
//!
//! Amounts are unconstrained `NUMERIC` (totals can outgrow one 256-bit word) and travel as
//! decimal text in both directions. Addresses are stored as lowercase
//! `0x`-prefixed hex.
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError |
//! |------------|------------|
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | `Unavailable` |
//! | Database, SQLSTATE class `08` / `53`, `40001`, `40P01`, `57P01` | `Unavailable` |
//! | Database (other), decode and row errors | `Corrupt` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use pbalend_core::{Address, Amount, MarketKey, PositionKey};
use pbalend_events::EventPosition;
use pbalend_lending::{BorrowPosition, LendPosition, Market};

use super::store::{LedgerRow, LedgerStore, LedgerWrite, MarketPositions, StoreError};

/// Postgres ledger store.
///
/// `commit` runs in a single transaction, so the row and the market cursor
/// land together or not at all. Every table lives in the configured schema.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
    schema: String,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self, StoreError> {
        let schema = schema.into();
        if !is_identifier(&schema) {
            return Err(StoreError::Corrupt(format!("invalid schema name: {schema:?}")));
        }
        Ok(Self {
            pool: Arc::new(pool),
            schema,
        })
    }

    /// Open a pool against `url`.
    pub async fn connect(url: &str, schema: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Self::new(pool, schema)
    }

    /// Create the schema and ledger tables if they do not exist yet.
    #[instrument(skip(self), fields(schema = %self.schema), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in schema_statements(&self.schema) {
            sqlx::query(&statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("ledger schema ready");
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("\"{}\".{}", self.schema, name)
    }

    async fn fetch_lend(&self, filter: &str, binds: &[String]) -> Result<Vec<LendPosition>, StoreError> {
        let sql = format!(
            "SELECT loan_token, collateral_token, user_address, amount::text AS amount, shares::text AS shares \
             FROM {} WHERE {} ORDER BY loan_token, collateral_token, user_address",
            self.table("lend_positions"),
            filter
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_lend_positions", e))?;
        rows.iter().map(lend_from_row).collect()
    }

    async fn fetch_borrow(&self, filter: &str, binds: &[String]) -> Result<Vec<BorrowPosition>, StoreError> {
        let sql = format!(
            "SELECT loan_token, collateral_token, user_address, amount::text AS amount, shares::text AS shares, \
             collateral_amount::text AS collateral_amount \
             FROM {} WHERE {} ORDER BY loan_token, collateral_token, user_address",
            self.table("borrow_positions"),
            filter
        );
        let mut query = sqlx::query(&sql);
        for b in binds {
            query = query.bind(b);
        }
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_borrow_positions", e))?;
        rows.iter().map(borrow_from_row).collect()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), fields(market = %key), err)]
    async fn get_market(&self, key: &MarketKey) -> Result<Option<Market>, StoreError> {
        let sql = format!(
            "SELECT loan_token, collateral_token, interest_rate::text AS interest_rate, ltv::text AS ltv \
             FROM {} WHERE loan_token = $1 AND collateral_token = $2",
            self.table("markets")
        );
        let row = sqlx::query(&sql)
            .bind(key.loan_token.to_string())
            .bind(key.collateral_token.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_market", e))?;
        row.as_ref().map(market_from_row).transpose()
    }

    #[instrument(skip(self), fields(position = %key), err)]
    async fn get_lend_position(&self, key: &PositionKey) -> Result<Option<LendPosition>, StoreError> {
        let mut rows = self
            .fetch_lend(
                "loan_token = $1 AND collateral_token = $2 AND user_address = $3",
                &position_binds(key),
            )
            .await?;
        Ok(rows.pop())
    }

    #[instrument(skip(self), fields(position = %key), err)]
    async fn get_borrow_position(&self, key: &PositionKey) -> Result<Option<BorrowPosition>, StoreError> {
        let mut rows = self
            .fetch_borrow(
                "loan_token = $1 AND collateral_token = $2 AND user_address = $3",
                &position_binds(key),
            )
            .await?;
        Ok(rows.pop())
    }

    #[instrument(skip(self), fields(market = %market), err)]
    async fn cursor(&self, market: &MarketKey) -> Result<Option<EventPosition>, StoreError> {
        let sql = format!(
            "SELECT block_number, log_index FROM {} WHERE loan_token = $1 AND collateral_token = $2",
            self.table("projection_cursors")
        );
        let row = sqlx::query(&sql)
            .bind(market.loan_token.to_string())
            .bind(market.collateral_token.to_string())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_cursor", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let block: i64 = row.try_get("block_number").map_err(corrupt("block_number"))?;
        let log: i64 = row.try_get("log_index").map_err(corrupt("log_index"))?;
        Ok(Some(EventPosition::new(to_u64(block, "block_number")?, to_u64(log, "log_index")?)))
    }

    #[instrument(
        skip(self, write),
        fields(market = %write.market, table = write.row.as_ref().map(LedgerRow::table), cursor = ?write.cursor),
        err
    )]
    async fn commit(&self, write: LedgerWrite) -> Result<(), StoreError> {
        if write.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        match &write.row {
            Some(LedgerRow::Market(m)) => {
                // First write wins, even against a concurrent writer.
                let sql = format!(
                    "INSERT INTO {} (loan_token, collateral_token, interest_rate, ltv) \
                     VALUES ($1, $2, $3::numeric, $4::numeric) \
                     ON CONFLICT (loan_token, collateral_token) DO NOTHING",
                    self.table("markets")
                );
                sqlx::query(&sql)
                    .bind(m.loan_token.to_string())
                    .bind(m.collateral_token.to_string())
                    .bind(m.interest_rate.to_string())
                    .bind(m.ltv.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("upsert_market", e))?;
            }
            Some(LedgerRow::Lend(p)) => {
                let sql = format!(
                    "INSERT INTO {} (loan_token, collateral_token, user_address, amount, shares) \
                     VALUES ($1, $2, $3, $4::numeric, $5::numeric) \
                     ON CONFLICT (loan_token, collateral_token, user_address) \
                     DO UPDATE SET amount = EXCLUDED.amount, shares = EXCLUDED.shares, updated_at = NOW()",
                    self.table("lend_positions")
                );
                sqlx::query(&sql)
                    .bind(p.loan_token.to_string())
                    .bind(p.collateral_token.to_string())
                    .bind(p.user.to_string())
                    .bind(p.amount.to_string())
                    .bind(p.shares.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("upsert_lend_position", e))?;
            }
            Some(LedgerRow::Borrow(p)) => {
                let sql = format!(
                    "INSERT INTO {} (loan_token, collateral_token, user_address, amount, shares, collateral_amount) \
                     VALUES ($1, $2, $3, $4::numeric, $5::numeric, $6::numeric) \
                     ON CONFLICT (loan_token, collateral_token, user_address) \
                     DO UPDATE SET amount = EXCLUDED.amount, shares = EXCLUDED.shares, \
                     collateral_amount = EXCLUDED.collateral_amount, updated_at = NOW()",
                    self.table("borrow_positions")
                );
                sqlx::query(&sql)
                    .bind(p.loan_token.to_string())
                    .bind(p.collateral_token.to_string())
                    .bind(p.user.to_string())
                    .bind(p.amount.to_string())
                    .bind(p.shares.to_string())
                    .bind(p.collateral_amount.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("upsert_borrow_position", e))?;
            }
            None => {}
        }

        if let Some(position) = write.cursor {
            let sql = format!(
                "INSERT INTO {} (loan_token, collateral_token, block_number, log_index) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (loan_token, collateral_token) \
                 DO UPDATE SET block_number = EXCLUDED.block_number, log_index = EXCLUDED.log_index, \
                 updated_at = NOW()",
                self.table("projection_cursors")
            );
            sqlx::query(&sql)
                .bind(write.market.loan_token.to_string())
                .bind(write.market.collateral_token.to_string())
                .bind(to_i64(position.block_number, "block_number")?)
                .bind(to_i64(position.log_index, "log_index")?)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_cursor", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), err)]
    async fn list_markets(&self) -> Result<Vec<Market>, StoreError> {
        let sql = format!(
            "SELECT loan_token, collateral_token, interest_rate::text AS interest_rate, ltv::text AS ltv \
             FROM {} ORDER BY loan_token, collateral_token",
            self.table("markets")
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_markets", e))?;
        rows.iter().map(market_from_row).collect()
    }

    #[instrument(skip(self), fields(user = %user), err)]
    async fn list_lend_positions(&self, user: &Address) -> Result<Vec<LendPosition>, StoreError> {
        self.fetch_lend("user_address = $1", &[user.to_string()]).await
    }

    #[instrument(skip(self), fields(user = %user), err)]
    async fn list_borrow_positions(&self, user: &Address) -> Result<Vec<BorrowPosition>, StoreError> {
        self.fetch_borrow("user_address = $1", &[user.to_string()]).await
    }

    #[instrument(skip(self), fields(market = %market), err)]
    async fn list_market_positions(&self, market: &MarketKey) -> Result<MarketPositions, StoreError> {
        let filter = "loan_token = $1 AND collateral_token = $2";
        let binds = [market.loan_token.to_string(), market.collateral_token.to_string()];
        Ok(MarketPositions {
            lend: self.fetch_lend(filter, &binds).await?,
            borrow: self.fetch_borrow(filter, &binds).await?,
        })
    }

    #[instrument(skip(self), err)]
    async fn clear(&self) -> Result<(), StoreError> {
        let sql = format!(
            "TRUNCATE {}, {}, {}, {}",
            self.table("markets"),
            self.table("lend_positions"),
            self.table("borrow_positions"),
            self.table("projection_cursors")
        );
        sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear", e))?;
        Ok(())
    }
}

fn schema_statements(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".markets (
                loan_token TEXT NOT NULL,
                collateral_token TEXT NOT NULL,
                interest_rate NUMERIC NOT NULL CHECK (interest_rate >= 0),
                ltv NUMERIC NOT NULL CHECK (ltv >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (loan_token, collateral_token)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".lend_positions (
                loan_token TEXT NOT NULL,
                collateral_token TEXT NOT NULL,
                user_address TEXT NOT NULL,
                amount NUMERIC NOT NULL CHECK (amount >= 0),
                shares NUMERIC NOT NULL CHECK (shares >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (loan_token, collateral_token, user_address)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".borrow_positions (
                loan_token TEXT NOT NULL,
                collateral_token TEXT NOT NULL,
                user_address TEXT NOT NULL,
                amount NUMERIC NOT NULL CHECK (amount >= 0),
                shares NUMERIC NOT NULL CHECK (shares >= 0),
                collateral_amount NUMERIC NOT NULL CHECK (collateral_amount >= 0),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (loan_token, collateral_token, user_address)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS \"{schema}\".projection_cursors (
                loan_token TEXT NOT NULL,
                collateral_token TEXT NOT NULL,
                block_number BIGINT NOT NULL,
                log_index BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (loan_token, collateral_token)
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS lend_positions_user_idx ON \"{schema}\".lend_positions (user_address)"),
        format!("CREATE INDEX IF NOT EXISTS borrow_positions_user_idx ON \"{schema}\".borrow_positions (user_address)"),
    ]
}

/// Schema names are interpolated into SQL, so only plain identifiers pass.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn position_binds(key: &PositionKey) -> [String; 3] {
    [
        key.market.loan_token.to_string(),
        key.market.collateral_token.to_string(),
        key.user.to_string(),
    ]
}

fn corrupt(column: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| StoreError::Corrupt(format!("failed to read {column}: {e}"))
}

fn address(row: &PgRow, column: &'static str) -> Result<Address, StoreError> {
    let raw: String = row.try_get(column).map_err(corrupt(column))?;
    raw.parse::<Address>()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn amount(row: &PgRow, column: &'static str) -> Result<Amount, StoreError> {
    let raw: String = row.try_get(column).map_err(corrupt(column))?;
    Amount::from_dec_str(&raw).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn market_from_row(row: &PgRow) -> Result<Market, StoreError> {
    Ok(Market {
        loan_token: address(row, "loan_token")?,
        collateral_token: address(row, "collateral_token")?,
        interest_rate: amount(row, "interest_rate")?,
        ltv: amount(row, "ltv")?,
    })
}

fn lend_from_row(row: &PgRow) -> Result<LendPosition, StoreError> {
    Ok(LendPosition {
        loan_token: address(row, "loan_token")?,
        collateral_token: address(row, "collateral_token")?,
        user: address(row, "user_address")?,
        amount: amount(row, "amount")?,
        shares: amount(row, "shares")?,
    })
}

fn borrow_from_row(row: &PgRow) -> Result<BorrowPosition, StoreError> {
    Ok(BorrowPosition {
        loan_token: address(row, "loan_token")?,
        collateral_token: address(row, "collateral_token")?,
        user: address(row, "user_address")?,
        amount: amount(row, "amount")?,
        shares: amount(row, "shares")?,
        collateral_amount: amount(row, "collateral_amount")?,
    })
}

fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} {value} exceeds BIGINT")))
}

fn to_u64(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // connection exception, insufficient resources, serialization
                // failure, deadlock, admin shutdown
                Some(code)
                    if code.starts_with("08")
                        || code.starts_with("53")
                        || matches!(code, "40001" | "40P01" | "57P01") =>
                {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Corrupt(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(format!("{} in {}", err, operation)),
        _ => StoreError::Corrupt(format!("sqlx error in {}: {}", operation, err)),
    }
}
