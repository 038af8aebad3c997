//! PostgreSQL-backed [`RecordStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mf_core::{
    AttemptStatus, CompletionStatus, FailedAttempt, FundamentalsRecord, Period, PeriodCompletion,
    PeriodFilter, PeriodSummary, RecordKey,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::store::{RecordStore, StoreError, StoreResult, UpsertOutcome};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const RECORD_COLUMNS: &str = "symbol, company_name, sector, year, month, ebit, enterprise_value, \
     tangible_capital, earnings_yield, return_on_capital, market_cap, current_price, data_source, \
     fetched_at, updated_at";

const FAILED_COLUMNS: &str = "symbol, year, month, error_message, retry_count, max_retries, status, \
     first_attempt, last_attempt, next_retry, completed_at";

const COMPLETION_COLUMNS: &str = "year, month, total_symbols, successful_fetches, pending_retries, \
     permanently_failed, completion_percentage, status, started_at, completed_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn month_to_db(month: Option<u32>) -> Option<i16> {
    month.map(|m| m as i16)
}

fn period_from_row(row: &PgRow) -> StoreResult<Period> {
    let year: i32 = row.try_get("year")?;
    let month: Option<i16> = row.try_get("month")?;
    let month = match month {
        Some(m) if (1..=12).contains(&m) => Some(m as u32),
        Some(m) => return Err(StoreError::Corrupt(format!("month {m} out of range"))),
        None => None,
    };
    Ok(Period { year, month })
}

fn record_from_row(row: &PgRow) -> StoreResult<FundamentalsRecord> {
    Ok(FundamentalsRecord {
        symbol: row.try_get("symbol")?,
        period: period_from_row(row)?,
        company_name: row.try_get("company_name")?,
        sector: row.try_get("sector")?,
        ebit: row.try_get("ebit")?,
        enterprise_value: row.try_get("enterprise_value")?,
        tangible_capital: row.try_get("tangible_capital")?,
        earnings_yield: row.try_get("earnings_yield")?,
        return_on_capital: row.try_get("return_on_capital")?,
        market_cap: row.try_get("market_cap")?,
        current_price: row.try_get("current_price")?,
        data_source: row.try_get("data_source")?,
        fetched_at: row.try_get("fetched_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn failed_from_row(row: &PgRow) -> StoreResult<FailedAttempt> {
    let status: String = row.try_get("status")?;
    let status = AttemptStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown attempt status {status:?}")))?;
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    Ok(FailedAttempt {
        key: RecordKey::new(row.try_get::<String, _>("symbol")?, period_from_row(row)?),
        error_message: row.try_get("error_message")?,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        status,
        first_attempt: row.try_get("first_attempt")?,
        last_attempt: row.try_get("last_attempt")?,
        next_retry: row.try_get("next_retry")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn completion_from_row(row: &PgRow) -> StoreResult<PeriodCompletion> {
    let status: String = row.try_get("status")?;
    let status = CompletionStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown completion status {status:?}")))?;
    let count = |name: &str| -> StoreResult<u64> { Ok(row.try_get::<i64, _>(name)?.max(0) as u64) };
    Ok(PeriodCompletion {
        period: period_from_row(row)?,
        total_symbols: count("total_symbols")?,
        successful_fetches: count("successful_fetches")?,
        pending_retries: count("pending_retries")?,
        permanently_failed: count("permanently_failed")?,
        completion_percentage: row.try_get("completion_percentage")?,
        status,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert_record(&self, record: &FundamentalsRecord) -> StoreResult<UpsertOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO stock_data (
                symbol, company_name, sector, year, month, ebit, enterprise_value,
                tangible_capital, earnings_yield, return_on_capital, market_cap,
                current_price, data_source, fetched_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (symbol, year, (COALESCE(month, 0))) DO UPDATE
               SET company_name      = EXCLUDED.company_name,
                   sector            = EXCLUDED.sector,
                   ebit              = EXCLUDED.ebit,
                   enterprise_value  = EXCLUDED.enterprise_value,
                   tangible_capital  = EXCLUDED.tangible_capital,
                   earnings_yield    = EXCLUDED.earnings_yield,
                   return_on_capital = EXCLUDED.return_on_capital,
                   market_cap        = EXCLUDED.market_cap,
                   current_price     = EXCLUDED.current_price,
                   data_source       = EXCLUDED.data_source,
                   updated_at        = EXCLUDED.updated_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.symbol)
        .bind(&record.company_name)
        .bind(&record.sector)
        .bind(record.period.year)
        .bind(month_to_db(record.period.month))
        .bind(record.ebit)
        .bind(record.enterprise_value)
        .bind(record.tangible_capital)
        .bind(record.earnings_yield)
        .bind(record.return_on_capital)
        .bind(record.market_cap)
        .bind(record.current_price)
        .bind(&record.data_source)
        .bind(record.fetched_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get_record(&self, key: &RecordKey) -> StoreResult<Option<FundamentalsRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stock_data \
              WHERE symbol = $1 AND year = $2 AND COALESCE(month, 0) = COALESCE($3, 0)"
        );
        let row = sqlx::query(&sql)
            .bind(&key.symbol)
            .bind(key.period.year)
            .bind(month_to_db(key.period.month))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn has_record_for_year(&self, symbol: &str, year: i32) -> StoreResult<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM stock_data WHERE symbol = $1 AND year = $2) AS found")
            .bind(symbol)
            .bind(year)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("found")?)
    }

    async fn records_for(&self, filter: PeriodFilter) -> StoreResult<Vec<FundamentalsRecord>> {
        let rows = match filter {
            PeriodFilter::Year(year) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM stock_data WHERE year = $1 \
                      ORDER BY symbol, COALESCE(month, 0)"
                );
                sqlx::query(&sql).bind(year).fetch_all(&self.pool).await?
            }
            PeriodFilter::Exact(period) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM stock_data \
                      WHERE year = $1 AND COALESCE(month, 0) = COALESCE($2, 0) ORDER BY symbol"
                );
                sqlx::query(&sql)
                    .bind(period.year)
                    .bind(month_to_db(period.month))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    async fn count_records(&self, filter: PeriodFilter) -> StoreResult<u64> {
        let row = match filter {
            PeriodFilter::Year(year) => {
                sqlx::query("SELECT COUNT(*) AS n FROM stock_data WHERE year = $1")
                    .bind(year)
                    .fetch_one(&self.pool)
                    .await?
            }
            PeriodFilter::Exact(period) => {
                sqlx::query(
                    "SELECT COUNT(*) AS n FROM stock_data \
                      WHERE year = $1 AND COALESCE(month, 0) = COALESCE($2, 0)",
                )
                .bind(period.year)
                .bind(month_to_db(period.month))
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
    }

    async fn available_periods(&self) -> StoreResult<Vec<PeriodSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT year, month, COUNT(*) AS stock_count, MAX(updated_at) AS last_updated
              FROM stock_data
             GROUP BY year, month
             ORDER BY year DESC, COALESCE(month, 0) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PeriodSummary {
                    period: period_from_row(row)?,
                    stock_count: row.try_get::<i64, _>("stock_count")?.max(0) as u64,
                    last_updated: row.try_get::<Option<DateTime<Utc>>, _>("last_updated")?,
                })
            })
            .collect()
    }

    async fn get_failed_attempt(&self, key: &RecordKey) -> StoreResult<Option<FailedAttempt>> {
        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM failed_stocks \
              WHERE symbol = $1 AND year = $2 AND COALESCE(month, 0) = COALESCE($3, 0)"
        );
        let row = sqlx::query(&sql)
            .bind(&key.symbol)
            .bind(key.period.year)
            .bind(month_to_db(key.period.month))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(failed_from_row).transpose()
    }

    async fn put_failed_attempt(&self, attempt: &FailedAttempt) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_stocks (
                symbol, year, month, error_message, retry_count, max_retries, status,
                first_attempt, last_attempt, next_retry, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (symbol, year, (COALESCE(month, 0))) DO UPDATE
               SET error_message = EXCLUDED.error_message,
                   retry_count   = EXCLUDED.retry_count,
                   max_retries   = EXCLUDED.max_retries,
                   status        = EXCLUDED.status,
                   last_attempt  = EXCLUDED.last_attempt,
                   next_retry    = EXCLUDED.next_retry,
                   completed_at  = EXCLUDED.completed_at
            "#,
        )
        .bind(&attempt.key.symbol)
        .bind(attempt.key.period.year)
        .bind(month_to_db(attempt.key.period.month))
        .bind(truncate(&attempt.error_message, 1000))
        .bind(attempt.retry_count as i32)
        .bind(attempt.max_retries as i32)
        .bind(attempt.status.as_str())
        .bind(attempt.first_attempt)
        .bind(attempt.last_attempt)
        .bind(attempt.next_retry)
        .bind(attempt.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_failed_attempts(&self, now: DateTime<Utc>) -> StoreResult<Vec<FailedAttempt>> {
        let sql = format!(
            "SELECT {FAILED_COLUMNS} FROM failed_stocks \
              WHERE status = 'pending' AND next_retry <= $1 \
              ORDER BY next_retry ASC, symbol ASC, year DESC, COALESCE(month, 0)"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(failed_from_row).collect()
    }

    async fn failed_attempts_with_status(&self, status: AttemptStatus) -> StoreResult<Vec<FailedAttempt>> {
        let sql = format!("SELECT {FAILED_COLUMNS} FROM failed_stocks WHERE status = $1 ORDER BY symbol, year");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(failed_from_row).collect()
    }

    async fn count_failed_attempts(&self, period: Period, statuses: &[AttemptStatus]) -> StoreResult<u64> {
        let statuses = statuses.iter().map(|s| s.as_str().to_string()).collect::<Vec<_>>();
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM failed_stocks \
              WHERE year = $1 AND COALESCE(month, 0) = COALESCE($2, 0) AND status = ANY($3)",
        )
        .bind(period.year)
        .bind(month_to_db(period.month))
        .bind(&statuses)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
    }

    async fn get_period_completion(&self, period: Period) -> StoreResult<Option<PeriodCompletion>> {
        let sql = format!(
            "SELECT {COMPLETION_COLUMNS} FROM period_completion \
              WHERE year = $1 AND COALESCE(month, 0) = COALESCE($2, 0)"
        );
        let row = sqlx::query(&sql)
            .bind(period.year)
            .bind(month_to_db(period.month))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(completion_from_row).transpose()
    }

    async fn put_period_completion(&self, completion: &PeriodCompletion) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO period_completion (
                year, month, total_symbols, successful_fetches, pending_retries,
                permanently_failed, completion_percentage, status, started_at,
                completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (year, (COALESCE(month, 0))) DO UPDATE
               SET total_symbols         = EXCLUDED.total_symbols,
                   successful_fetches    = EXCLUDED.successful_fetches,
                   pending_retries       = EXCLUDED.pending_retries,
                   permanently_failed    = EXCLUDED.permanently_failed,
                   completion_percentage = EXCLUDED.completion_percentage,
                   status                = EXCLUDED.status,
                   started_at            = EXCLUDED.started_at,
                   completed_at          = EXCLUDED.completed_at,
                   updated_at            = EXCLUDED.updated_at
            "#,
        )
        .bind(completion.period.year)
        .bind(month_to_db(completion.period.month))
        .bind(completion.total_symbols as i64)
        .bind(completion.successful_fetches as i64)
        .bind(completion.pending_retries as i64)
        .bind(completion.permanently_failed as i64)
        .bind(completion.completion_percentage)
        .bind(completion.status.as_str())
        .bind(completion.started_at)
        .bind(completion.completed_at)
        .bind(completion.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn period_completions(&self) -> StoreResult<Vec<PeriodCompletion>> {
        let sql = format!(
            "SELECT {COMPLETION_COLUMNS} FROM period_completion ORDER BY year DESC, COALESCE(month, 0) DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(completion_from_row).collect()
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
