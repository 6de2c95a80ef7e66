//! The billing transaction.
//!
//! Everything runs inside one SQLite transaction; any step that fails aborts
//! the whole charge (the transaction rolls back on drop). Quota and balance
//! mutations are conditional UPDATEs judged by rows-affected, so concurrent
//! requests race on the predicates instead of holding row locks: a loser sees
//! zero rows affected and either falls through (package quota) or aborts the
//! call (daily cap, balance, key quota).

use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use thiserror::Error;
use uuid::Uuid;

use super::{fmt_ts, Store};

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("daily limit exceeded")]
    DailyLimitExceeded,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("API key quota exceeded")]
    ApiKeyQuotaExceeded,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

#[derive(Debug, Clone)]
pub struct BillParams {
    pub user_id: Uuid,
    pub api_key_id: i64,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    pub cache_creation_tokens: i64,
    pub total_tokens: i64,
    pub cost_nanos: i64,
    pub latency_ms: i64,
    pub status_code: u16,
}

impl Store {
    /// Charge a completed call: package quota first, then balance, under the
    /// user's daily cap; append the usage log and advance the key's
    /// cumulative usage. Zero-cost calls skip the money arithmetic but are
    /// still logged.
    pub fn bill(&self, p: &BillParams, today: NaiveDate) -> Result<(), BillingError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if p.cost_nanos > 0 {
            deduct_cost(&tx, p, today)?;
        }

        tx.execute(
            "INSERT INTO usage_logs (request_id, user_id, api_key_id, model, input_tokens,
                                     output_tokens, cached_tokens, cache_creation_tokens,
                                     total_tokens, cost_nanos, latency_ms, status_code,
                                     created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                Uuid::new_v4().to_string(),
                p.user_id.to_string(),
                p.api_key_id,
                p.model,
                p.input_tokens,
                p.output_tokens,
                p.cached_tokens,
                p.cache_creation_tokens,
                p.total_tokens,
                p.cost_nanos,
                p.latency_ms,
                p.status_code,
                fmt_ts(Utc::now()),
            ],
        )?;

        let advanced = tx.execute(
            "UPDATE api_keys SET total_usage = total_usage + ?1
             WHERE id = ?2 AND (quota_limit IS NULL OR total_usage + ?1 <= quota_limit)",
            params![p.total_tokens, p.api_key_id],
        )?;
        if advanced == 0 {
            return Err(BillingError::ApiKeyQuotaExceeded);
        }

        tx.commit()?;
        Ok(())
    }
}

fn deduct_cost(tx: &Transaction<'_>, p: &BillParams, today: NaiveDate) -> Result<(), BillingError> {
    let uid = p.user_id.to_string();
    let date = today.to_string();
    let mut cost = p.cost_nanos;

    // Lazily materialize today's row; losers of the race hit the conflict.
    tx.execute(
        "INSERT INTO daily_usage (user_id, date, used_nanos, total_used_nanos)
         VALUES (?1, ?2, 0, 0)
         ON CONFLICT(user_id, date) DO NOTHING",
        params![uid, date],
    )?;

    // Daily total cap across all funding sources.
    let daily_limit: Option<i64> = tx
        .query_row(
            "SELECT daily_limit_nanos FROM users WHERE id = ?1",
            params![uid],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    match daily_limit {
        Some(limit) => {
            let n = tx.execute(
                "UPDATE daily_usage SET total_used_nanos = total_used_nanos + ?1
                 WHERE user_id = ?2 AND date = ?3 AND total_used_nanos + ?1 <= ?4",
                params![cost, uid, date, limit],
            )?;
            if n == 0 {
                return Err(BillingError::DailyLimitExceeded);
            }
        }
        None => {
            tx.execute(
                "UPDATE daily_usage SET total_used_nanos = total_used_nanos + ?1
                 WHERE user_id = ?2 AND date = ?3",
                params![cost, uid, date],
            )?;
        }
    }

    // Package quota before balance.
    let package: Option<(i64, i64)> = tx
        .query_row(
            "SELECT id, daily_limit_nanos FROM user_packages
             WHERE user_id = ?1 AND status = 'active'
               AND start_date <= ?2 AND end_date >= ?2
             ORDER BY end_date ASC LIMIT 1",
            params![uid, date],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((package_id, package_limit)) = package {
        tx.execute(
            "UPDATE daily_usage SET user_package_id = ?1
             WHERE user_id = ?2 AND date = ?3
               AND (user_package_id IS NULL OR user_package_id != ?1)",
            params![package_id, uid, date],
        )?;

        let used: i64 = tx.query_row(
            "SELECT used_nanos FROM daily_usage WHERE user_id = ?1 AND date = ?2",
            params![uid, date],
            |row| row.get(0),
        )?;
        let remaining = package_limit - used;

        if remaining >= cost {
            let n = tx.execute(
                "UPDATE daily_usage SET used_nanos = used_nanos + ?1
                 WHERE user_id = ?2 AND date = ?3 AND used_nanos + ?1 <= ?4",
                params![cost, uid, date, package_limit],
            )?;
            if n > 0 {
                return Ok(());
            }
            // Lost the race; fall through to the balance with the full cost.
        } else if remaining > 0 {
            let n = tx.execute(
                "UPDATE daily_usage SET used_nanos = used_nanos + ?1
                 WHERE user_id = ?2 AND date = ?3 AND used_nanos + ?1 <= ?4",
                params![remaining, uid, date, package_limit],
            )?;
            if n > 0 {
                cost -= remaining;
            }
        }
    }

    let n = tx.execute(
        "UPDATE users SET balance_nanos = balance_nanos - ?1
         WHERE id = ?2 AND balance_nanos >= ?1",
        params![cost, uid],
    )?;
    if n == 0 {
        return Err(BillingError::InsufficientBalance);
    }
    Ok(())
}
