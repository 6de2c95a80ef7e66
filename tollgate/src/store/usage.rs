use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::{parse_ts, Store};
use crate::error::GatewayError;
use crate::models::{DailyUsage, UsageLog};
use crate::money;
use crate::timezone;

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<UsageLog> {
    let request_id: String = row.get("request_id")?;
    let user_id: String = row.get("user_id")?;
    Ok(UsageLog {
        request_id: Uuid::parse_str(&request_id).unwrap_or_default(),
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        api_key_id: row.get("api_key_id")?,
        model: row.get("model")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        cached_tokens: row.get("cached_tokens")?,
        cache_creation_tokens: row.get("cache_creation_tokens")?,
        total_tokens: row.get("total_tokens")?,
        cost: money::from_nanos(row.get("cost_nanos")?),
        latency_ms: row.get("latency_ms")?,
        status_code: row.get::<_, i64>("status_code")? as u16,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

const LOG_COLS: &str = "request_id, user_id, api_key_id, model, input_tokens, output_tokens, \
                        cached_tokens, cache_creation_tokens, total_tokens, cost_nanos, \
                        latency_ms, status_code, created_at";

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub today_cost: Decimal,
    pub month_cost: Decimal,
    pub total_cost: Decimal,
}

impl Store {
    /// Usage logs, newest first. `user_id` narrows to one user; `date` (a
    /// Shanghai calendar day) narrows to the matching UTC window so the
    /// `created_at` index stays usable.
    pub fn list_usage_logs(
        &self,
        user_id: Option<Uuid>,
        date: Option<NaiveDate>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<UsageLog>, i64), GatewayError> {
        let mut filters = vec!["1=1".to_string()];
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(uid) = user_id {
            args.push(Box::new(uid.to_string()));
            filters.push(format!("user_id = ?{}", args.len()));
        }
        if let Some(day) = date {
            let (start, end) = timezone::day_bounds_utc(day);
            args.push(Box::new(super::fmt_ts(start)));
            filters.push(format!("created_at >= ?{}", args.len()));
            args.push(Box::new(super::fmt_ts(end)));
            filters.push(format!("created_at < ?{}", args.len()));
        }
        let where_clause = filters.join(" AND ");

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM usage_logs WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        let limit = i64::from(page_size.clamp(1, 100));
        let offset = i64::from(page.max(1) - 1) * limit;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLS} FROM usage_logs WHERE {where_clause}
             ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}"
        ))?;
        let logs = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((logs, total))
    }

    /// Cost sums for today / this month / all time, computed over the
    /// Shanghai calendar.
    pub fn usage_stats(
        &self,
        user_id: Uuid,
        today: NaiveDate,
    ) -> Result<UsageStats, GatewayError> {
        let (day_start, _) = timezone::day_bounds_utc(today);
        let month_start = timezone::month_start_utc(today);
        let conn = self.conn();
        let sum = |since: Option<String>| -> Result<i64, rusqlite::Error> {
            match since {
                Some(bound) => conn.query_row(
                    "SELECT COALESCE(SUM(cost_nanos), 0) FROM usage_logs
                     WHERE user_id = ?1 AND created_at >= ?2",
                    params![user_id.to_string(), bound],
                    |row| row.get(0),
                ),
                None => conn.query_row(
                    "SELECT COALESCE(SUM(cost_nanos), 0) FROM usage_logs WHERE user_id = ?1",
                    params![user_id.to_string()],
                    |row| row.get(0),
                ),
            }
        };
        Ok(UsageStats {
            today_cost: money::from_nanos(sum(Some(super::fmt_ts(day_start)))?),
            month_cost: money::from_nanos(sum(Some(super::fmt_ts(month_start)))?),
            total_cost: money::from_nanos(sum(None)?),
        })
    }

    /// The (user, date) daily-usage row, if the user has been charged today.
    pub fn daily_usage_for(
        &self,
        user_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<DailyUsage>, GatewayError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, user_id, user_package_id, date, used_nanos, total_used_nanos
                 FROM daily_usage WHERE user_id = ?1 AND date = ?2",
                params![user_id.to_string(), date.to_string()],
                |row| {
                    let uid: String = row.get(1)?;
                    let date: String = row.get(3)?;
                    Ok(DailyUsage {
                        id: row.get(0)?,
                        user_id: Uuid::parse_str(&uid).unwrap_or_default(),
                        user_package_id: row.get(2)?,
                        date: date.parse().unwrap_or_default(),
                        used_amount: money::from_nanos(row.get(4)?),
                        total_used_amount: money::from_nanos(row.get(5)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
