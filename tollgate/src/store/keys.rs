use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{fmt_ts, opt_parse_ts, parse_ts, Store};
use crate::error::GatewayError;
use crate::models::{ApiKey, KeyStatus, User};

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let user_id: String = row.get("user_id")?;
    let status: String = row.get("status")?;
    Ok(ApiKey {
        id: row.get("id")?,
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        key_hash: row.get("key_hash")?,
        key_prefix: row.get("key_prefix")?,
        name: row.get("name")?,
        quota_limit: row.get("quota_limit")?,
        total_usage: row.get("total_usage")?,
        status: KeyStatus::parse(&status).unwrap_or(KeyStatus::Disabled),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        last_used_at: opt_parse_ts(row.get("last_used_at")?),
    })
}

const KEY_COLS: &str = "id, user_id, key_hash, key_prefix, name, quota_limit, total_usage, \
                        status, created_at, last_used_at";

impl Store {
    pub fn create_api_key(
        &self,
        user_id: Uuid,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        quota_limit: Option<i64>,
    ) -> Result<ApiKey, GatewayError> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO api_keys (user_id, key_hash, key_prefix, name, quota_limit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id.to_string(), key_hash, key_prefix, name, quota_limit, now],
        )?;
        let id = conn.last_insert_rowid();
        let key = conn.query_row(
            &format!("SELECT {KEY_COLS} FROM api_keys WHERE id = ?1"),
            params![id],
            key_from_row,
        )?;
        Ok(key)
    }

    /// Resolve an active key by its SHA-256 hash, eager-loading the owning
    /// user. Tombstoned keys and users never match.
    pub fn find_active_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<(ApiKey, User)>, GatewayError> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT k.id, k.user_id, k.key_hash, k.key_prefix, k.name, k.quota_limit,
                        k.total_usage, k.status, k.created_at, k.last_used_at,
                        u.id, u.email, u.balance_nanos, u.status, u.daily_limit_nanos,
                        u.created_at, u.updated_at
                 FROM api_keys k
                 JOIN users u ON u.id = k.user_id
                 WHERE k.key_hash = ?1 AND k.status = 'active'
                   AND k.deleted_at IS NULL AND u.deleted_at IS NULL",
                params![key_hash],
                |row| {
                    // Positional access: the join repeats column names.
                    let key_user_id: String = row.get(1)?;
                    let key_status: String = row.get(7)?;
                    let key = ApiKey {
                        id: row.get(0)?,
                        user_id: Uuid::parse_str(&key_user_id).unwrap_or_default(),
                        key_hash: row.get(2)?,
                        key_prefix: row.get(3)?,
                        name: row.get(4)?,
                        quota_limit: row.get(5)?,
                        total_usage: row.get(6)?,
                        status: KeyStatus::parse(&key_status).unwrap_or(KeyStatus::Disabled),
                        created_at: parse_ts(&row.get::<_, String>(8)?),
                        last_used_at: opt_parse_ts(row.get(9)?),
                    };
                    let user_id: String = row.get(10)?;
                    let user_status: String = row.get(13)?;
                    let user = User {
                        id: Uuid::parse_str(&user_id).unwrap_or_default(),
                        email: row.get(11)?,
                        balance: crate::money::from_nanos(row.get(12)?),
                        status: crate::models::UserStatus::parse(&user_status)
                            .unwrap_or(crate::models::UserStatus::Suspended),
                        daily_usage_limit: crate::money::opt_from_nanos(row.get(14)?),
                        created_at: parse_ts(&row.get::<_, String>(15)?),
                        updated_at: parse_ts(&row.get::<_, String>(16)?),
                    };
                    Ok((key, user))
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_keys_for_user(&self, user_id: Uuid) -> Result<Vec<ApiKey>, GatewayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {KEY_COLS} FROM api_keys
             WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY created_at"
        ))?;
        let keys = stmt
            .query_map(params![user_id.to_string()], key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn update_key_status(&self, id: i64, status: KeyStatus) -> Result<bool, GatewayError> {
        let n = self.conn().execute(
            "UPDATE api_keys SET status = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![status.as_str(), id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_api_key(&self, id: i64) -> Result<bool, GatewayError> {
        let n = self.conn().execute(
            "UPDATE api_keys SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![fmt_ts(Utc::now()), id],
        )?;
        Ok(n > 0)
    }

    /// Guarded `last_used_at` write: only lands when the stored value is
    /// absent or older than `threshold`, so concurrent processes cannot
    /// stampede the row.
    pub fn touch_key_last_used(
        &self,
        id: i64,
        now: DateTime<Utc>,
        threshold: DateTime<Utc>,
    ) -> Result<bool, GatewayError> {
        let n = self.conn().execute(
            "UPDATE api_keys SET last_used_at = ?1
             WHERE id = ?2 AND (last_used_at IS NULL OR last_used_at < ?3)",
            params![fmt_ts(now), id, fmt_ts(threshold)],
        )?;
        Ok(n > 0)
    }
}
