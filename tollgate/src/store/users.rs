use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{fmt_ts, parse_ts, Store};
use crate::error::GatewayError;
use crate::models::{User, UserStatus};
use crate::money;

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    Ok(User {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        email: row.get("email")?,
        balance: money::from_nanos(row.get("balance_nanos")?),
        status: UserStatus::parse(&status).unwrap_or(UserStatus::Suspended),
        daily_usage_limit: money::opt_from_nanos(row.get("daily_limit_nanos")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

const USER_COLS: &str =
    "id, email, balance_nanos, status, daily_limit_nanos, created_at, updated_at";

impl Store {
    pub fn create_user(
        &self,
        email: &str,
        balance: Decimal,
        daily_usage_limit: Option<Decimal>,
    ) -> Result<User, GatewayError> {
        let id = Uuid::new_v4();
        let now = fmt_ts(Utc::now());
        self.conn().execute(
            "INSERT INTO users (id, email, balance_nanos, status, daily_limit_nanos, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            params![
                id.to_string(),
                email,
                money::to_nanos(balance),
                money::opt_to_nanos(daily_usage_limit),
                now
            ],
        )?;
        self.get_user(id)?
            .ok_or_else(|| GatewayError::Storage("user vanished after insert".into()))
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>, GatewayError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>, GatewayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLS} FROM users WHERE deleted_at IS NULL ORDER BY created_at"
        ))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub fn update_user_balance(&self, id: Uuid, balance: Decimal) -> Result<(), GatewayError> {
        self.conn().execute(
            "UPDATE users SET balance_nanos = ?1, updated_at = ?2 WHERE id = ?3",
            params![money::to_nanos(balance), fmt_ts(Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    pub fn update_user_status(&self, id: Uuid, status: UserStatus) -> Result<(), GatewayError> {
        self.conn().execute(
            "UPDATE users SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    pub fn update_user_daily_limit(
        &self,
        id: Uuid,
        limit: Option<Decimal>,
    ) -> Result<(), GatewayError> {
        self.conn().execute(
            "UPDATE users SET daily_limit_nanos = ?1, updated_at = ?2 WHERE id = ?3",
            params![money::opt_to_nanos(limit), fmt_ts(Utc::now()), id.to_string()],
        )?;
        Ok(())
    }
}
