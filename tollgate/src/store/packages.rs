use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{fmt_ts, Store};
use crate::error::GatewayError;
use crate::models::{PackageStatus, UserPackage};
use crate::money;

pub(crate) fn package_from_row(row: &Row<'_>) -> rusqlite::Result<UserPackage> {
    let user_id: String = row.get("user_id")?;
    let status: String = row.get("status")?;
    let start: String = row.get("start_date")?;
    let end: String = row.get("end_date")?;
    Ok(UserPackage {
        id: row.get("id")?,
        user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
        package_name: row.get("package_name")?,
        package_price: money::from_nanos(row.get("package_price_nanos")?),
        duration_days: row.get("duration_days")?,
        daily_limit: money::from_nanos(row.get("daily_limit_nanos")?),
        start_date: start.parse().unwrap_or_default(),
        end_date: end.parse().unwrap_or_default(),
        status: PackageStatus::parse(&status).unwrap_or(PackageStatus::Expired),
    })
}

const PACKAGE_COLS: &str = "id, user_id, package_name, package_price_nanos, duration_days, \
                            daily_limit_nanos, start_date, end_date, status";

impl Store {
    /// Attach a package covering `[start_date, start_date + duration_days)`
    /// inclusive of both calendar endpoints.
    pub fn create_package(
        &self,
        user_id: Uuid,
        package_name: &str,
        package_price: Decimal,
        duration_days: i32,
        daily_limit: Decimal,
        start_date: NaiveDate,
    ) -> Result<UserPackage, GatewayError> {
        let end_date = start_date + chrono::Duration::days(i64::from(duration_days) - 1);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO user_packages (user_id, package_name, package_price_nanos,
                                        duration_days, daily_limit_nanos, start_date,
                                        end_date, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                user_id.to_string(),
                package_name,
                money::to_nanos(package_price),
                duration_days,
                money::to_nanos(daily_limit),
                start_date.to_string(),
                end_date.to_string(),
                fmt_ts(Utc::now()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let package = conn.query_row(
            &format!("SELECT {PACKAGE_COLS} FROM user_packages WHERE id = ?1"),
            params![id],
            package_from_row,
        )?;
        Ok(package)
    }

    /// The active package whose date range covers `today`, earliest end date
    /// first so the one closest to expiry is drained before later ones.
    pub fn active_package_for(
        &self,
        user_id: Uuid,
        today: NaiveDate,
    ) -> Result<Option<UserPackage>, GatewayError> {
        let conn = self.conn();
        let package = conn
            .query_row(
                &format!(
                    "SELECT {PACKAGE_COLS} FROM user_packages
                     WHERE user_id = ?1 AND status = 'active'
                       AND start_date <= ?2 AND end_date >= ?2
                     ORDER BY end_date ASC LIMIT 1"
                ),
                params![user_id.to_string(), today.to_string()],
                package_from_row,
            )
            .optional()?;
        Ok(package)
    }

    pub fn has_active_package(
        &self,
        user_id: Uuid,
        today: NaiveDate,
    ) -> Result<bool, GatewayError> {
        Ok(self.active_package_for(user_id, today)?.is_some())
    }

    pub fn list_packages_for_user(&self, user_id: Uuid) -> Result<Vec<UserPackage>, GatewayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PACKAGE_COLS} FROM user_packages WHERE user_id = ?1 ORDER BY end_date DESC"
        ))?;
        let packages = stmt
            .query_map(params![user_id.to_string()], package_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(packages)
    }

    /// Mark packages past their end date as expired; returns how many flipped.
    pub fn expire_packages(&self, today: NaiveDate) -> Result<usize, GatewayError> {
        let n = self.conn().execute(
            "UPDATE user_packages SET status = 'expired'
             WHERE status = 'active' AND end_date < ?1",
            params![today.to_string()],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(store: &Store) -> Uuid {
        store
            .create_user("p@example.com", Decimal::ZERO, None)
            .unwrap()
            .id
    }

    #[test]
    fn active_window_is_inclusive() {
        let store = Store::open_in_memory().unwrap();
        let uid = user(&store);
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let pkg = store
            .create_package(uid, "basic", Decimal::from(20), 30, "1.5".parse().unwrap(), start)
            .unwrap();
        assert_eq!(pkg.end_date, NaiveDate::from_ymd_opt(2026, 3, 30).unwrap());

        assert!(store.has_active_package(uid, start).unwrap());
        assert!(store.has_active_package(uid, pkg.end_date).unwrap());
        assert!(!store
            .has_active_package(uid, pkg.end_date + chrono::Duration::days(1))
            .unwrap());
        assert!(!store
            .has_active_package(uid, start - chrono::Duration::days(1))
            .unwrap());
    }

    #[test]
    fn earliest_end_date_wins() {
        let store = Store::open_in_memory().unwrap();
        let uid = user(&store);
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        store
            .create_package(uid, "long", Decimal::ZERO, 60, Decimal::ONE, start)
            .unwrap();
        let short = store
            .create_package(uid, "short", Decimal::ZERO, 7, Decimal::ONE, start)
            .unwrap();

        let active = store.active_package_for(uid, start).unwrap().unwrap();
        assert_eq!(active.id, short.id);
    }

    #[test]
    fn expirer_flips_only_past_packages() {
        let store = Store::open_in_memory().unwrap();
        let uid = user(&store);
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        store
            .create_package(uid, "old", Decimal::ZERO, 7, Decimal::ONE, start)
            .unwrap();
        store
            .create_package(uid, "current", Decimal::ZERO, 60, Decimal::ONE, start)
            .unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 3, 20).unwrap();
        assert_eq!(store.expire_packages(today).unwrap(), 1);
        let remaining = store.active_package_for(uid, today).unwrap().unwrap();
        assert_eq!(remaining.package_name, "current");
        // Second run is a no-op.
        assert_eq!(store.expire_packages(today).unwrap(), 0);
    }
}
