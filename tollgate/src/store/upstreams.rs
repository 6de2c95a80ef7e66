use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{fmt_ts, opt_parse_ts, Store};
use crate::error::GatewayError;
use crate::models::{Upstream, UpstreamStatus};

fn upstream_from_row(row: &Row<'_>) -> rusqlite::Result<Upstream> {
    let status: String = row.get("status")?;
    Ok(Upstream {
        id: row.get("id")?,
        name: row.get("name")?,
        base_url: row.get("base_url")?,
        api_key: row.get("api_key")?,
        priority: row.get("priority")?,
        status: UpstreamStatus::parse(&status).unwrap_or(UpstreamStatus::Disabled),
        weight: row.get("weight")?,
        max_retries: row.get::<_, i64>("max_retries")? as u32,
        timeout_seconds: row.get::<_, i64>("timeout_seconds")? as u64,
        health_check_path: row.get("health_check_path")?,
        last_checked_at: opt_parse_ts(row.get("last_checked_at")?),
    })
}

const UPSTREAM_COLS: &str = "id, name, base_url, api_key, priority, status, weight, \
                             max_retries, timeout_seconds, health_check_path, last_checked_at";

/// Fields accepted when creating or updating an upstream.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpstreamSpec {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

fn default_priority() -> i32 {
    100
}
fn default_weight() -> i32 {
    1
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_seconds() -> u64 {
    120
}
fn default_health_check_path() -> String {
    "/v1/chat/completions".to_string()
}

impl Store {
    pub fn create_upstream(&self, spec: &UpstreamSpec) -> Result<Upstream, GatewayError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO upstreams (name, base_url, api_key, priority, weight, max_retries,
                                    timeout_seconds, health_check_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                spec.name,
                spec.base_url.trim_end_matches('/'),
                spec.api_key,
                spec.priority,
                spec.weight,
                spec.max_retries,
                spec.timeout_seconds,
                spec.health_check_path,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let upstream = conn.query_row(
            &format!("SELECT {UPSTREAM_COLS} FROM upstreams WHERE id = ?1"),
            params![id],
            upstream_from_row,
        )?;
        Ok(upstream)
    }

    pub fn get_upstream(&self, id: i64) -> Result<Option<Upstream>, GatewayError> {
        let conn = self.conn();
        let upstream = conn
            .query_row(
                &format!("SELECT {UPSTREAM_COLS} FROM upstreams WHERE id = ?1"),
                params![id],
                upstream_from_row,
            )
            .optional()?;
        Ok(upstream)
    }

    /// Upstreams in the given statuses, ordered by priority then id.
    pub fn list_upstreams_for(
        &self,
        statuses: &[UpstreamStatus],
    ) -> Result<Vec<Upstream>, GatewayError> {
        // Status values are a fixed vocabulary, safe to inline.
        let set = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UPSTREAM_COLS} FROM upstreams
             WHERE status IN ({set}) ORDER BY priority ASC, id ASC"
        ))?;
        let upstreams = stmt
            .query_map([], upstream_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(upstreams)
    }

    /// Every upstream, for the admin view.
    pub fn list_all_upstreams(&self) -> Result<Vec<Upstream>, GatewayError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {UPSTREAM_COLS} FROM upstreams ORDER BY priority ASC, id ASC"
        ))?;
        let upstreams = stmt
            .query_map([], upstream_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(upstreams)
    }

    pub fn update_upstream(&self, id: i64, spec: &UpstreamSpec) -> Result<bool, GatewayError> {
        let n = self.conn().execute(
            "UPDATE upstreams SET name = ?1, base_url = ?2, api_key = ?3, priority = ?4,
                                  weight = ?5, max_retries = ?6, timeout_seconds = ?7,
                                  health_check_path = ?8
             WHERE id = ?9",
            params![
                spec.name,
                spec.base_url.trim_end_matches('/'),
                spec.api_key,
                spec.priority,
                spec.weight,
                spec.max_retries,
                spec.timeout_seconds,
                spec.health_check_path,
                id,
            ],
        )?;
        Ok(n > 0)
    }

    pub fn update_upstream_status(
        &self,
        id: i64,
        status: UpstreamStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.conn().execute(
            "UPDATE upstreams SET status = ?1, last_checked_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(checked_at), id],
        )?;
        Ok(())
    }

    pub fn touch_upstream_checked(
        &self,
        id: i64,
        checked_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.conn().execute(
            "UPDATE upstreams SET last_checked_at = ?1 WHERE id = ?2",
            params![fmt_ts(checked_at), id],
        )?;
        Ok(())
    }

    pub fn delete_upstream(&self, id: i64) -> Result<bool, GatewayError> {
        let n = self
            .conn()
            .execute("DELETE FROM upstreams WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, priority: i32) -> UpstreamSpec {
        UpstreamSpec {
            name: name.to_string(),
            base_url: format!("https://{name}.example/"),
            api_key: "upstream-secret".to_string(),
            priority,
            weight: 1,
            max_retries: 2,
            timeout_seconds: 120,
            health_check_path: "/v1/chat/completions".to_string(),
        }
    }

    #[test]
    fn listing_orders_by_priority_then_id() {
        let store = Store::open_in_memory().unwrap();
        store.create_upstream(&spec("b", 20)).unwrap();
        store.create_upstream(&spec("a", 10)).unwrap();
        store.create_upstream(&spec("c", 20)).unwrap();

        let all = store
            .list_upstreams_for(&[UpstreamStatus::Active, UpstreamStatus::Unhealthy])
            .unwrap();
        let names: Vec<_> = all.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        // Trailing slash is normalized away.
        assert_eq!(all[0].base_url, "https://a.example");
    }

    #[test]
    fn status_filter_excludes_disabled() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_upstream(&spec("a", 10)).unwrap();
        store.create_upstream(&spec("b", 20)).unwrap();
        store
            .update_upstream_status(a.id, UpstreamStatus::Disabled, Utc::now())
            .unwrap();

        let selectable = store
            .list_upstreams_for(&[UpstreamStatus::Active, UpstreamStatus::Unhealthy])
            .unwrap();
        assert_eq!(selectable.len(), 1);
        assert_eq!(selectable[0].name, "b");
        assert_eq!(store.list_all_upstreams().unwrap().len(), 2);
    }
}
