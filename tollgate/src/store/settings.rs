use chrono::Utc;
use rusqlite::params;

use super::{fmt_ts, parse_ts, Store};
use crate::error::GatewayError;
use crate::models::SystemSettings;

impl Store {
    /// Make sure the singleton settings row exists.
    pub fn ensure_settings(&self) -> Result<(), GatewayError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO system_settings (id, updated_at) VALUES (1, ?1)",
            params![fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_settings(&self) -> Result<SystemSettings, GatewayError> {
        self.ensure_settings()?;
        let conn = self.conn();
        let settings = conn.query_row(
            "SELECT announcement, registration_enabled, rate_limit_enabled, rate_limit_rpm,
                    rate_limit_burst, openai_api_key, openai_base_url, updated_at
             FROM system_settings WHERE id = 1",
            [],
            |row| {
                Ok(SystemSettings {
                    announcement: row.get(0)?,
                    registration_enabled: row.get::<_, i64>(1)? != 0,
                    rate_limit_enabled: row.get::<_, i64>(2)? != 0,
                    rate_limit_rpm: row.get::<_, i64>(3)? as u32,
                    rate_limit_burst: row.get::<_, i64>(4)? as u32,
                    openai_api_key: row.get(5)?,
                    openai_base_url: row.get(6)?,
                    updated_at: parse_ts(&row.get::<_, String>(7)?),
                })
            },
        )?;
        Ok(settings)
    }

    pub fn update_settings(&self, settings: &SystemSettings) -> Result<(), GatewayError> {
        self.ensure_settings()?;
        self.conn().execute(
            "UPDATE system_settings
             SET announcement = ?1, registration_enabled = ?2, rate_limit_enabled = ?3,
                 rate_limit_rpm = ?4, rate_limit_burst = ?5, openai_api_key = ?6,
                 openai_base_url = ?7, updated_at = ?8
             WHERE id = 1",
            params![
                settings.announcement,
                settings.registration_enabled as i64,
                settings.rate_limit_enabled as i64,
                i64::from(settings.rate_limit_rpm),
                i64::from(settings.rate_limit_burst),
                settings.openai_api_key,
                settings.openai_base_url,
                fmt_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }
}
