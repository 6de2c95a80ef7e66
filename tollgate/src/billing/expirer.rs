//! Hourly job flipping packages past their end date to expired.

use std::sync::Arc;
use std::time::Duration;

use crate::store::Store;
use crate::timezone;

const EXPIRE_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn run(store: Arc<Store>) {
    let mut ticker = tokio::time::interval(EXPIRE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match store.expire_packages(timezone::today()) {
            Ok(0) => {}
            Ok(n) => log::info!("[Billing] Expired {n} packages"),
            Err(e) => log::warn!("[Billing] Package expiration failed: {e}"),
        }
    }
}
