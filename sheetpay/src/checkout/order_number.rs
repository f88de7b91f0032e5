//! Human-readable order numbers: `ORD` + UTC `yyyyMMddHHmmss` + a random 4-digit suffix.
//!
//! Unique enough for display and support lookups; the order's UUID is the real key.

use chrono::{DateTime, Utc};
use rand::Rng;

pub const ORDER_NUMBER_PREFIX: &str = "ORD";

pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(1000..=9999);
    format!("{ORDER_NUMBER_PREFIX}{}{suffix}", now.format("%Y%m%d%H%M%S"))
}
