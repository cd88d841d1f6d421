use crate::model::{DAY_MS, Ms};

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REQUESTER_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_CAPACITY: u32 = 1024;
pub const MAX_OPERATING_WINDOWS: usize = 64;
pub const MAX_ACTIVE_BOOKINGS_PER_RESOURCE: usize = 100_000;
pub const MAX_WAITLIST_ENTRIES: usize = 100_000;
/// Widest availability window a single query may ask for.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
