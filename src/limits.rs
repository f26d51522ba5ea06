use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_ASSIGNMENTS_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_TENANT: usize = 1_000_000;

/// Intervals configured on a single weekday of the fixed schedule.
pub const MAX_INTERVALS_PER_DAY: usize = 48;

pub const MAX_SERVICE_KEYS: usize = 32;
pub const MAX_SERVICE_KEY_LEN: usize = 64;
pub const MAX_CLIENT_REF_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;

/// External busy blocks retained per tenant by the push-fed feed.
pub const MAX_EXTERNAL_BLOCKS: usize = 100_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
