use crate::model::Ms;

pub const MAX_ENGINEERS_PER_TENANT: usize = 100_000;
pub const MAX_ASSIGNMENTS_PER_ENGINEER: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Allocation and capacity are integer percentages.
pub const MAX_PERCENT: u32 = 100;

/// 1970-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// Ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 3_650 * 86_400_000;
/// Ten years.
pub const MAX_QUERY_WINDOW_MS: Ms = 3_650 * 86_400_000;
