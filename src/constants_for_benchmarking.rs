pub const WARM_KEYS: usize = 10_000;
pub const GET_MANY: usize = 100_000;
