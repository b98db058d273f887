pub mod averager;
pub mod backfill;
pub mod coingecko;
pub mod lock;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod spot;
pub mod store;
pub mod types;
