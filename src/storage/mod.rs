//! Persistence boundaries: the low-latency cache/stream sink and the
//! analytical store liveness/bulk-insert surface.

pub mod clickhouse;
pub mod redis_stream;

pub use clickhouse::AnalyticsSink;
pub use redis_stream::StreamSink;
