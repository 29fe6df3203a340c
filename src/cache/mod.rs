mod ttl;

pub use ttl::{CacheEntry, TtlCache};
