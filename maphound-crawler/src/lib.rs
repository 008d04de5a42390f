pub mod checkpoint;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod grid;
pub mod outcome;
pub mod proxy;
pub mod quota;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use crawler::{CrawlOptions, Crawler, ProgressCallback, ResultCallback};
pub use error::{CrawlError, Result};
pub use extract::{HtmlCardExtractor, ListingExtractor};
pub use fetch::{FetchedPage, Fetcher, ProxiedFetcher};
pub use grid::{BoundingBox, GridPlanner, Probe};
pub use outcome::{HostileKind, Outcome};
pub use proxy::{ApiProxySupplier, PoolConfig, ProxyEndpoint, ProxyPool, ProxySupplier, ProxyTier};
pub use quota::{Gate, PlatformLimits, QuotaGuard};
