pub mod api_keys;
pub mod background;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod impressions;
pub mod ingest;
pub mod metrics;
pub mod secret;
pub mod sessions;

pub use api_keys::{ApiKeyService, IssueKeyRequest, IssuedKey, RotatedKey, UsageReport};
pub use background::{BackgroundConfig, BackgroundHandle, BackgroundWorkers, UsageEvent};
pub use dispatch::{DispatcherConfig, FeedbackAck, RecommendationDispatcher};
pub use error::GatewayError;
pub use gate::{QuotaGate, RateLimitAdvisory, ResourceDescriptor};
pub use gateway::{Gateway, GatewayBuilder};
pub use impressions::ImpressionBuffer;
pub use ingest::{BatchOutcome, ImpressionReport, InteractionIngestor};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use sessions::SessionManager;
