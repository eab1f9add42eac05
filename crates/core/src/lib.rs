pub mod account;
pub mod api_key;
pub mod clock;
pub mod error;
pub mod fingerprint;
pub mod impression;
pub mod interaction;
pub mod plan;
pub mod principal;
pub mod recommend;
pub mod session;
pub mod track;
pub mod types;

pub use account::{Organization, User, UserRole, normalize_email};
pub use api_key::{
    API_KEY_PREFIX_LEN, ApiKey, ApiKeyEnvironment, ApiKeyUsageRecord, KeyWindowLimits,
    RedactedApiKey,
};
pub use clock::{Clock, IdGen, ManualClock, SequenceIdGen, SystemClock, UuidIdGen};
pub use error::{ApiError, ErrorKind};
pub use fingerprint::recommendation_fingerprint;
pub use impression::Impression;
pub use interaction::{
    ContentView, IngestEvent, Interaction, InteractionSource, InteractionType, PlayerEvent,
    SearchQuery,
};
pub use plan::{ModelTier, Plan, PlanCatalog, PlanLimits, QuotaWindow, WindowLimits};
pub use principal::{AuthMethod, Principal, scopes};
pub use recommend::{FeedbackSignal, RankedTrack, RecommendKind, RecommendRequest, RecommendationSet};
pub use session::{DeviceType, EndedBy, Session, SessionSummary};
pub use track::Track;
pub use types::{ApiKeyId, DeviceId, OrgId, RecommendationId, SessionId, TrackId, UserId};
