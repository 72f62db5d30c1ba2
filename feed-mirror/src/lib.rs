pub mod config;
pub mod daemon;
pub mod dedup;
pub mod media;
pub mod orchestrator;
pub mod publisher;
pub mod retry;
pub mod scanner;
pub mod shutdown;
pub mod sources;
pub mod text;
pub mod traits;
pub mod transcoder;
pub mod types;
pub mod watermark;

pub use config::Config;
pub use daemon::{MirrorDaemon, PassSummary};
pub use dedup::DedupIndex;
pub use media::{MediaOutcome, MediaPipeline};
pub use orchestrator::{SyncOrchestrator, SyncResources};
pub use publisher::{PublishClient, SkipPolicy, TargetIdentity};
pub use retry::RetryPolicy;
pub use scanner::{FeedScanner, PinnedChange, ScanResult};
pub use sources::HttpSourceFeed;
pub use text::{TextTransformer, TrackingParamCleaner};
pub use traits::{LinkSanitizer, SourceFeed, TimelinePage};
pub use transcoder::{TranscodeOp, Transcoder};
pub use types::*;
pub use watermark::WatermarkStore;
