//! Sequence engine — step executor and scheduler loop.

pub mod clock;
pub mod executor;
pub mod scheduler;

use std::sync::Arc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{RenderedEmail, StepExecutor};
pub use scheduler::Scheduler;

use crate::channels::{ChannelRegistry, SessionPool};
use crate::compose::SignatureComposer;
use crate::config::EngineConfig;
use crate::governor::RateGovernor;
use crate::personalize::Personalizer;
use crate::store::Store;

/// Everything the engine needs, injected once at startup. No process-wide
/// mutables: handlers and workers share this context by `Arc`.
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub governor: Arc<RateGovernor>,
    pub channels: Arc<ChannelRegistry>,
    pub personalizer: Arc<Personalizer>,
    pub composer: Arc<SignatureComposer>,
    /// Browser session pool; absent when the network channels are disabled.
    pub sessions: Option<Arc<SessionPool>>,
}
