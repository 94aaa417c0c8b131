//! Authoritative item state for one analysis session, plus the pieces that
//! hang off it: status classification, cache persistence, parameter
//! overrides, and the ordered view the presentation layer reads.

pub mod cache;
pub mod error;
pub mod params;
pub mod projection;
pub mod session_key;
pub mod status;
pub mod store;

pub use cache::{CacheEnvelope, CacheLookup, CacheManager, CACHE_FORMAT_VERSION, DEFAULT_STALENESS};
pub use error::{CoreError, CoreResult};
pub use params::{
    params_to_value, ParamMap, ParameterFile, ParameterOverrideManager, ParameterSet,
    RegenerationPlan,
};
pub use projection::{project, GridPosition, ProjectedView, ViewFilters, ViewState};
pub use session_key::SessionKey;
pub use status::{classify, ItemStatus, LOW_DATA_THRESHOLD};
pub use store::{AnalysisSession, Applied, BatchProgress, ItemRecord, ItemStateStore, MergeOutcome};
