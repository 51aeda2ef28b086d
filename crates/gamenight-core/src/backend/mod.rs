//! Hosted backend collaborator
//!
//! The cache subsystem only needs three things from the backend: `count`
//! queries, the identity of the signed-in user, and table change
//! notifications ([`ChangeFeed`]).

pub mod feed;
pub mod memory;
pub mod query;

use crate::error::BackendError;
use async_trait::async_trait;

pub use feed::{
    ChangeEvent, ChangeFeed, ChangeKind, ChannelSpec, ChannelStatus, EventFilter, FeedMessage,
    RowFilter,
};
pub use memory::MemoryBackend;
pub use query::{CountQuery, Filter, FilterOp};

/// Row-level read API and session identity
#[async_trait]
pub trait Backend: Send + Sync {
    /// Number of rows in `query.table` matching every filter
    async fn count(&self, query: &CountQuery) -> Result<u64, BackendError>;

    /// Identifier of the authenticated principal, if any
    async fn current_user_id(&self) -> Result<Option<String>, BackendError>;
}
