//! Provider-side hook

use async_trait::async_trait;
use meshquery_core::{PeerAddr, RouterResult};
use meshquery_p2p::Query;

/// Executes queries this node serves as a provider.
///
/// The router only forwards; answering block or plugin queries is up to the
/// node embedding it.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Answer a query from `from`. `None` sends no reply.
    async fn handle_query(&self, from: &PeerAddr, query: &Query) -> Option<String>;

    /// Run one of this node's own plugins for a local caller
    async fn process_custom_call(&self, name: &str, params: &[String]) -> RouterResult<String>;
}
