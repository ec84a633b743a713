//! Client transport abstraction.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::transport::{WebSocketHandler, WebSocketSession};

use super::request::TransportRequest;
use super::url::TransportType;

// ============================================================================
// Transport
// ============================================================================

/// A way of reaching a SockJS server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport types this implementation can attempt, in preference order.
    fn transport_types(&self) -> Vec<TransportType>;

    /// Connects using `request.transport_type()`.
    ///
    /// Completes once the server's open frame arrived. Resources that must
    /// be released if the attempt times out are registered with
    /// [`TransportRequest::add_timeout_task`].
    async fn connect(
        &self,
        request: &TransportRequest,
        handler: Arc<dyn WebSocketHandler>,
    ) -> Result<Arc<dyn WebSocketSession>>;
}
