//! Client sink boundary.
//!
//! Everything the bridge pushes toward the editor goes through this trait:
//! fire-and-forget session updates (tracked for completion by the
//! notification queue) and permission round-trips.

use futures::future::BoxFuture;

use acp_bridge_error::BridgeError;

use crate::acp::{PermissionRequest, RequestPermissionOutcome, SessionNotification};

pub trait ClientSink: Send + Sync + 'static {
    /// Deliver one `session/update` notification. Must resolve (or fail)
    /// when the transport has accepted the message so queue flush points
    /// are meaningful.
    fn session_update(
        &self,
        notification: SessionNotification,
    ) -> BoxFuture<'static, Result<(), BridgeError>>;

    /// Ask the user for a permission decision. Implementations enforce
    /// their own hard timeout, resolving as `Cancelled` when it elapses,
    /// so a stuck prompt cannot leak its pending-request entry forever.
    fn request_permission(
        &self,
        request: PermissionRequest,
    ) -> BoxFuture<'static, Result<RequestPermissionOutcome, BridgeError>>;
}
