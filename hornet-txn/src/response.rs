//! Client responses and the one-shot channel that delivers them.

use std::sync::mpsc;

use hornet_common::error::{AbortReason, HornetError, HornetResult, Status};
use hornet_common::ids::{ClientHandle, TxnId};
use hornet_engine::value::RowSet;

/// Final answer for one client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    /// Transaction that produced the response.
    pub txn_id: TxnId,
    /// Request handle echoed back to the client.
    pub client_handle: ClientHandle,
    /// Outcome status.
    pub status: Status,
    /// Result tables, one per statement, empty on abort.
    pub results: Vec<RowSet>,
    /// Abort cause when `status` is not [`Status::Ok`].
    pub abort: Option<AbortReason>,
    /// Whether the transaction executed speculatively.
    pub speculative: bool,
}

/// One-shot sender for a [`ClientResponse`].
///
/// Consumed by the send so a transaction can never answer its client twice
/// within one attempt. The restart path clones the sender back into the
/// transaction before emitting the aborted response, giving the next attempt
/// its own shot.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    inner: mpsc::Sender<ClientResponse>,
}

impl ResponseSender {
    /// Creates a connected sender/receiver pair.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<ClientResponse>) {
        let (inner, receiver) = mpsc::channel();
        (Self { inner }, receiver)
    }

    /// Delivers the response, consuming the sender.
    ///
    /// # Errors
    ///
    /// Returns an error when the client connection is gone.
    pub fn send(self, response: ClientResponse) -> HornetResult<()> {
        self.inner
            .send(response)
            .map_err(|_| HornetError::Disconnected("client response receiver dropped"))
    }
}
