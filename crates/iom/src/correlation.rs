use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

/// timeout for a correlated request on the bus.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum RequestError {
    Timeout,
    AlreadyInFlight,
    Cancelled,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "no response within {}s", REQUEST_TIMEOUT.as_secs()),
            Self::AlreadyInFlight => write!(f, "another request is already in flight"),
            Self::Cancelled => write!(f, "request was cancelled"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Single-slot correlation of an outbound request with its response topic.
/// One request may be in flight at a time; the response side completes the
/// slot when a message with the matching correlation id arrives.
#[derive(Default)]
pub struct CorrelationSlot {
    inner: Mutex<Option<PendingRequest>>,
}

struct PendingRequest {
    correlation_id: String,
    respond_to: oneshot::Sender<Vec<u8>>,
}

impl CorrelationSlot {
    /// Arms the slot and waits for the matching response. The returned
    /// future resolves with the raw response payload, or a timeout after
    /// 30 seconds.
    pub async fn wait_for(&self, correlation_id: &str) -> Result<Vec<u8>, RequestError> {
        let receiver = {
            let mut slot = self.inner.lock().await;
            if slot.is_some() {
                return Err(RequestError::AlreadyInFlight);
            }

            let (sender, receiver) = oneshot::channel();
            *slot = Some(PendingRequest {
                correlation_id: correlation_id.to_owned(),
                respond_to: sender,
            });
            receiver
        };

        let result = tokio::time::timeout(REQUEST_TIMEOUT, receiver).await;

        // disarm in every outcome, the slot must be reusable afterwards
        self.inner.lock().await.take();

        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => Err(RequestError::Timeout),
        }
    }

    /// Completes an in-flight request if the correlation id matches.
    /// Returns whether the payload was consumed as a response.
    pub async fn complete(&self, correlation_id: &str, payload: Vec<u8>) -> bool {
        let mut slot = self.inner.lock().await;
        let matches = slot
            .as_ref()
            .map_or(false, |pending| pending.correlation_id == correlation_id);
        if !matches {
            return false;
        }

        match slot.take() {
            Some(pending) => pending.respond_to.send(payload).is_ok(),
            None => false,
        }
    }

    /// Whether a request is currently waiting for its response.
    pub async fn is_armed(&self) -> bool {
        self.inner.lock().await.is_some()
    }
}
