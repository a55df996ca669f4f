//! Stream bridge between line-oriented backend I/O and awaitable submissions.
//!
//! The backend is driven through two byte streams: an input channel we write
//! NDJSON requests to, and an output channel it writes replies to. A reader
//! task owns the output channel and routes each `result` reply into the
//! single pending slot installed by [`StreamBridge::submit`].
//!
//! `submit` takes `&mut self`, so at most one submission is ever in flight.
//! Replies for any other id (for example a late reply after a timeout) are
//! discarded.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backend::Evaluator;
use crate::protocol::{Reply, Request};
use crate::Evaluation;

/// Extra time granted past the engine-side timeout before giving up on a reply.
const DEFAULT_RESPONSE_GRACE: Duration = Duration::from_secs(2);

/// Error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Backend is not ready to accept input")]
    NotReady,

    #[error("No result within {0:?}")]
    Timeout(Duration),

    #[error("Backend disconnected")]
    Disconnected,

    #[error("Failed to write to backend: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

type ReplySender = oneshot::Sender<Result<Evaluation, BridgeError>>;

/// The submission currently waiting for its reply.
struct PendingResult {
    id: u64,
    tx: ReplySender,
}

#[derive(Default)]
struct Pending {
    waiting: Option<PendingResult>,
    /// Set by the reader task once the output channel is gone.
    closed: bool,
}

type PendingSlot = Arc<StdMutex<Pending>>;

enum Readiness {
    Waiting(oneshot::Receiver<String>),
    Ready(String),
}

/// Drives a backend over an input writer and an output reader.
pub struct StreamBridge<W> {
    input: W,
    pending: PendingSlot,
    readiness: Readiness,
    next_id: u64,
    eval_timeout: Duration,
    response_grace: Duration,
    reader_task: JoinHandle<()>,
}

impl<W> StreamBridge<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a bridge and start reading replies from `output`.
    ///
    /// The bridge starts out not ready; call [`wait_ready`](Self::wait_ready)
    /// before submitting.
    pub fn new<R>(input: W, output: R, eval_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending: PendingSlot = Arc::new(StdMutex::new(Pending::default()));
        let (ready_tx, ready_rx) = oneshot::channel();
        let reader_task = tokio::spawn(read_replies(output, pending.clone(), ready_tx));

        Self {
            input,
            pending,
            readiness: Readiness::Waiting(ready_rx),
            next_id: 1,
            eval_timeout,
            response_grace: DEFAULT_RESPONSE_GRACE,
            reader_task,
        }
    }

    /// Set how long to keep waiting after the engine-side timeout has elapsed.
    pub fn with_response_grace(mut self, grace: Duration) -> Self {
        self.response_grace = grace;
        self
    }

    /// Wait for the backend's `ready` message. Returns the reported version.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<&str, BridgeError> {
        if let Readiness::Waiting(rx) = &mut self.readiness {
            let version = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(version)) => version,
                Ok(Err(_)) => return Err(BridgeError::Disconnected),
                Err(_) => return Err(BridgeError::Timeout(timeout)),
            };
            self.readiness = Readiness::Ready(version);
        }

        match &self.readiness {
            Readiness::Ready(version) => Ok(version),
            Readiness::Waiting(_) => Err(BridgeError::NotReady),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.readiness, Readiness::Ready(_))
    }

    /// Version reported by the backend, once ready.
    pub fn version(&self) -> Option<&str> {
        match &self.readiness {
            Readiness::Ready(version) => Some(version),
            Readiness::Waiting(_) => None,
        }
    }

    /// Submit `code` and wait for exactly one result.
    pub async fn submit(&mut self, code: &str) -> Result<Evaluation, BridgeError> {
        if !self.is_ready() {
            return Err(BridgeError::NotReady);
        }

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self
                .pending
                .lock()
                .map_err(|_| BridgeError::Protocol("pending slot poisoned".to_string()))?;
            if slot.closed {
                return Err(BridgeError::Disconnected);
            }
            slot.waiting = Some(PendingResult { id, tx });
        }

        let request = Request::Eval {
            id,
            code: code.to_string(),
            timeout_ms: u64::try_from(self.eval_timeout.as_millis()).ok(),
        };
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                self.clear_pending(id);
                return Err(BridgeError::Protocol(e.to_string()));
            }
        };

        debug!("[bridge] Submitting request {} ({} bytes)", id, code.len());
        if let Err(e) = self.write_line(&line).await {
            self.clear_pending(id);
            return Err(e.into());
        }

        let wait = self.eval_timeout + self.response_grace;
        let outcome = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                warn!("[bridge] Request {} got no result within {:?}", id, wait);
                Err(BridgeError::Timeout(self.eval_timeout))
            }
        };

        self.clear_pending(id);
        outcome
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.input.write_all(line.as_bytes()).await?;
        self.input.flush().await
    }

    fn clear_pending(&self, id: u64) {
        if let Ok(mut slot) = self.pending.lock() {
            if slot.waiting.as_ref().map(|w| w.id) == Some(id) {
                slot.waiting = None;
            }
        }
    }
}

impl<W> Drop for StreamBridge<W> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl<W> Evaluator for StreamBridge<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn evaluate(&mut self, code: &str) -> Result<Evaluation, BridgeError> {
        self.submit(code).await
    }
}

/// Read replies until the output channel closes.
async fn read_replies<R>(output: R, pending: PendingSlot, ready_tx: oneshot::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(output).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Reply::from_line(&line) {
                    Ok(Reply::Ready { version }) => {
                        info!("[bridge] Backend ready ({})", version);
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(version);
                        }
                    }
                    Ok(Reply::Result { id, status, text }) => {
                        deliver(&pending, Some(id), Ok(Evaluation { status, text }));
                    }
                    Ok(Reply::ProtocolError { message }) => {
                        warn!("[bridge] Backend rejected request: {}", message);
                        deliver(&pending, None, Err(BridgeError::Protocol(message)));
                    }
                    Err(_) => {
                        debug!("[bridge] Ignoring non-protocol output: {}", line);
                    }
                }
            }
            Ok(None) => {
                info!("[bridge] Backend output closed");
                break;
            }
            Err(e) => {
                error!("[bridge] Failed to read backend output: {}", e);
                break;
            }
        }
    }

    // Dropping the waiting sender wakes the submitter with `Disconnected`
    if let Ok(mut slot) = pending.lock() {
        slot.closed = true;
        slot.waiting = None;
    }
}

/// Resolve the pending submission. `None` matches whatever is waiting.
fn deliver(pending: &PendingSlot, id: Option<u64>, result: Result<Evaluation, BridgeError>) {
    let waiting = match pending.lock() {
        Ok(mut slot) => match slot.waiting.take() {
            Some(w) if id.is_none() || id == Some(w.id) => Some(w),
            other => {
                slot.waiting = other;
                None
            }
        },
        Err(_) => None,
    };

    match waiting {
        Some(w) => {
            if w.tx.send(result).is_err() {
                debug!("[bridge] Submitter for request {} went away", w.id);
            }
        }
        None => warn!(
            "[bridge] Discarding reply for request {:?} with no matching submission",
            id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EvalStatus;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Spawn a scripted engine. `respond` maps code to the lines written back
    /// for that request (zero lines means never answer).
    fn spawn_engine<F>(
        engine_in: DuplexStream,
        mut engine_out: DuplexStream,
        mut respond: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(u64, &str) -> Vec<String> + Send + 'static,
    {
        tokio::spawn(async move {
            engine_out
                .write_all(b"{\"type\":\"ready\",\"version\":\"fake-1\"}\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(engine_in).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Request::Eval { id, code, .. } = Request::from_line(&line).unwrap();
                for reply in respond(id, &code) {
                    if reply == "<sleep>" {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue;
                    }
                    engine_out.write_all(reply.as_bytes()).await.unwrap();
                    engine_out.write_all(b"\n").await.unwrap();
                }
            }
        })
    }

    fn result_line(id: u64, status: EvalStatus, text: &str) -> String {
        Reply::Result {
            id,
            status,
            text: text.to_string(),
        }
        .to_line()
        .unwrap()
        .trim_end()
        .to_string()
    }

    fn bridge_with_engine<F>(eval_timeout: Duration, respond: F) -> StreamBridge<DuplexStream>
    where
        F: FnMut(u64, &str) -> Vec<String> + Send + 'static,
    {
        let (input, engine_in) = tokio::io::duplex(4096);
        let (engine_out, output) = tokio::io::duplex(4096);
        spawn_engine(engine_in, engine_out, respond);
        StreamBridge::new(input, output, eval_timeout).with_response_grace(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_submit_before_ready_is_rejected() {
        let mut bridge = bridge_with_engine(TIMEOUT, |id, _| vec![result_line(id, EvalStatus::Ok, "")]);
        let err = bridge.submit("1").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotReady));
    }

    #[tokio::test]
    async fn test_wait_ready_reports_version() {
        let mut bridge = bridge_with_engine(TIMEOUT, |_, _| vec![]);
        assert!(!bridge.is_ready());
        assert_eq!(bridge.wait_ready(TIMEOUT).await.unwrap(), "fake-1");
        assert!(bridge.is_ready());
        assert_eq!(bridge.version(), Some("fake-1"));
        // Second call returns immediately
        assert_eq!(bridge.wait_ready(Duration::ZERO).await.unwrap(), "fake-1");
    }

    #[tokio::test]
    async fn test_each_submit_gets_its_own_result() {
        let mut bridge = bridge_with_engine(TIMEOUT, |id, code| {
            vec![result_line(id, EvalStatus::Ok, &format!("echo:{}", code))]
        });
        bridge.wait_ready(TIMEOUT).await.unwrap();

        for code in ["a", "b", "c"] {
            let evaluation = bridge.submit(code).await.unwrap();
            assert_eq!(evaluation.status, EvalStatus::Ok);
            assert_eq!(evaluation.text, format!("echo:{}", code));
        }
    }

    #[tokio::test]
    async fn test_noise_lines_are_ignored() {
        let mut bridge = bridge_with_engine(TIMEOUT, |id, _| {
            vec![
                "stray console output".to_string(),
                String::new(),
                result_line(id, EvalStatus::Ok, "2"),
            ]
        });
        bridge.wait_ready(TIMEOUT).await.unwrap();

        let evaluation = bridge.submit("1+1").await.unwrap();
        assert_eq!(evaluation.text, "2");
    }

    #[tokio::test]
    async fn test_error_status_is_passed_through() {
        let mut bridge = bridge_with_engine(TIMEOUT, |id, _| {
            vec![result_line(id, EvalStatus::Error, "Error: boom")]
        });
        bridge.wait_ready(TIMEOUT).await.unwrap();

        let evaluation = bridge.submit("throw new Error('boom')").await.unwrap();
        assert_eq!(evaluation.status, EvalStatus::Error);
        assert_eq!(evaluation.text, "Error: boom");
        assert!(!evaluation.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_then_stale_reply_is_discarded() {
        let mut bridge = bridge_with_engine(Duration::from_millis(50), |id, code| {
            if code == "slow" {
                vec!["<sleep>".to_string(), result_line(id, EvalStatus::Ok, "late")]
            } else {
                vec![result_line(id, EvalStatus::Ok, "fresh")]
            }
        });
        bridge.wait_ready(TIMEOUT).await.unwrap();

        let err = bridge.submit("slow").await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));

        // The engine answers "slow" first; that reply must not leak into
        // the next submission.
        bridge.eval_timeout = TIMEOUT;
        let evaluation = bridge.submit("next").await.unwrap();
        assert_eq!(evaluation.text, "fresh");
    }

    #[tokio::test]
    async fn test_protocol_error_fails_pending_submit() {
        let mut bridge = bridge_with_engine(TIMEOUT, |_, _| {
            vec!["{\"type\":\"protocol_error\",\"message\":\"bad request\"}".to_string()]
        });
        bridge.wait_ready(TIMEOUT).await.unwrap();

        let err = bridge.submit("1").await.unwrap_err();
        match err {
            BridgeError::Protocol(message) => assert_eq!(message, "bad request"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_exit_reports_disconnected() {
        let (input, engine_in) = tokio::io::duplex(4096);
        let (mut engine_out, output) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            engine_out
                .write_all(b"{\"type\":\"ready\",\"version\":\"fake-1\"}\n")
                .await
                .unwrap();
            // Read one request, then exit without answering
            let mut lines = BufReader::new(engine_in).lines();
            let _ = lines.next_line().await;
        });

        let mut bridge = StreamBridge::new(input, output, TIMEOUT);
        bridge.wait_ready(TIMEOUT).await.unwrap();

        let err = bridge.submit("1").await.unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected | BridgeError::Io(_)));

        // Every later submission fails fast as well
        let err = bridge.submit("2").await.unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected | BridgeError::Io(_)));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_ready_message() {
        let (input, _engine_in) = tokio::io::duplex(64);
        let (_engine_out, output) = tokio::io::duplex(64);
        let mut bridge = StreamBridge::new(input, output, TIMEOUT);

        let err = bridge.wait_ready(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert!(!bridge.is_ready());
    }
}
