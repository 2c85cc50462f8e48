//! Pending results for cached reads.
//!
//! A read hands back a [`PendingResult`] immediately. It has three observable
//! outcomes: zero or more progress deliveries (prefill), then exactly one of
//! success or failure. Everything sent before the caller starts listening is
//! buffered, so observers attached after the read returns still see it.

use futures::future::{AbortHandle, AbortRegistration};
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::error::FetchError;
use super::lock::mutex_lock;
use super::traits::CacheResult;

pub type Outcome = Result<CacheResult<Value>, FetchError>;

/// Cancellation handle for a read.
///
/// Aborting cancels the network operation if one is outstanding. It is always
/// safe to call, including on pure cache hits where no request exists.
#[derive(Debug, Clone)]
pub struct RequestControl {
  handle: AbortHandle,
}

impl RequestControl {
  pub fn abort(&self) {
    self.handle.abort();
  }

  pub fn is_aborted(&self) -> bool {
    self.handle.is_aborted()
  }
}

/// Caller's side of a read.
#[derive(Debug)]
pub struct PendingResult {
  progress: mpsc::UnboundedReceiver<CacheResult<Value>>,
  outcome: oneshot::Receiver<Outcome>,
  control: RequestControl,
}

impl PendingResult {
  pub(crate) fn new() -> (Self, Completer, AbortRegistration) {
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (handle, registration) = AbortHandle::new_pair();

    let pending = Self {
      progress: progress_rx,
      outcome: outcome_rx,
      control: RequestControl { handle },
    };
    let completer = Completer {
      progress: progress_tx,
      outcome: Mutex::new(Some(outcome_tx)),
    };
    (pending, completer, registration)
  }

  /// Wait for the next progress delivery.
  ///
  /// Returns `None` once no further progress can arrive.
  pub async fn next_progress(&mut self) -> Option<CacheResult<Value>> {
    self.progress.recv().await
  }

  /// Take a progress delivery that has already arrived.
  pub fn try_progress(&mut self) -> Option<CacheResult<Value>> {
    self.progress.try_recv().ok()
  }

  /// Take the final outcome if it has already arrived.
  pub fn try_outcome(&mut self) -> Option<Outcome> {
    self.outcome.try_recv().ok()
  }

  /// Wait for the final outcome.
  pub async fn wait(self) -> Outcome {
    self.outcome.await.unwrap_or(Err(FetchError::Closed))
  }

  pub fn control(&self) -> RequestControl {
    self.control.clone()
  }

  pub fn abort(&self) {
    self.control.abort();
  }
}

/// Engine's side of a read. The first resolve/reject wins.
#[derive(Debug)]
pub(crate) struct Completer {
  progress: mpsc::UnboundedSender<CacheResult<Value>>,
  outcome: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Completer {
  pub fn notify(&self, result: CacheResult<Value>) {
    let _ = self.progress.send(result);
  }

  pub fn resolve(&self, result: CacheResult<Value>) -> bool {
    self.settle(Ok(result))
  }

  pub fn reject(&self, error: FetchError) -> bool {
    self.settle(Err(error))
  }

  fn settle(&self, outcome: Outcome) -> bool {
    let sender = mutex_lock(&self.outcome, "completer_settle").take();
    match sender {
      // Receiver may have been dropped
      Some(tx) => {
        let _ = tx.send(outcome);
        true
      }
      None => false,
    }
  }
}
