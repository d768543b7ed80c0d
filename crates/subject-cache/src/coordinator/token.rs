use std::fmt;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use super::LoadError;

/// The result of a single load, as observed by everyone waiting on it.
pub type LoadOutcome = Result<(), LoadError>;

/// A joinable handle to one in-flight load.
///
/// Every clone observes the same [`LoadOutcome`]. The `load_id` is unique per coordinator and
/// tells two loads for the same key apart.
#[derive(Clone)]
pub(crate) struct LoadToken {
    load_id: u64,
    completion: Shared<oneshot::Receiver<LoadOutcome>>,
}

/// The producing side of a [`LoadToken`].
///
/// Dropping it without calling [`complete`](Self::complete) completes the token with
/// [`LoadError::Aborted`].
pub(crate) struct LoadCompleter {
    sender: oneshot::Sender<LoadOutcome>,
}

impl LoadToken {
    pub fn new(load_id: u64) -> (Self, LoadCompleter) {
        let (sender, receiver) = oneshot::channel();
        let token = Self {
            load_id,
            completion: receiver.shared(),
        };
        (token, LoadCompleter { sender })
    }

    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    /// Waits at most `timeout` for the load to complete.
    ///
    /// Returns `None` if the load is still running afterwards. Giving up does not affect the load.
    pub async fn wait(self, timeout: Duration) -> Option<LoadOutcome> {
        match tokio::time::timeout(timeout, self.completion).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(oneshot::Canceled)) => Some(Err(LoadError::Aborted)),
            Err(_elapsed) => None,
        }
    }
}

impl fmt::Debug for LoadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadToken")
            .field("load_id", &self.load_id)
            .field("completed", &self.completion.peek().is_some())
            .finish()
    }
}

impl LoadCompleter {
    pub fn complete(self, outcome: LoadOutcome) {
        // nobody may be waiting anymore, which is fine
        self.sender.send(outcome).ok();
    }
}
