//! Change-feed receiver
//!
//! Turns a long-poll change feed into a sequence of [`ChangeBatch`]es.
//! In drain mode the first empty page ends the sequence; in continuous
//! mode empty pages are skipped and the receiver runs until stopped.
//!
//! The receiver never polls ahead of its consumer. Pulled directly through
//! [`ChangeFeedReceiver::next_batch`] there is one poll per call; run as a
//! task through [`ChangeFeedReceiver::spawn`] it waits for channel capacity
//! before each poll.

use couchdb_store::{ChangeFeed, Document, DocumentStore, FeedCursor, FeedOptions};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedMode;
use crate::error::{Error, Result};

/// Number of most recent transitions kept for inspection
pub const TRANSITION_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Subscribed,
    Polling,
    Delivering,
    /// An empty page arrived in drain mode
    Drained,
    Failed,
    /// The owner cancelled the subscription
    Stopped,
}

impl ReceiverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiverState::Drained | ReceiverState::Failed | ReceiverState::Stopped
        )
    }
}

/// One non-empty page of changes
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Position in delivery order, starting at 0
    pub sequence: u64,
    /// Feed position after this batch
    pub cursor: FeedCursor,
    /// Changes the store reported as still pending
    pub pending: Option<u64>,
    pub documents: Vec<Document>,
}

pub struct ChangeFeedReceiver {
    store: Arc<dyn DocumentStore>,
    options: FeedOptions,
    mode: FeedMode,
    feed: Option<Box<dyn ChangeFeed>>,
    state: ReceiverState,
    transitions: VecDeque<ReceiverState>,
    delivered: u64,
}

impl ChangeFeedReceiver {
    pub fn new(store: Arc<dyn DocumentStore>, options: FeedOptions, mode: FeedMode) -> Self {
        Self {
            store,
            options,
            mode,
            feed: None,
            state: ReceiverState::Idle,
            transitions: VecDeque::from([ReceiverState::Idle]),
            delivered: 0,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// States entered so far, oldest first, starting with `Idle` until
    /// more than [`TRANSITION_HISTORY`] have been recorded
    pub fn transitions(&self) -> Vec<ReceiverState> {
        self.transitions.iter().copied().collect()
    }

    pub fn mode(&self) -> FeedMode {
        self.mode
    }

    pub fn feed_url(&self) -> String {
        format!("{}/_changes", self.store.database_url())
    }

    fn transition(&mut self, next: ReceiverState) {
        debug!(from = ?self.state, to = ?next, "Change feed receiver transition");
        self.state = next;
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back(next);
    }

    /// Open the feed at the configured cursor; a no-op once subscribed
    pub async fn subscribe(&mut self) -> Result<()> {
        if self.state != ReceiverState::Idle {
            return Ok(());
        }
        match self.store.open_change_feed(&self.options).await {
            Ok(feed) => {
                info!(
                    feed = %self.feed_url(),
                    since = %self.options.since,
                    mode = ?self.mode,
                    "Subscribed to change feed"
                );
                self.feed = Some(feed);
                self.transition(ReceiverState::Subscribed);
                Ok(())
            }
            Err(e) => {
                self.transition(ReceiverState::Failed);
                Err(Error::store_access(format!("open {}", self.feed_url()), e))
            }
        }
    }

    /// Poll until a non-empty page arrives or the feed ends.
    ///
    /// Returns `None` once drained, failed or stopped. A transport error is
    /// returned exactly once.
    pub async fn next_batch(&mut self) -> Result<Option<ChangeBatch>> {
        if self.state == ReceiverState::Idle {
            self.subscribe().await?;
        }

        loop {
            if self.state.is_terminal() {
                return Ok(None);
            }
            let Some(cursor) = self.feed.as_ref().map(|feed| feed.cursor().clone()) else {
                return Ok(None);
            };
            self.transition(ReceiverState::Polling);

            let polled = match self.feed.as_mut() {
                Some(feed) => feed.poll().await,
                None => return Ok(None),
            };
            match polled {
                Err(e) => {
                    self.transition(ReceiverState::Failed);
                    self.close_feed().await;
                    warn!(feed = %self.feed_url(), cursor = %cursor, error = %e, "Change feed poll failed");
                    return Err(Error::store_access(
                        format!("{} since {}", self.feed_url(), cursor),
                        e,
                    ));
                }
                Ok(page) if page.is_empty() => match self.mode {
                    FeedMode::Drain => {
                        self.transition(ReceiverState::Drained);
                        self.close_feed().await;
                        if page.pending.is_some_and(|n| n > 0) {
                            warn!(
                                feed = %self.feed_url(),
                                pending = ?page.pending,
                                "Change feed returned an empty page while reporting pending changes"
                            );
                        }
                        info!(feed = %self.feed_url(), batches = self.delivered, "Change feed drained");
                        return Ok(None);
                    }
                    FeedMode::Continuous => {
                        debug!(cursor = %page.last_seq, "No changes before poll timeout");
                    }
                },
                Ok(page) => {
                    self.transition(ReceiverState::Delivering);
                    let batch = ChangeBatch {
                        sequence: self.delivered,
                        cursor: page.last_seq,
                        pending: page.pending,
                        documents: page.documents,
                    };
                    self.delivered += 1;
                    debug!(
                        sequence = batch.sequence,
                        cursor = %batch.cursor,
                        docs = batch.documents.len(),
                        pending = ?batch.pending,
                        "Delivering change batch"
                    );
                    return Ok(Some(batch));
                }
            }
        }
    }

    /// Cancel the subscription; later calls to `next_batch` return `None`
    pub async fn stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.close_feed().await;
        self.transition(ReceiverState::Stopped);
        info!(feed = %self.feed_url(), "Change feed receiver stopped");
    }

    async fn close_feed(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.close().await;
        }
    }

    /// Run the receiver as a task delivering into a capacity-one channel.
    ///
    /// A slot is reserved before each poll, so the next poll starts only
    /// after the consumer has taken the previous batch. The channel closes
    /// when the feed drains, fails (after the error is sent) or is stopped.
    /// Dropping the handle stops the receiver.
    pub fn spawn(self) -> (ReceiverHandle, mpsc::Receiver<Result<ChangeBatch>>) {
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(self.state);

        let task = tokio::spawn(async move {
            let mut receiver = self;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let permit = tokio::select! {
                    permit = tx.reserve() => match permit {
                        Ok(permit) => permit,
                        // consumer went away
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };
                let next = tokio::select! {
                    next = receiver.next_batch() => next,
                    _ = shutdown_rx.changed() => {
                        debug!("Shutdown signal received while polling");
                        break;
                    }
                };
                state_tx.send_replace(receiver.state());
                match next {
                    Ok(Some(batch)) => permit.send(Ok(batch)),
                    Ok(None) => break,
                    Err(e) => {
                        permit.send(Err(e));
                        break;
                    }
                }
            }
            receiver.stop().await;
            state_tx.send_replace(receiver.state());
        });

        let handle = ReceiverHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            task,
        };
        (handle, rx)
    }
}

impl fmt::Debug for ChangeFeedReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeedReceiver")
            .field("store", &self.store)
            .field("since", &self.options.since)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

/// Owner's side of a spawned receiver
#[derive(Debug)]
pub struct ReceiverHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ReceiverState>,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Signal the task to stop; an in-flight poll is abandoned
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Last state published by the task
    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to exit
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Collect every document of a drain-mode receiver, in delivery order
pub async fn drain(receiver: ChangeFeedReceiver) -> Result<Vec<Document>> {
    let (handle, mut batches) = receiver.spawn();
    let mut documents = Vec::new();
    while let Some(batch) = batches.recv().await {
        match batch {
            Ok(batch) => documents.extend(batch.documents),
            Err(e) => {
                handle.stop();
                return Err(e);
            }
        }
    }
    Ok(documents)
}
