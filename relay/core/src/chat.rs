//! Chat Flow
//!
//! Ties the conversation store to the relay: every incoming message is
//! relayed to the engine, recorded under the active discussion once the
//! engine has accepted it, and the engine's answer is recorded once its
//! stream has ended.
//!
//! Answers are stored by a background task. A new message waits for the
//! previous task before it is recorded, so stored order is conversation order.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::relay::{CharStream, Relay, RelayError};
use crate::store::{
    ConversationStore, Discussion, DiscussionId, ExportedDiscussion, Message, Sender, StoreError,
    DEFAULT_TITLE,
};
use crate::streaming::{SessionHandle, SessionOutcome};

/// Appended to a stored answer whose engine output failed mid-response
pub const INTERRUPTED_MARKER: &str = "\n[response interrupted]";

/// Errors from the chat flow
#[derive(Debug, Error)]
pub enum ChatError {
    /// Storage failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The relay refused the request
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// A blocking store task panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(#[from] JoinError),
}

/// Application-wide chat state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChatContext {
    /// Discussion new messages go to, if one is selected
    pub current_discussion: Option<DiscussionId>,
    /// The selection came from an explicit new-discussion request and has
    /// not received a message yet
    pub selected_explicitly: bool,
}

/// A message accepted for relaying
pub struct ChatReply {
    /// Discussion the exchange is recorded under
    pub discussion_id: DiscussionId,
    /// The engine's answer, one character at a time
    pub stream: CharStream,
    /// Observe or cancel the response
    pub handle: SessionHandle,
    /// Resolves to the stored assistant message id once the answer is recorded
    /// (`None` when the response was cancelled)
    pub persisted: JoinHandle<Result<Option<i64>, ChatError>>,
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatReply")
            .field("discussion_id", &self.discussion_id)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Run a store operation on the blocking pool
async fn on_store<T, F>(store: &ConversationStore, f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce(&ConversationStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
}

/// Record the answer once the session reports how it ended
///
/// Holds `_order` until the answer is written.
async fn persist_reply(
    store: ConversationStore,
    discussion_id: DiscussionId,
    outcome: oneshot::Receiver<SessionOutcome>,
    _order: OwnedMutexGuard<()>,
) -> Result<Option<i64>, ChatError> {
    let Ok(outcome) = outcome.await else {
        debug!(discussion_id, "Session ended without an outcome");
        return Ok(None);
    };

    let content = match outcome {
        SessionOutcome::Completed { text, .. } => text,
        SessionOutcome::Degraded { text, reason } => {
            warn!(discussion_id, reason = %reason, "Storing interrupted response");
            format!("{text}{INTERRUPTED_MARKER}")
        }
        SessionOutcome::Cancelled { partial } => {
            debug!(
                discussion_id,
                chars = partial.chars().count(),
                "Response cancelled, nothing stored"
            );
            return Ok(None);
        }
    };

    let id = on_store(&store, move |store| {
        store.append_message(discussion_id, Sender::Assistant, &content)
    })
    .await?;
    Ok(Some(id))
}

/// Chat service shared by all HTTP handlers
pub struct ChatService {
    store: ConversationStore,
    relay: Arc<Relay>,
    context: Mutex<ChatContext>,
    persist_order: Arc<Mutex<()>>,
}

impl ChatService {
    /// Create a service over an opened store and a started relay
    pub fn new(store: ConversationStore, relay: Arc<Relay>) -> Self {
        Self {
            store,
            relay,
            context: Mutex::new(ChatContext::default()),
            persist_order: Arc::new(Mutex::new(())),
        }
    }

    /// The relay in use
    #[must_use]
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Snapshot of the chat context
    pub async fn context(&self) -> ChatContext {
        *self.context.lock().await
    }

    /// Relay `text` to the engine and record it as a user message
    ///
    /// Nothing is recorded when the engine refuses the prompt.
    pub async fn send_message(&self, text: &str) -> Result<ChatReply, ChatError> {
        let mut context = self.context.lock().await;

        // The previous answer must be stored before this message
        if self.relay.stop() {
            debug!("Preempting running response");
        }
        let order = Arc::clone(&self.persist_order).lock_owned().await;

        let submission = self.relay.submit(text).await?;
        let discussion_id = self.ensure_discussion(&mut context).await?;
        let content = text.to_string();
        on_store(&self.store, move |store| {
            store.append_message(discussion_id, Sender::User, &content)
        })
        .await?;
        drop(context);
        info!(discussion_id, chars = text.chars().count(), "Received message");

        let store = self.store.clone();
        let persisted = tokio::spawn(async move {
            let result = persist_reply(store, discussion_id, submission.outcome, order).await;
            if let Err(e) = &result {
                error!(discussion_id, error = %e, "Failed to store response");
            }
            result
        });

        Ok(ChatReply {
            discussion_id,
            stream: submission.stream,
            handle: submission.handle,
            persisted,
        })
    }

    /// Pick the discussion for a new message
    ///
    /// The selected discussion is reused only while it is the latest one and
    /// already holds a message, or was just created by [`Self::new_discussion`].
    /// Otherwise a fresh discussion is started.
    async fn ensure_discussion(&self, context: &mut ChatContext) -> Result<DiscussionId, ChatError> {
        if let Some(current) = context.current_discussion {
            let explicit = context.selected_explicitly;
            let reusable = on_store(&self.store, move |store| {
                Ok(store.latest_discussion_id()? == Some(current)
                    && (explicit || store.has_any_message_in_latest_discussion()?))
            })
            .await?;
            if reusable {
                context.selected_explicitly = false;
                return Ok(current);
            }
        }

        let id = on_store(&self.store, |store| store.create_discussion(DEFAULT_TITLE)).await?;
        *context = ChatContext {
            current_discussion: Some(id),
            selected_explicitly: false,
        };
        info!(discussion_id = id, "Started discussion");
        Ok(id)
    }

    /// Create a discussion and select it
    pub async fn new_discussion(&self, title: Option<String>) -> Result<DiscussionId, ChatError> {
        let mut context = self.context.lock().await;
        let title = title.unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let id = on_store(&self.store, move |store| store.create_discussion(&title)).await?;
        *context = ChatContext {
            current_discussion: Some(id),
            selected_explicitly: true,
        };
        info!(discussion_id = id, "Selected new discussion");
        Ok(id)
    }

    /// Every discussion with its messages
    pub async fn export(&self) -> Result<Vec<ExportedDiscussion>, ChatError> {
        on_store(&self.store, ConversationStore::export_all).await
    }

    /// All discussions
    pub async fn discussions(&self) -> Result<Vec<Discussion>, ChatError> {
        on_store(&self.store, ConversationStore::list_discussions).await
    }

    /// Messages of one discussion; fails if the discussion does not exist
    pub async fn messages(&self, discussion_id: DiscussionId) -> Result<Vec<Message>, ChatError> {
        on_store(&self.store, move |store| {
            if !store.discussion_exists(discussion_id)? {
                return Err(StoreError::DiscussionNotFound(discussion_id));
            }
            store.list_messages(discussion_id)
        })
        .await
    }

    /// Delete one discussion; returns whether it existed
    pub async fn delete_discussion(&self, discussion_id: DiscussionId) -> Result<bool, ChatError> {
        let mut context = self.context.lock().await;
        let deleted =
            on_store(&self.store, move |store| store.delete_discussion(discussion_id)).await?;
        if context.current_discussion == Some(discussion_id) {
            *context = ChatContext::default();
        }
        Ok(deleted)
    }

    /// Delete every discussion
    pub async fn delete_all(&self) -> Result<(), ChatError> {
        let mut context = self.context.lock().await;
        on_store(&self.store, ConversationStore::delete_all).await?;
        *context = ChatContext::default();
        Ok(())
    }

    /// Raise the stop flag of the running response
    pub fn stop(&self) -> bool {
        self.relay.stop()
    }

    /// Restart the engine
    pub async fn reset_engine(&self) -> Result<(), ChatError> {
        Ok(self.relay.reset_engine().await?)
    }
}
