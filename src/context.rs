//! Run context shared by every generation call of an optimization session
//!
//! Carries the cancellation signal, the model name to request and the
//! optional stream handler used by a UI to show progress.

use crate::error::ApoError;
use crate::Result;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Role of a message or stream chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Model,
}

/// Incremental piece of output delivered to the stream handler
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub role: Role,
    pub text: String,
}

/// Callback receiving stream chunks. Presentation only.
pub type StreamHandler = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

/// Cloneable cancellation signal
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn canceled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct RunContext {
    model: Option<String>,
    stream: Option<StreamHandler>,
    cancel: CancelToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_stream(mut self, handler: StreamHandler) -> Self {
        self.stream = Some(handler);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn stream(&self) -> Option<&StreamHandler> {
        self.stream.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Send a chunk to the stream handler, if any.
    pub fn emit(&self, role: Role, text: impl Into<String>) {
        if let Some(handler) = &self.stream {
            handler(&StreamChunk {
                role,
                text: text.into(),
            });
        }
    }

    /// Run `fut` unless the context is canceled first.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_canceled() {
            return Err(ApoError::Canceled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.canceled() => Err(ApoError::Canceled),
            result = fut => result,
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("model", &self.model)
            .field("stream", &self.stream.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}
