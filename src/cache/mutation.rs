//! Mutations: writes against the backend that invalidate cached reads on success.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::FetchError;
use super::keys::KeyPattern;
use super::lock::{rw_read, rw_write};
use super::query::QueryClient;

const SOURCE: &str = "cache::mutation";

type MutateFn<V, D> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D, FetchError>> + Send + Sync>;
type SuccessHook<D> = Arc<dyn Fn(&D) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Callbacks and cache effects applied after a mutation settles.
pub struct MutationOptions<D> {
    pub on_success: Option<SuccessHook<D>>,
    pub on_error: Option<ErrorHook>,
    /// Invalidated, in order, after a successful mutation and before `on_success`.
    pub invalidate_keys: Vec<KeyPattern>,
}

impl<D> MutationOptions<D> {
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
            invalidate_keys: Vec::new(),
        }
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&FetchError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn invalidate(mut self, pattern: impl Into<KeyPattern>) -> Self {
        self.invalidate_keys.push(pattern.into());
        self
    }
}

impl<D> Default for MutationOptions<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for MutationOptions<D> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            invalidate_keys: self.invalidate_keys.clone(),
        }
    }
}

impl<D> fmt::Debug for MutationOptions<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("invalidate_keys", &self.invalidate_keys.len())
            .finish()
    }
}

struct MutationState<D> {
    data: Option<D>,
    error: Option<FetchError>,
}

impl<D> Default for MutationState<D> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
        }
    }
}

/// A write operation with observable state.
///
/// Status transitions are published on a watch channel, so UI layers can
/// await [`watch::Receiver::changed`] instead of polling.
pub struct Mutation<V, D> {
    client: QueryClient,
    mutate_fn: MutateFn<V, D>,
    options: MutationOptions<D>,
    state: RwLock<MutationState<D>>,
    status: watch::Sender<MutationStatus>,
}

impl<V, D> Mutation<V, D>
where
    V: Send + 'static,
    D: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut, E>(client: QueryClient, mutate_fn: F, options: MutationOptions<D>) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, E>> + Send + 'static,
        E: Into<FetchError> + 'static,
    {
        let mutate_fn: MutateFn<V, D> = Arc::new(move |variables| {
            let pending = mutate_fn(variables);
            async move { pending.await.map_err(Into::into) }.boxed()
        });
        let (status, _) = watch::channel(MutationStatus::Idle);
        Self {
            client,
            mutate_fn,
            options,
            state: RwLock::new(MutationState::default()),
            status,
        }
    }

    /// Run the mutation.
    ///
    /// On success the declared keys are invalidated before `on_success` runs.
    pub async fn mutate(&self, variables: V) -> Result<D, FetchError> {
        self.status.send_replace(MutationStatus::Loading);
        debug!(op = "mutate", "mutation started");

        match (self.mutate_fn)(variables).await {
            Ok(data) => {
                {
                    let mut state = rw_write(&self.state, SOURCE, "mutate.success");
                    state.data = Some(data.clone());
                    state.error = None;
                }
                self.status.send_replace(MutationStatus::Success);

                for pattern in &self.options.invalidate_keys {
                    self.client.invalidate(pattern.clone());
                }
                debug!(
                    op = "mutate",
                    result = "success",
                    invalidated = self.options.invalidate_keys.len(),
                    "mutation succeeded"
                );
                if let Some(hook) = &self.options.on_success {
                    hook(&data);
                }
                Ok(data)
            }
            Err(error) => {
                rw_write(&self.state, SOURCE, "mutate.error").error = Some(error.clone());
                self.status.send_replace(MutationStatus::Error);
                warn!(op = "mutate", result = "error", error = %error, "mutation failed");
                if let Some(hook) = &self.options.on_error {
                    hook(&error);
                }
                Err(error)
            }
        }
    }

    /// Back to `Idle`, forgetting the last data and error.
    pub fn reset(&self) {
        *rw_write(&self.state, SOURCE, "reset") = MutationState::default();
        self.status.send_replace(MutationStatus::Idle);
    }

    pub fn status(&self) -> MutationStatus {
        *self.status.borrow()
    }

    /// Data from the last successful run.
    pub fn data(&self) -> Option<D> {
        rw_read(&self.state, SOURCE, "data").data.clone()
    }

    /// Error from the last failed run.
    pub fn error(&self) -> Option<FetchError> {
        rw_read(&self.state, SOURCE, "error").error.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.status() == MutationStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status() == MutationStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status() == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == MutationStatus::Error
    }

    /// Receiver that observes every status transition.
    pub fn watch(&self) -> watch::Receiver<MutationStatus> {
        self.status.subscribe()
    }
}

impl<V, D> fmt::Debug for Mutation<V, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("status", &*self.status.borrow())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
