//! Service lifecycle state machine.
//!
//! Every long-lived component (the expiring map, the correlation manager, any
//! background task owner) is driven through the same transitions:
//!
//! ```text
//! New -> Starting -> Started -> Stopping -> Stopped -> ShuttingDown -> Shutdown
//!                       |  ^
//!                       v  |
//!                  Suspending/Suspended
//! ```
//!
//! `Failed` is entered when a start attempt is rolled back; `start()` may be
//! retried from there.
//!
//! Services implement the [`ManagedService`] hooks and own a
//! [`ServiceController`]. The blanket [`Lifecycle`] impl turns any managed
//! service into an object-safe handle that can be registered as a child of a
//! composite service. State is published through `ArcSwap`, so readers never
//! block; transitions are serialized by a per-controller async mutex.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ServiceState
// ---------------------------------------------------------------------------

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    New,
    Starting,
    Started,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    ShuttingDown,
    Shutdown,
    Failed,
}

impl ServiceState {
    /// Returns `true` for the states in which `stop()` has nothing to do.
    #[must_use]
    pub fn is_stopping_or_stopped(self) -> bool {
        matches!(
            self,
            Self::New
                | Self::Stopping
                | Self::Stopped
                | Self::ShuttingDown
                | Self::Shutdown
                | Self::Failed
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::ShuttingDown => "shutting-down",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transition results and errors
// ---------------------------------------------------------------------------

/// Outcome of a successful lifecycle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The service moved to a new state.
    Applied,
    /// The service was already in (or past) the requested state.
    NoOp,
}

/// Failure of a lifecycle transition.
///
/// Hook failures carry the service name and the hook's original error. By the
/// time one of these reaches the caller the state machine has already settled.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to start service `{service}`")]
    Start {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to stop service `{service}`")]
    Stop {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to suspend service `{service}`")]
    Suspend {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to resume service `{service}`")]
    Resume {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to shut down service `{service}`")]
    Shutdown {
        service: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("service `{service}` cannot {action} while {state}")]
    InvalidState {
        service: String,
        action: &'static str,
        state: ServiceState,
    },
}

// ---------------------------------------------------------------------------
// ManagedService hooks
// ---------------------------------------------------------------------------

/// Hooks a service implements to take part in the lifecycle.
///
/// The hooks are only ever invoked by the service's own [`ServiceController`],
/// one transition at a time. Callers drive the service through [`Lifecycle`].
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// The controller that owns this service's state.
    fn controller(&self) -> &ServiceController;

    /// Acquire resources. A failure rolls the service back to a stopped state.
    async fn do_start(&self) -> anyhow::Result<()>;

    /// Release resources. Called at most once per successful start.
    async fn do_stop(&self) -> anyhow::Result<()>;

    /// Whether `suspend()`/`resume()` apply to this service.
    fn supports_suspension(&self) -> bool {
        false
    }

    async fn do_suspend(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn do_resume(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Final cleanup, called after the stop path has run.
    async fn do_shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle handle
// ---------------------------------------------------------------------------

/// Object-safe lifecycle handle. Implemented for every [`ManagedService`].
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn service_name(&self) -> &str;

    fn state(&self) -> ServiceState;

    /// True only while the service is `Started`. Background tasks check this
    /// before each unit of work.
    fn is_run_allowed(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Start the service.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Start`] if a child or the start hook fails;
    /// the service is rolled back to `Failed` first.
    async fn start(&self) -> Result<Transition, LifecycleError>;

    /// Stop the service.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Stop`] if the stop hook or a child fails; the
    /// service is `Stopped` regardless.
    async fn stop(&self) -> Result<Transition, LifecycleError>;

    /// Suspend the service.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Suspend`] if the suspend hook fails.
    async fn suspend(&self) -> Result<Transition, LifecycleError>;

    /// Resume a suspended service.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Resume`] if the resume hook fails.
    async fn resume(&self) -> Result<Transition, LifecycleError>;

    /// Stop (if needed) and shut down the service permanently.
    ///
    /// # Errors
    ///
    /// Returns the first error from the stop path or the shutdown hooks; the
    /// service is `Shutdown` regardless.
    async fn shutdown(&self) -> Result<Transition, LifecycleError>;
}

#[async_trait]
impl<T: ManagedService + ?Sized> Lifecycle for T {
    fn service_name(&self) -> &str {
        self.controller().name()
    }

    fn state(&self) -> ServiceState {
        self.controller().state()
    }

    async fn start(&self) -> Result<Transition, LifecycleError> {
        self.controller().start(self).await
    }

    async fn stop(&self) -> Result<Transition, LifecycleError> {
        self.controller().stop(self).await
    }

    async fn suspend(&self) -> Result<Transition, LifecycleError> {
        self.controller().suspend(self).await
    }

    async fn resume(&self) -> Result<Transition, LifecycleError> {
        self.controller().resume(self).await
    }

    async fn shutdown(&self) -> Result<Transition, LifecycleError> {
        self.controller().shutdown(self).await
    }
}

// ---------------------------------------------------------------------------
// RunGuard
// ---------------------------------------------------------------------------

/// Cheap, cloneable read-only view of a controller's state.
///
/// Handed to background tasks so they can check `is_run_allowed()` per
/// iteration without holding a reference to the service itself.
#[derive(Debug, Clone)]
pub struct RunGuard {
    state: Arc<ArcSwap<ServiceState>>,
}

impl RunGuard {
    #[must_use]
    pub fn state(&self) -> ServiceState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_run_allowed(&self) -> bool {
        self.state() == ServiceState::Started
    }
}

// ---------------------------------------------------------------------------
// ServiceController
// ---------------------------------------------------------------------------

/// Owns the state of one service and performs its transitions.
///
/// Children registered with [`add_child`](Self::add_child) make the service a
/// composite: children start before the owner and stop after it, in reverse
/// registration order.
pub struct ServiceController {
    name: String,
    state: Arc<ArcSwap<ServiceState>>,
    /// Serializes transitions; held across hook awaits.
    transition: tokio::sync::Mutex<()>,
    children: RwLock<Vec<Arc<dyn Lifecycle>>>,
}

impl fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceController")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("children", &self.children.read().len())
            .finish()
    }
}

impl ServiceController {
    /// Creates a controller in the `New` state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(ArcSwap::from_pointee(ServiceState::New)),
            transition: tokio::sync::Mutex::new(()),
            children: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_run_allowed(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Returns a shared handle to the state for use by background tasks.
    #[must_use]
    pub fn run_guard(&self) -> RunGuard {
        RunGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Registers a child service. Children added after start are picked up
    /// by the next transition.
    pub fn add_child(&self, child: Arc<dyn Lifecycle>) {
        self.children.write().push(child);
    }

    fn children(&self) -> Vec<Arc<dyn Lifecycle>> {
        self.children.read().clone()
    }

    fn set_state(&self, state: ServiceState) {
        debug!(service = %self.name, %state, "lifecycle transition");
        self.state.store(Arc::new(state));
    }

    /// Starts `service`, children first.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::start`].
    pub async fn start<S: ManagedService + ?Sized>(
        &self,
        service: &S,
    ) -> Result<Transition, LifecycleError> {
        let _transition = self.transition.lock().await;

        match self.state() {
            ServiceState::Started | ServiceState::Starting => return Ok(Transition::NoOp),
            state @ (ServiceState::Stopping
            | ServiceState::Suspending
            | ServiceState::Suspended
            | ServiceState::ShuttingDown
            | ServiceState::Shutdown) => {
                return Err(LifecycleError::InvalidState {
                    service: self.name.clone(),
                    action: "start",
                    state,
                });
            }
            ServiceState::New | ServiceState::Stopped | ServiceState::Failed => {}
        }

        self.set_state(ServiceState::Starting);

        let mut started: Vec<Arc<dyn Lifecycle>> = Vec::new();
        for child in self.children() {
            if let Err(err) = child.start().await {
                warn!(
                    service = %self.name,
                    child = child.service_name(),
                    error = %err,
                    "child failed to start; rolling back"
                );
                Self::stop_quietly(&self.name, started.iter().rev()).await;
                self.set_state(ServiceState::Failed);
                return Err(LifecycleError::Start {
                    service: self.name.clone(),
                    source: err.into(),
                });
            }
            started.push(child);
        }

        if let Err(source) = service.do_start().await {
            warn!(service = %self.name, error = %source, "start failed; rolling back");
            self.set_state(ServiceState::Stopping);
            if let Err(cleanup) = service.do_stop().await {
                // The original failure is what the caller sees.
                warn!(service = %self.name, error = %cleanup, "cleanup after failed start also failed");
            }
            Self::stop_quietly(&self.name, started.iter().rev()).await;
            self.set_state(ServiceState::Failed);
            return Err(LifecycleError::Start {
                service: self.name.clone(),
                source,
            });
        }

        self.set_state(ServiceState::Started);
        info!(service = %self.name, "service started");
        Ok(Transition::Applied)
    }

    /// Stops `service`, then its children.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::stop`].
    pub async fn stop<S: ManagedService + ?Sized>(
        &self,
        service: &S,
    ) -> Result<Transition, LifecycleError> {
        let _transition = self.transition.lock().await;
        self.stop_locked(service).await
    }

    async fn stop_locked<S: ManagedService + ?Sized>(
        &self,
        service: &S,
    ) -> Result<Transition, LifecycleError> {
        if self.state().is_stopping_or_stopped() {
            return Ok(Transition::NoOp);
        }

        self.set_state(ServiceState::Stopping);
        let own = service.do_stop().await;

        let mut first_child_error = None;
        for child in self.children().iter().rev() {
            if let Err(err) = child.stop().await {
                warn!(service = %self.name, child = child.service_name(), error = %err, "child failed to stop");
                first_child_error.get_or_insert(err);
            }
        }

        self.set_state(ServiceState::Stopped);
        info!(service = %self.name, "service stopped");

        match (own, first_child_error) {
            (Err(source), _) => Err(LifecycleError::Stop {
                service: self.name.clone(),
                source,
            }),
            (Ok(()), Some(err)) => Err(LifecycleError::Stop {
                service: self.name.clone(),
                source: err.into(),
            }),
            (Ok(()), None) => Ok(Transition::Applied),
        }
    }

    /// Suspends `service`, then its children.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::suspend`].
    pub async fn suspend<S: ManagedService + ?Sized>(
        &self,
        service: &S,
    ) -> Result<Transition, LifecycleError> {
        let _transition = self.transition.lock().await;

        if !service.supports_suspension() || self.state() != ServiceState::Started {
            return Ok(Transition::NoOp);
        }

        self.set_state(ServiceState::Suspending);
        if let Err(source) = service.do_suspend().await {
            self.set_state(ServiceState::Started);
            return Err(LifecycleError::Suspend {
                service: self.name.clone(),
                source,
            });
        }

        let mut first_child_error = None;
        for child in self.children().iter().rev() {
            if let Err(err) = child.suspend().await {
                first_child_error.get_or_insert(err);
            }
        }

        self.set_state(ServiceState::Suspended);
        info!(service = %self.name, "service suspended");

        match first_child_error {
            Some(err) => Err(LifecycleError::Suspend {
                service: self.name.clone(),
                source: err.into(),
            }),
            None => Ok(Transition::Applied),
        }
    }

    /// Resumes children, then `service`.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::resume`].
    pub async fn resume<S: ManagedService + ?Sized>(
        &self,
        service: &S,
    ) -> Result<Transition, LifecycleError> {
        let _transition = self.transition.lock().await;

        if !service.supports_suspension() || self.state() != ServiceState::Suspended {
            return Ok(Transition::NoOp);
        }

        self.set_state(ServiceState::Starting);
        for child in self.children() {
            if let Err(err) = child.resume().await {
                self.set_state(ServiceState::Suspended);
                return Err(LifecycleError::Resume {
                    service: self.name.clone(),
                    source: err.into(),
                });
            }
        }

        if let Err(source) = service.do_resume().await {
            self.set_state(ServiceState::Suspended);
            return Err(LifecycleError::Resume {
                service: self.name.clone(),
                source,
            });
        }

        self.set_state(ServiceState::Started);
        info!(service = %self.name, "service resumed");
        Ok(Transition::Applied)
    }

    /// Runs the stop path, then shuts down `service` and its children.
    ///
    /// # Errors
    ///
    /// See [`Lifecycle::shutdown`].
    pub async fn shutdown<S: ManagedService + ?Sized>(
        &self,
        service: &S,
    ) -> Result<Transition, LifecycleError> {
        let _transition = self.transition.lock().await;

        if matches!(
            self.state(),
            ServiceState::ShuttingDown | ServiceState::Shutdown
        ) {
            return Ok(Transition::NoOp);
        }

        let stopped = self.stop_locked(service).await;

        self.set_state(ServiceState::ShuttingDown);
        let own = service.do_shutdown().await;

        let mut first_child_error = None;
        for child in self.children().iter().rev() {
            if let Err(err) = child.shutdown().await {
                warn!(service = %self.name, child = child.service_name(), error = %err, "child failed to shut down");
                first_child_error.get_or_insert(err);
            }
        }

        self.set_state(ServiceState::Shutdown);
        info!(service = %self.name, "service shut down");

        stopped?;
        if let Err(source) = own {
            return Err(LifecycleError::Shutdown {
                service: self.name.clone(),
                source,
            });
        }
        if let Some(err) = first_child_error {
            return Err(LifecycleError::Shutdown {
                service: self.name.clone(),
                source: err.into(),
            });
        }
        Ok(Transition::Applied)
    }

    /// Stops already-started children after a failed start, logging failures.
    async fn stop_quietly<'a>(
        name: &str,
        children: impl Iterator<Item = &'a Arc<dyn Lifecycle>>,
    ) {
        for child in children {
            if let Err(err) = child.stop().await {
                warn!(service = %name, child = child.service_name(), error = %err, "rollback stop failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
