//! Hook Dispatcher - runs registered handlers in order with fault isolation

use chrono::Utc;
use mailhook_common::config::PipelineConfig;
use mailhook_common::types::{HookName, HookOutcome};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::handler::{HookArgs, HookFuture, HookHandler};
use super::registry::{HookRegistry, RegisteredHandler};
use crate::plugins::{PluginError, PluginHealth, PluginStatus};
use crate::transaction::{ActiveHandler, Transaction};

/// Dispatcher tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Per-handler time limit. `None` lets a handler run until it completes.
    pub handler_timeout: Option<Duration>,
    /// Consecutive faults before a plugin's handlers are bypassed, 0 disables.
    /// Breaker state is shared by every transaction on this dispatcher.
    pub circuit_threshold: u32,
    /// Time a tripped circuit stays open before the plugin is retried
    pub circuit_reset: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: None,
            circuit_threshold: 0,
            circuit_reset: Duration::from_secs(60),
        }
    }
}

impl From<&PipelineConfig> for DispatcherConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            handler_timeout: config.handler_timeout_ms.map(Duration::from_millis),
            circuit_threshold: config.circuit_threshold,
            circuit_reset: Duration::from_secs(config.circuit_reset_secs),
        }
    }
}

/// Progress of one hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Pending,
    /// Handler at this index is running
    Running(usize),
    /// A handler returned DONE, the rest of the hook is skipped
    Skipped,
    /// A handler returned DENY
    Denied,
    Complete,
}

/// How a handler failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Handler returned an error
    Error,
    /// Handler found expected transaction state missing
    Malformed,
    Panic,
    Timeout,
}

/// A handler failure that was absorbed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFault {
    pub plugin: String,
    pub index: usize,
    pub kind: FaultKind,
    pub message: String,
}

/// Result of dispatching one hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub hook: HookName,
    /// Final outcome. CONTINUE unless a handler returned DONE or DENY.
    pub outcome: HookOutcome,
    /// State transitions, starting at `Pending`
    pub transitions: Vec<DispatchState>,
    /// Plugins whose handlers ran, in order
    pub executed: Vec<String>,
    /// Plugins bypassed because their circuit was open
    pub bypassed: Vec<String>,
    pub faults: Vec<HandlerFault>,
}

impl DispatchReport {
    fn new(hook: HookName) -> Self {
        Self {
            hook,
            outcome: HookOutcome::Continue,
            transitions: vec![DispatchState::Pending],
            executed: Vec::new(),
            bypassed: Vec::new(),
            faults: Vec::new(),
        }
    }

    fn enter(&mut self, state: DispatchState) {
        self.transitions.push(state);
    }

    /// Terminal state: `Complete` or `Denied`
    pub fn state(&self) -> DispatchState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(DispatchState::Pending)
    }

    pub fn is_denied(&self) -> bool {
        self.state() == DispatchState::Denied
    }
}

/// Circuit breaker state for a plugin
#[derive(Debug, Clone, Default)]
struct CircuitBreakerState {
    failure_count: u32,
    last_failure: Option<Instant>,
    is_open: bool,
}

#[derive(Debug, Clone, Default)]
struct HealthStats {
    success_count: u64,
    error_count: u32,
    total_ms: f64,
    last_error: Option<String>,
}

/// Runs the handlers registered for a hook
#[derive(Debug)]
pub struct Dispatcher {
    registry: HookRegistry,
    config: DispatcherConfig,
    circuit_breakers: RwLock<HashMap<String, CircuitBreakerState>>,
    stats: RwLock<HashMap<String, HealthStats>>,
}

impl Dispatcher {
    pub fn new(registry: HookRegistry) -> Self {
        Self::with_config(registry, DispatcherConfig::default())
    }

    pub fn with_config(registry: HookRegistry, config: DispatcherConfig) -> Self {
        Self {
            registry,
            config,
            circuit_breakers: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run every handler registered for `hook`, in order, against `txn`.
    ///
    /// Each handler is awaited before the next one starts. Handler errors,
    /// panics and timeouts are logged once and treated as CONTINUE. DONE
    /// skips the remaining handlers, DENY stops the hook and is returned.
    pub async fn dispatch(&self, hook: HookName, txn: &mut Transaction, args: &HookArgs) -> DispatchReport {
        let span = info_span!("dispatch", hook = %hook, transaction_id = %txn.id());
        self.run(hook, txn, args).instrument(span).await
    }

    async fn run(&self, hook: HookName, txn: &mut Transaction, args: &HookArgs) -> DispatchReport {
        let mut report = DispatchReport::new(hook);
        let handlers = self.registry.handlers(hook);
        debug!(handlers = handlers.len(), "Dispatching hook");

        for (index, entry) in handlers.iter().enumerate() {
            if self.is_circuit_open(&entry.plugin).await {
                warn!(plugin = %entry.plugin, "Circuit breaker open, bypassing handler");
                report.bypassed.push(entry.plugin.clone());
                continue;
            }

            report.enter(DispatchState::Running(index));
            txn.set_current_handler(Some(ActiveHandler {
                hook,
                index,
                plugin: entry.plugin.clone(),
            }));

            let started = Instant::now();
            let result = self.invoke(entry, &mut *txn, args).await;
            let elapsed = started.elapsed();

            txn.set_current_handler(None);
            report.executed.push(entry.plugin.clone());

            match result {
                Ok(HookOutcome::Continue) => {
                    self.record_success(&entry.plugin, elapsed).await;
                }
                Ok(HookOutcome::Done) => {
                    self.record_success(&entry.plugin, elapsed).await;
                    debug!(plugin = %entry.plugin, "Handler finished the hook early");
                    report.outcome = HookOutcome::Done;
                    report.enter(DispatchState::Skipped);
                    break;
                }
                Ok(HookOutcome::Deny(reply)) => {
                    self.record_success(&entry.plugin, elapsed).await;
                    info!(
                        plugin = %entry.plugin,
                        code = reply.code,
                        reply = %reply.message,
                        "Handler denied transaction"
                    );
                    report.outcome = HookOutcome::Deny(reply);
                    report.enter(DispatchState::Denied);
                    return report;
                }
                Err((kind, message)) => {
                    let transaction_id = txn.id();
                    if kind == FaultKind::Malformed {
                        warn!(
                            plugin = %entry.plugin,
                            %transaction_id,
                            "Handler skipped, transaction state missing: {}",
                            message
                        );
                        self.record_success(&entry.plugin, elapsed).await;
                    } else {
                        error!(
                            plugin = %entry.plugin,
                            %transaction_id,
                            "Hook handler failed, continuing: {}",
                            message
                        );
                        self.record_failure(&entry.plugin, &message).await;
                    }
                    report.faults.push(HandlerFault {
                        plugin: entry.plugin.clone(),
                        index,
                        kind,
                        message,
                    });
                }
            }
        }

        report.enter(DispatchState::Complete);
        report
    }

    /// Start and await one handler, folding every failure mode into a fault
    async fn invoke(
        &self,
        entry: &RegisteredHandler,
        txn: &mut Transaction,
        args: &HookArgs,
    ) -> Result<HookOutcome, (FaultKind, String)> {
        let future = start(entry.handler.as_ref(), txn, args)
            .map_err(|message| (FaultKind::Panic, format!("handler panicked: {}", message)))?;
        let call = CatchPanic { inner: future };

        let result = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    let err = PluginError::Timeout(format!("no completion after {}ms", limit.as_millis()));
                    return Err((FaultKind::Timeout, err.to_string()));
                }
            },
            None => call.await,
        };

        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) if err.is_malformed() => Err((FaultKind::Malformed, err.to_string())),
            Ok(Err(err)) => Err((FaultKind::Error, err.to_string())),
            Err(message) => Err((FaultKind::Panic, format!("handler panicked: {}", message))),
        }
    }

    /// Check if circuit breaker is open for a plugin
    async fn is_circuit_open(&self, plugin: &str) -> bool {
        if self.config.circuit_threshold == 0 {
            return false;
        }

        let breakers = self.circuit_breakers.read().await;
        match breakers.get(plugin) {
            Some(state) if state.is_open => match state.last_failure {
                Some(last) => last.elapsed() < self.config.circuit_reset,
                None => false,
            },
            _ => false,
        }
    }

    async fn record_success(&self, plugin: &str, elapsed: Duration) {
        {
            let mut breakers = self.circuit_breakers.write().await;
            if let Some(state) = breakers.get_mut(plugin) {
                *state = CircuitBreakerState::default();
            }
        }

        let mut stats = self.stats.write().await;
        let entry = stats.entry(plugin.to_string()).or_default();
        entry.success_count += 1;
        entry.total_ms += elapsed.as_secs_f64() * 1000.0;
    }

    async fn record_failure(&self, plugin: &str, message: &str) {
        {
            let mut breakers = self.circuit_breakers.write().await;
            let state = breakers.entry(plugin.to_string()).or_default();
            state.failure_count += 1;
            state.last_failure = Some(Instant::now());

            if self.config.circuit_threshold > 0
                && state.failure_count >= self.config.circuit_threshold
                && !state.is_open
            {
                state.is_open = true;
                warn!(
                    plugin = %plugin,
                    failures = state.failure_count,
                    "Circuit breaker opened"
                );
            }
        }

        let mut stats = self.stats.write().await;
        let entry = stats.entry(plugin.to_string()).or_default();
        entry.error_count += 1;
        entry.last_error = Some(message.to_string());
    }

    /// Health snapshot for every plugin that has run at least once
    pub async fn plugin_health(&self) -> HashMap<String, PluginHealth> {
        let stats = self.stats.read().await;
        let mut health = HashMap::with_capacity(stats.len());

        for (plugin, entry) in stats.iter() {
            let status = if self.is_circuit_open(plugin).await {
                PluginStatus::CircuitOpen
            } else if self.consecutive_failures(plugin).await > 0 {
                PluginStatus::Degraded
            } else {
                PluginStatus::Active
            };

            let avg_response_ms = if entry.success_count > 0 {
                entry.total_ms / entry.success_count as f64
            } else {
                0.0
            };

            health.insert(
                plugin.clone(),
                PluginHealth {
                    status,
                    last_check: Utc::now(),
                    message: entry.last_error.clone(),
                    error_count: entry.error_count,
                    success_count: entry.success_count,
                    avg_response_ms,
                },
            );
        }

        health
    }

    async fn consecutive_failures(&self, plugin: &str) -> u32 {
        self.circuit_breakers
            .read()
            .await
            .get(plugin)
            .map(|s| s.failure_count)
            .unwrap_or(0)
    }
}

/// Create the handler's future, catching a panic raised before the first poll
fn start<'a>(
    handler: &'a dyn HookHandler,
    txn: &'a mut Transaction,
    args: &'a HookArgs,
) -> Result<HookFuture<'a>, String> {
    panic::catch_unwind(AssertUnwindSafe(move || {
        let txn = txn;
        handler.call(txn, args)
    }))
    .map_err(panic_message)
}

/// Future wrapper converting a panic during poll into an error
struct CatchPanic<F> {
    inner: F,
}

impl<F> Future for CatchPanic<F>
where
    F: Future + Unpin,
{
    type Output = Result<F::Output, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.inner;
        match panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(payload) => Poll::Ready(Err(panic_message(payload))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
