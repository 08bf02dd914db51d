//! Span registry.
//!
//! Correlates the spans a host framework opens on its own with the spans this
//! crate opens, and correlates provider-issued tool-call ids with the model
//! call span that requested them. Everything registered under a trace is
//! purged together, some time after the trace's invocation ends, by a
//! background cleanup loop.
//!
//! Every method takes `&self` and is safe to call from any thread.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use opentelemetry::Context;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RegistryConfig;

static GLOBAL: OnceLock<Arc<SpanRegistry>> = OnceLock::new();

#[derive(Debug)]
struct ToolCallEntry {
    parent: SpanContext,
}

#[derive(Debug, Default)]
struct TraceResources {
    own_trace_id: Option<TraceId>,
    host_span_ids: Vec<SpanId>,
    tool_call_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct CleanupRequest {
    trace_key: TraceId,
    host_span_id: SpanId,
    own_span_id: SpanId,
    deadline: Instant,
}

#[derive(Default)]
struct Maps {
    span_contexts: DashMap<SpanId, SpanContext>,
    tool_calls: DashMap<String, Arc<Mutex<ToolCallEntry>>>,
    traces: RwLock<HashMap<TraceId, TraceResources>>,
    active_invocations: DashMap<SpanId, Context>,
}

impl Maps {
    fn with_trace<R>(&self, trace_key: TraceId, f: impl FnOnce(&mut TraceResources) -> R) -> R {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        f(traces.entry(trace_key).or_default())
    }

    fn purge(&self, request: &CleanupRequest) {
        let resources = self
            .traces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request.trace_key);

        self.span_contexts.remove(&request.host_span_id);
        self.active_invocations.remove(&request.own_span_id);

        if let Some(resources) = resources {
            for span_id in &resources.host_span_ids {
                self.span_contexts.remove(span_id);
            }
            for call_id in &resources.tool_call_ids {
                self.tool_calls.remove(call_id);
            }
            debug!(
                trace_key = %request.trace_key,
                spans = resources.host_span_ids.len(),
                tool_calls = resources.tool_call_ids.len(),
                "Purged trace mappings"
            );
        }
    }
}

pub struct SpanRegistry {
    maps: Arc<Maps>,
    cleanup_tx: mpsc::Sender<CleanupRequest>,
    grace_period: Duration,
    shutdown: CancellationToken,
    loop_lost: AtomicBool,
}

impl SpanRegistry {
    /// Creates a registry and starts its cleanup loop.
    ///
    /// The loop runs on the current tokio runtime when there is one, otherwise
    /// on a dedicated thread. A loop spawned on a runtime stops with it.
    pub fn new(config: &RegistryConfig) -> Self {
        Self::start(config, Handle::try_current().ok())
    }

    /// Like [`SpanRegistry::new`], but the cleanup loop always runs on a
    /// dedicated thread and outlives any runtime.
    pub fn with_cleanup_thread(config: &RegistryConfig) -> Self {
        Self::start(config, None)
    }

    fn start(config: &RegistryConfig, handle: Option<Handle>) -> Self {
        let maps = Arc::new(Maps::default());
        let (cleanup_tx, cleanup_rx) = mpsc::channel(config.cleanup_queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        let cleanup = cleanup_loop(maps.clone(), cleanup_rx, config.tick(), shutdown.clone());
        match handle {
            Some(handle) => {
                handle.spawn(cleanup);
            }
            None => {
                let spawned = std::thread::Builder::new()
                    .name("veadk-span-cleanup".to_string())
                    .spawn(move || {
                        match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                            Ok(runtime) => runtime.block_on(cleanup),
                            Err(e) => warn!(error = %e, "Span cleanup runtime failed to start"),
                        }
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Span cleanup thread failed to start, mappings are kept");
                }
            }
        }

        Self {
            maps,
            cleanup_tx,
            grace_period: config.grace_period(),
            shutdown,
            loop_lost: AtomicBool::new(false),
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<SpanRegistry> {
        Self::global_with(&RegistryConfig::default())
    }

    /// Like [`SpanRegistry::global`]; `config` only applies if this call creates it.
    pub fn global_with(config: &RegistryConfig) -> Arc<SpanRegistry> {
        GLOBAL.get_or_init(|| Arc::new(SpanRegistry::with_cleanup_thread(config))).clone()
    }

    /// Maps the host's run span to the own invocation span in `own`, and
    /// tracks that span as an active invocation.
    pub fn register_run_mapping(
        &self,
        host_span_id: SpanId,
        host_trace_id: TraceId,
        own: &Context,
    ) {
        let own_span_context = own.span().span_context().clone();
        if !self.register(host_span_id, host_trace_id, &own_span_context) {
            return;
        }
        self.maps.active_invocations.insert(own_span_context.span_id(), own.clone());
    }

    pub fn register_agent_mapping(
        &self,
        host_span_id: SpanId,
        host_trace_id: TraceId,
        own: &SpanContext,
    ) {
        self.register(host_span_id, host_trace_id, own);
    }

    pub fn register_llm_mapping(
        &self,
        host_span_id: SpanId,
        host_trace_id: TraceId,
        own: &SpanContext,
    ) {
        self.register(host_span_id, host_trace_id, own);
    }

    /// Maps a host tool span whose id is known synchronously.
    ///
    /// The entry is attributed to the trace whose own trace id matches
    /// `own_parent`, so it is purged along with it.
    pub fn register_tool_mapping(&self, host_tool_span_id: SpanId, own_parent: &SpanContext) {
        if host_tool_span_id == SpanId::INVALID || !own_parent.is_valid() {
            return;
        }
        self.maps.span_contexts.insert(host_tool_span_id, own_parent.clone());

        let own_trace_id = own_parent.trace_id();
        let mut traces = self.maps.traces.write().unwrap_or_else(PoisonError::into_inner);
        let key = traces
            .iter()
            .find(|(_, resources)| resources.own_trace_id == Some(own_trace_id))
            .map(|(key, _)| *key)
            .unwrap_or(own_trace_id);
        let resources = traces.entry(key).or_default();
        resources.own_trace_id.get_or_insert(own_trace_id);
        resources.host_span_ids.push(host_tool_span_id);
    }

    /// Maps a provider-issued tool-call id to the span that requested the call.
    pub fn register_tool_call_mapping(
        &self,
        tool_call_id: &str,
        trace_key: TraceId,
        parent: &SpanContext,
    ) {
        if tool_call_id.is_empty() || trace_key == TraceId::INVALID || !parent.is_valid() {
            return;
        }

        let existing = match self.maps.tool_calls.entry(tool_call_id.to_string()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(ToolCallEntry { parent: parent.clone() })));
                None
            }
        };

        match existing {
            // Streamed responses repeat the same call in later chunks.
            Some(entry) => {
                entry.lock().unwrap_or_else(PoisonError::into_inner).parent = parent.clone();
            }
            None => self.maps.with_trace(trace_key, |resources| {
                resources.own_trace_id.get_or_insert(parent.trace_id());
                resources.tool_call_ids.push(tool_call_id.to_string());
            }),
        }
        debug!(tool_call_id, parent = %parent.span_id(), "Registered tool call mapping");
    }

    /// Tracks an invocation span that has no host counterpart, so it can still
    /// be force-ended at shutdown and purged by trace key.
    pub fn track_invocation_span(&self, trace_key: TraceId, own: &Context) {
        let span_context = own.span().span_context().clone();
        if trace_key == TraceId::INVALID || !span_context.is_valid() {
            return;
        }
        self.maps.with_trace(trace_key, |resources| {
            resources.own_trace_id.get_or_insert(span_context.trace_id());
        });
        self.maps.active_invocations.insert(span_context.span_id(), own.clone());
    }

    pub fn get_own_span_context(&self, host_span_id: SpanId) -> Option<SpanContext> {
        self.maps.span_contexts.get(&host_span_id).map(|entry| entry.value().clone())
    }

    pub fn get_own_parent_by_tool_call_id(&self, tool_call_id: &str) -> Option<SpanContext> {
        let entry = self.maps.tool_calls.get(tool_call_id).map(|entry| entry.value().clone())?;
        let parent = entry.lock().unwrap_or_else(PoisonError::into_inner).parent.clone();
        Some(parent)
    }

    pub fn get_own_trace_id(&self, host_trace_id: TraceId) -> Option<TraceId> {
        let traces = self.maps.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces.get(&host_trace_id).and_then(|resources| resources.own_trace_id)
    }

    /// Queues deletion of everything registered under `trace_key` once the
    /// grace period has elapsed, and stops tracking the invocation span.
    ///
    /// Never blocks: when the queue is full the request is dropped and the
    /// mappings live on until the process exits.
    pub fn schedule_cleanup(&self, trace_key: TraceId, host_span_id: SpanId, own_span_id: SpanId) {
        self.maps.active_invocations.remove(&own_span_id);
        if trace_key == TraceId::INVALID {
            return;
        }

        let request = CleanupRequest {
            trace_key,
            host_span_id,
            own_span_id,
            deadline: Instant::now() + self.grace_period,
        };
        match self.cleanup_tx.try_send(request) {
            Ok(()) => debug!(trace_key = %trace_key, "Scheduled trace cleanup"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(trace_key = %trace_key, "Cleanup queue full, dropping cleanup request");
            }
            Err(mpsc::error::TrySendError::Closed(_)) if self.is_shut_down() => {
                debug!(trace_key = %trace_key, "Registry shut down, dropping cleanup request");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if !self.loop_lost.swap(true, Ordering::Relaxed) {
                    warn!(
                        trace_key = %trace_key,
                        "Span cleanup loop stopped with its runtime, mappings are no longer purged"
                    );
                }
            }
        }
    }

    /// Ends every invocation span still open. Safe to call repeatedly.
    pub fn end_all_invocation_spans(&self) -> usize {
        let span_ids: Vec<SpanId> =
            self.maps.active_invocations.iter().map(|entry| *entry.key()).collect();

        let mut ended = 0;
        for span_id in span_ids {
            if let Some((_, cx)) = self.maps.active_invocations.remove(&span_id) {
                let span = cx.span();
                if span.is_recording() {
                    span.end();
                    ended += 1;
                }
            }
        }
        if ended > 0 {
            debug!(count = ended, "Force-ended open invocation spans");
        }
        ended
    }

    /// Stops the cleanup loop. Pending requests are abandoned.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether cleanup requests are still being accepted and served.
    pub fn is_cleanup_running(&self) -> bool {
        !self.is_shut_down() && !self.cleanup_tx.is_closed()
    }

    pub fn span_mapping_count(&self) -> usize {
        self.maps.span_contexts.len()
    }

    pub fn tool_call_count(&self) -> usize {
        self.maps.tool_calls.len()
    }

    pub fn trace_count(&self) -> usize {
        self.maps.traces.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_invocation_count(&self) -> usize {
        self.maps.active_invocations.len()
    }

    fn register(&self, host_span_id: SpanId, host_trace_id: TraceId, own: &SpanContext) -> bool {
        if host_span_id == SpanId::INVALID || host_trace_id == TraceId::INVALID || !own.is_valid() {
            debug!("Skipping mapping with invalid identifiers");
            return false;
        }
        self.maps.span_contexts.insert(host_span_id, own.clone());
        self.maps.with_trace(host_trace_id, |resources| {
            resources.own_trace_id.get_or_insert(own.trace_id());
            resources.host_span_ids.push(host_span_id);
        });
        true
    }
}

impl Drop for SpanRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for SpanRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanRegistry")
            .field("span_mappings", &self.span_mapping_count())
            .field("tool_calls", &self.tool_call_count())
            .field("traces", &self.trace_count())
            .field("active_invocations", &self.active_invocation_count())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

async fn cleanup_loop(
    maps: Arc<Maps>,
    mut requests: mpsc::Receiver<CleanupRequest>,
    tick: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: Vec<CleanupRequest> = Vec::new();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(request) = requests.recv() => pending.push(request),
            _ = ticker.tick() => {
                let now = Instant::now();
                let (due, waiting): (Vec<_>, Vec<_>) =
                    pending.into_iter().partition(|request| request.deadline <= now);
                pending = waiting;
                for request in &due {
                    maps.purge(request);
                }
            }
        }
    }
    debug!(abandoned = pending.len(), "Span cleanup loop stopped");
}
