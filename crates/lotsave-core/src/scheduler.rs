//! Per-entity tick scheduler.
//!
//! Each entity owns a [`TickScheduler`] mapping an absolute tick to the calls
//! pending for it. The engine drains one bucket per entity per tick.

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::id::{TableId, Tick};
use crate::runtime::{RuntimeError, ScriptRuntime};
use crate::value::Value;

/// One scheduled method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub method: String,
    pub arguments: Vec<Value>,
}

impl PendingCall {
    pub fn new(method: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// A scheduled call that raised.
#[derive(Debug)]
pub struct CallFailure {
    pub method: String,
    pub error: RuntimeError,
}

/// Outcome of draining one bucket.
#[derive(Debug, Default)]
pub struct ExecuteReport {
    /// Calls that ran, including the ones that failed.
    pub invoked: usize,
    pub failures: Vec<CallFailure>,
}

impl ExecuteReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickScheduler {
    buckets: BTreeMap<Tick, Vec<PendingCall>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call to the bucket for `at`, creating it if absent.
    pub fn register_callback(&mut self, method: &str, args: Vec<Value>, at: Tick) {
        self.buckets
            .entry(at)
            .or_default()
            .push(PendingCall::new(method, args));
    }

    /// Schedule a call for the tick after `current`. Returns that tick.
    pub fn defer_callback(&mut self, method: &str, args: Vec<Value>, current: Tick) -> Tick {
        let at = current + 1;
        self.register_callback(method, args, at);
        at
    }

    /// Replace the bucket for `at` wholesale. Used when restoring a schedule.
    pub fn insert_bucket(&mut self, at: Tick, calls: Vec<PendingCall>) {
        if calls.is_empty() {
            self.buckets.remove(&at);
        } else {
            self.buckets.insert(at, calls);
        }
    }

    pub fn pending_at(&self, at: Tick) -> &[PendingCall] {
        self.buckets.get(&at).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ticks with pending calls, ascending.
    pub fn ticks(&self) -> impl Iterator<Item = Tick> + '_ {
        self.buckets.keys().copied()
    }

    pub fn buckets(&self) -> impl Iterator<Item = (Tick, &[PendingCall])> {
        self.buckets.iter().map(|(t, calls)| (*t, calls.as_slice()))
    }

    /// Total number of pending calls.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    /// Every argument value, for the collector.
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.buckets
            .values()
            .flatten()
            .flat_map(|call| call.arguments.iter().cloned())
    }

    /// Run the calls scheduled for `tick` against `this`, in insertion order.
    ///
    /// The bucket is removed before the first call, so executing an
    /// already-drained tick does nothing. Calls registered for `tick` while
    /// it drains are moved to `tick + 1`, after any calls already there. A
    /// failing call is logged and recorded; the remaining calls still run.
    pub fn execute(
        &mut self,
        runtime: &mut ScriptRuntime,
        this: TableId,
        tick: Tick,
    ) -> ExecuteReport {
        let mut report = ExecuteReport::default();
        let Some(calls) = self.buckets.remove(&tick) else {
            return report;
        };

        for call in calls {
            report.invoked += 1;
            if let Err(err) =
                runtime.call_method(this, &call.method, &call.arguments, tick, Some(&mut *self))
            {
                error!(tick, method = %call.method, error = %err, "scheduled call failed");
                report.failures.push(CallFailure {
                    method: call.method,
                    error: err,
                });
            }
        }
        if let Some(late) = self.buckets.remove(&tick) {
            warn!(tick, calls = late.len(), "calls registered for the running tick moved to the next");
            self.buckets.entry(tick + 1).or_default().extend(late);
        }
        debug!(tick, invoked = report.invoked, failed = report.failures.len(), "bucket drained");
        report
    }
}
