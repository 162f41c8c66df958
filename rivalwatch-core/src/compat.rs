//! Host capability detection for subprocess spawning.
//!
//! Some hosts cannot drive child processes from the async reactor. On those
//! hosts the crawler worker is spawned with [`SpawnPolicy::Blocking`], which
//! drives the child from dedicated threads instead. [`CompatShim`] selects the
//! policy once per process and wraps calls that may surface the
//! "unsupported" signal with a single reinstall-and-retry step.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Unix,
    Windows,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostProfile {
    pub os_family: OsFamily,
}

impl HostProfile {
    pub fn detect() -> Self {
        let os_family = if cfg!(windows) {
            OsFamily::Windows
        } else if cfg!(unix) {
            OsFamily::Unix
        } else {
            OsFamily::Other
        };
        Self { os_family }
    }

    pub fn new(os_family: OsFamily) -> Self {
        Self { os_family }
    }

    /// Whether the default async reactor on this host lacks reliable
    /// subprocess support.
    pub fn is_affected(&self) -> bool {
        matches!(self.os_family, OsFamily::Windows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpawnPolicy {
    /// Child processes are driven by the tokio reactor.
    Async = 1,
    /// Child processes are spawned with std and pumped from OS threads.
    Blocking = 2,
}

impl SpawnPolicy {
    pub fn for_host(host: &HostProfile) -> Self {
        if host.is_affected() {
            SpawnPolicy::Blocking
        } else {
            SpawnPolicy::Async
        }
    }

    /// The policy known to support subprocesses on every host.
    pub fn compatible() -> Self {
        SpawnPolicy::Blocking
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SpawnPolicy::Async),
            2 => Some(SpawnPolicy::Blocking),
            _ => None,
        }
    }
}

impl fmt::Display for SpawnPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnPolicy::Async => f.write_str("async"),
            SpawnPolicy::Blocking => f.write_str("blocking"),
        }
    }
}

/// Raised when the host cannot spawn a subprocess under the current policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subprocess spawning not supported by the scheduler: {0}")]
pub struct SchedulerUnsupported(pub String);

pub trait SchedulerSignal {
    fn is_scheduler_unsupported(&self) -> bool;
}

impl SchedulerSignal for SchedulerUnsupported {
    fn is_scheduler_unsupported(&self) -> bool {
        true
    }
}

impl SchedulerSignal for io::Error {
    fn is_scheduler_unsupported(&self) -> bool {
        self.kind() == io::ErrorKind::Unsupported
    }
}

/// Value returned by [`CompatShim::guarded`] when both the retry and the
/// fallback are unavailable.
pub trait Neutral {
    fn neutral() -> Self;
}

impl<T> Neutral for Vec<T> {
    fn neutral() -> Self {
        Vec::new()
    }
}

impl<T> Neutral for Option<T> {
    fn neutral() -> Self {
        None
    }
}

impl Neutral for () {
    fn neutral() -> Self {}
}

const UNINITIALIZED: u8 = 0;

#[derive(Debug)]
pub struct CompatShim {
    host: HostProfile,
    policy: AtomicU8,
    reinstalls: AtomicUsize,
}

static GLOBAL: OnceLock<Arc<CompatShim>> = OnceLock::new();

impl CompatShim {
    pub fn new(host: HostProfile) -> Self {
        Self {
            host,
            policy: AtomicU8::new(UNINITIALIZED),
            reinstalls: AtomicUsize::new(0),
        }
    }

    /// Process-wide shim for the detected host.
    pub fn global() -> Arc<CompatShim> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let shim = CompatShim::new(HostProfile::detect());
            shim.initialize();
            Arc::new(shim)
        }))
    }

    pub fn host(&self) -> HostProfile {
        self.host
    }

    pub fn is_initialized(&self) -> bool {
        self.policy.load(Ordering::Acquire) != UNINITIALIZED
    }

    /// Selects the spawn policy for the host. Only the first call has an effect.
    pub fn initialize(&self) -> SpawnPolicy {
        let selected = SpawnPolicy::for_host(&self.host);
        match self.policy.compare_exchange(
            UNINITIALIZED,
            selected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                info!(host = ?self.host.os_family, policy = %selected, "spawn policy installed");
                selected
            }
            Err(current) => SpawnPolicy::from_u8(current).unwrap_or(selected),
        }
    }

    pub fn policy(&self) -> SpawnPolicy {
        let current = self.policy.load(Ordering::Acquire);
        match SpawnPolicy::from_u8(current) {
            Some(policy) => policy,
            None => self.initialize(),
        }
    }

    pub fn reinstall_count(&self) -> usize {
        self.reinstalls.load(Ordering::Acquire)
    }

    fn reinstall(&self) {
        let policy = SpawnPolicy::compatible();
        self.policy.store(policy as u8, Ordering::Release);
        self.reinstalls.fetch_add(1, Ordering::AcqRel);
        info!(policy = %policy, "compatible spawn policy reinstalled");
    }

    /// Runs `operation`, recovering from the scheduler-unsupported signal on
    /// affected hosts: reinstall the compatible policy, retry once, and hand
    /// over to `fallback` if the retry fails for any reason. Errors other than
    /// the signal on the first attempt are returned unchanged, and on
    /// unaffected hosts the call is a plain passthrough.
    pub async fn guarded_call<T, E, Op, Fut, Fb, FbFut>(
        &self,
        operation: Op,
        fallback: Fb,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: SchedulerSignal + fmt::Display,
        Fb: FnOnce(SchedulerUnsupported) -> FbFut,
        FbFut: Future<Output = T>,
    {
        self.run_guarded(operation, fallback).await
    }

    /// Like [`guarded_call`](Self::guarded_call) without a fallback: an
    /// exhausted retry yields the neutral value for `T`.
    pub async fn guarded<T, E, Op, Fut>(&self, operation: Op) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: SchedulerSignal + fmt::Display,
        T: Neutral,
    {
        self.run_guarded(operation, |signal| async move {
            debug!(error = %signal, "no fallback supplied, returning neutral value");
            T::neutral()
        })
        .await
    }

    async fn run_guarded<T, E, Op, Fut, Fb, FbFut>(
        &self,
        mut operation: Op,
        fallback: Fb,
    ) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: SchedulerSignal + fmt::Display,
        Fb: FnOnce(SchedulerUnsupported) -> FbFut,
        FbFut: Future<Output = T>,
    {
        self.initialize();
        if !self.host.is_affected() {
            return operation().await;
        }

        match operation().await {
            Err(err) if err.is_scheduler_unsupported() => {
                warn!(error = %err, "scheduler rejected subprocess, retrying with compatible policy");
                self.reinstall();
                match operation().await {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        warn!(
                            error = %err,
                            still_unsupported = err.is_scheduler_unsupported(),
                            "retry with compatible policy failed, using fallback"
                        );
                        Ok(fallback(SchedulerUnsupported(err.to_string())).await)
                    }
                }
            }
            other => other,
        }
    }
}
