use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use mea::condvar::Condvar;
use mea::mutex::Mutex;

/// Tracks accept-loop shutdown and in-flight non-hijacked requests so
/// `Stop` can ask the server to stop accepting and wait (up to its
/// budget) for those requests to drain. CONNECT sessions never take an
/// [`InflightGuard`], matching the spec's "hijacked sessions are not
/// waited on" limitation.
#[derive(Clone)]
pub struct GracefulShutdown {
    inner: Arc<Inner>,
}

struct Inner {
    shutting_down: AtomicBool,
    inflight: AtomicU64,
    gate: Mutex<()>,
    cv: Condvar,
}

pub struct InflightGuard {
    inner: Arc<Inner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.cv.notify_all();
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shutting_down: AtomicBool::new(false),
                inflight: AtomicU64::new(0),
                gate: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn initiate(&self) {
        if self.inner.shutting_down.swap(true, Ordering::Release) {
            return;
        }
        self.inner.cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub async fn wait_shutting_down(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while !self.is_shutting_down() {
            guard = self.inner.cv.wait(guard).await;
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard {
        self.inner.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            inner: self.inner.clone(),
        }
    }

    pub async fn wait_inflight_zero(&self) {
        if self.inner.inflight.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while self.inner.inflight.load(Ordering::Acquire) != 0 {
            guard = self.inner.cv.wait(guard).await;
        }
    }
}

/// Installs the process's Ctrl-C handler and returns a future that
/// resolves once the signal arrives. Used by the CLI entry point to
/// drive `Stop`; the proxy itself never touches process-wide signals.
pub fn install_ctrlc() -> Result<ctrlc2::AsyncCtrlC> {
    let ctrlc = ctrlc2::AsyncCtrlC::new(move || {
        println!("Ctrl-C received, shutting down...");
        true
    })?;
    Ok(ctrlc)
}
