//! Session and transport engine
//!
//! Owns the device registry, the session tables and the call path. The
//! state machine itself is synchronous and guarded by plain mutexes, the
//! way the blocking USB libraries want to be driven; the async facade runs
//! every operation on the blocking pool so HTTP handlers stay responsive.
//!
//! Locks, in acquisition order (always this order):
//!
//! 1. sessions mutex — session maps + device registry;
//! 2. call mutex — the `calls_in_progress` gauge; held for the whole of
//!    `enumerate` so enumeration and call startup exclude each other;
//! 3. last-infos mutex — the cached enumeration, narrow so the background
//!    refresh can peek without blocking calls.
//!
//! The per-session in-flight flag is deliberately an atomic outside the
//! sessions mutex: `call` drops the mutex right after session lookup, so
//! one long transfer serializes neither enumeration nor other sessions'
//! calls.

pub mod error;
pub mod io;
pub mod registry;
pub mod session;

pub use error::{CoreError, Result};

use protocol::{DeviceType, EnumerateEntry, Message, ProtocolError};
use registry::DeviceRegistry;
use session::{Session, SessionTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use transport::{Device, DeviceInfo, TransportBus};

/// Long-poll budget: iterations x delay gives the ~5 minute cap.
const ITER_MAX: usize = 600;
const ITER_DELAY: Duration = Duration::from_millis(500);

/// Freshly attached devices transiently refuse to open; retry a few times.
const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// What a call does with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Default)]
struct Guarded {
    sessions: SessionTable,
    registry: DeviceRegistry,
}

#[derive(Default)]
struct CallState {
    calls_in_progress: u32,
}

struct CoreInner {
    bus: TransportBus,
    sessions: Mutex<Guarded>,
    call_state: Mutex<CallState>,
    /// Enumeration served while calls are in progress, to keep libusb off
    /// the bus mid-transfer.
    last_infos: Mutex<Vec<DeviceInfo>>,
    allow_stealing: bool,
    reset: bool,
    runtime: Handle,
}

/// Handle on the engine; cheap to clone.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Build the engine and start the background refresh.
    ///
    /// `allow_stealing` is set where the transports can interrupt an
    /// in-flight transfer; `reset` enables the USB device reset on acquire.
    /// Must be called within a tokio runtime.
    pub fn new(bus: TransportBus, allow_stealing: bool, reset: bool) -> Self {
        let inner = Arc::new(CoreInner {
            bus,
            sessions: Mutex::new(Guarded::default()),
            call_state: Mutex::new(CallState::default()),
            last_infos: Mutex::new(Vec::new()),
            allow_stealing,
            reset,
            runtime: Handle::current(),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("enum-refresh".into())
            .spawn(move || background_refresh(weak))
            .expect("spawning the refresh thread");

        Core { inner }
    }

    /// Current enumeration joined with both session maps. Never returns
    /// stale sessions: devices that stopped enumerating are force-released.
    pub async fn enumerate(&self) -> Result<Vec<EnumerateEntry>> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.enumerate()).await
    }

    /// Claim a device interface. `previous` is the session id the client
    /// believes currently holds the device (None for unheld).
    pub async fn acquire(
        &self,
        path: String,
        previous: Option<String>,
        debug: bool,
    ) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.acquire(&path, previous.as_deref(), debug)).await
    }

    pub async fn release(&self, session_id: String, debug: bool) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || {
            let mut guard = inner.sessions.lock().unwrap();
            inner.release_locked(&mut guard, &session_id, false, debug)
        })
        .await
    }

    /// Run one transfer on a session. Cancelling `cancel` while the
    /// transfer is blocked releases the session, which unblocks the
    /// transfer best-effort.
    pub async fn call(
        &self,
        cancel: CancellationToken,
        msg: Option<Message>,
        session_id: String,
        mode: CallMode,
        debug: bool,
    ) -> Result<Option<Message>> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.call(cancel, msg, &session_id, mode, debug)).await
    }

    /// Long-poll until the enumeration differs from `baseline`, the caller
    /// cancels (returns `None`), or the iteration budget runs out (returns
    /// the last read; clients re-listen).
    pub async fn listen(
        &self,
        cancel: CancellationToken,
        baseline: Vec<EnumerateEntry>,
    ) -> Result<Option<Vec<EnumerateEntry>>> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.listen(&cancel, baseline)).await
    }

    /// Called on program exit.
    pub fn close(&self) {
        self.inner.bus.close();
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) => Err(CoreError::Internal(err.to_string())),
    }
}

fn background_refresh(core: Weak<CoreInner>) {
    // retires ids of devices unplugged while nobody is long-polling;
    // quiescent until an enumeration has tracked at least one device
    loop {
        thread::sleep(ITER_DELAY);
        let Some(core) = core.upgrade() else {
            return;
        };
        let tracked = core.last_infos.lock().unwrap().len();
        if tracked > 0 {
            trace!("background enumeration");
            if let Err(err) = core.enumerate() {
                debug!("background enumeration failed: {err}");
            }
        }
    }
}

/// Decrements `calls_in_progress` on every exit path.
struct CallsGauge<'a> {
    core: &'a CoreInner,
}

impl Drop for CallsGauge<'_> {
    fn drop(&mut self) {
        self.core.call_state.lock().unwrap().calls_in_progress -= 1;
    }
}

/// Lowers the session in-flight flag on every exit path.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tells the cancellation watcher the call finished, on every exit path.
struct DoneGuard(Option<oneshot::Sender<()>>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

impl CoreInner {
    fn enumerate(&self) -> Result<Vec<EnumerateEntry>> {
        let mut guard = self.sessions.lock().unwrap();
        let call_state = self.call_state.lock().unwrap();
        let mut last_infos = self.last_infos.lock().unwrap();

        let infos = if call_state.calls_in_progress == 0 {
            let observed = self.bus.enumerate()?;
            let infos = guard.registry.reconcile(observed);
            *last_infos = infos.clone();
            infos
        } else {
            // a transfer is running; contending with libusb now is what the
            // cached list exists to avoid
            trace!(
                calls = call_state.calls_in_progress,
                "enumerate served from cache"
            );
            last_infos.clone()
        };

        let entries = build_entries(&guard.sessions, &infos);

        let present: Vec<&str> = infos.iter().map(|info| info.path.as_str()).collect();
        self.release_disconnected(&mut guard, &present, false);
        self.release_disconnected(&mut guard, &present, true);

        Ok(entries)
    }

    fn release_disconnected(&self, guard: &mut Guarded, present: &[&str], debug: bool) {
        for id in guard.sessions.disconnected_ids(present, debug) {
            info!(session = %id, "device disconnected, releasing session");
            if let Err(err) = self.release_locked(guard, &id, true, debug) {
                // the device is gone anyway
                warn!("releasing disconnected session failed: {err}");
            }
        }
    }

    fn release_locked(
        &self,
        guard: &mut Guarded,
        session_id: &str,
        disconnected: bool,
        debug: bool,
    ) -> Result<()> {
        let session = guard
            .sessions
            .remove(session_id, debug)
            .ok_or(CoreError::SessionNotFound)?;
        debug!(session = %session_id, disconnected, "closing device");
        session.device.close(disconnected)?;
        Ok(())
    }

    fn acquire(&self, path: &str, previous: Option<&str>, debug: bool) -> Result<String> {
        let mut guard = self.sessions.lock().unwrap();

        let previous = previous.unwrap_or("");
        let actual = guard
            .sessions
            .find_by_device(path, debug)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        debug!(path, previous, actual = %actual, "acquire");

        // optimistic concurrency guard: the client declares what it
        // believes the prior holder is
        if actual != previous {
            return Err(CoreError::WrongPreviousSession);
        }
        if !self.allow_stealing && !actual.is_empty() {
            return Err(CoreError::OtherCallInProgress);
        }

        if !previous.is_empty() {
            debug!(session = previous, "releasing previous holder");
            self.release_locked(&mut guard, previous, false, debug)?;
        }

        // a USB reset would kill a session on the device's other interface
        let other_interface_held = guard.sessions.find_by_device(path, !debug).is_some();
        let reset = !other_interface_held && self.reset;

        let native = guard
            .registry
            .native_path(path)
            .ok_or(CoreError::DeviceNotFound)?
            .to_string();

        let device = self.try_connect(&native, debug, reset)?;

        let id = guard.sessions.mint_id(debug);
        info!(session = %id, path, "session acquired");
        guard.sessions.insert(
            debug,
            Session {
                device_path: path.to_string(),
                id: id.clone(),
                device,
                in_flight: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(id)
    }

    /// Browsers read from a device immediately after it attaches, and so do
    /// we; right after physical attach some backends transiently fail.
    fn try_connect(&self, path: &str, debug: bool, reset: bool) -> Result<Arc<dyn Device>> {
        let mut tries = 0;
        loop {
            match self.bus.connect(path, debug, reset) {
                Ok(device) => return Ok(device),
                Err(err) if tries < CONNECT_RETRIES => {
                    debug!(tries, "connect failed, retrying: {err}");
                    tries += 1;
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn call(
        self: &Arc<Self>,
        cancel: CancellationToken,
        msg: Option<Message>,
        session_id: &str,
        mode: CallMode,
        debug: bool,
    ) -> Result<Option<Message>> {
        {
            // blocks until any running enumerate leaves its critical
            // section; does not serialize calls against each other
            self.call_state.lock().unwrap().calls_in_progress += 1;
        }
        let _gauge = CallsGauge {
            core: self.as_ref(),
        };

        let (device, in_flight) = {
            let guard = self.sessions.lock().unwrap();
            let session = guard
                .sessions
                .get(session_id, debug)
                .ok_or(CoreError::SessionNotFound)?;
            (Arc::clone(&session.device), Arc::clone(&session.in_flight))
        };

        if in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::OtherCallInProgress);
        }
        let _in_flight = InFlightGuard(in_flight);

        let (done_tx, done_rx) = oneshot::channel();
        let _done = DoneGuard(Some(done_tx));
        self.spawn_cancel_watcher(cancel, done_rx, session_id.to_string(), debug);

        self.transfer(msg, device.as_ref(), mode)
    }

    /// Waits for call completion or the caller going away, whichever comes
    /// first; a vanished caller gets its session auto-released, which
    /// unblocks the in-flight transfer.
    fn spawn_cancel_watcher(
        self: &Arc<Self>,
        cancel: CancellationToken,
        done: oneshot::Receiver<()>,
        session_id: String,
        debug: bool,
    ) {
        let core = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = done => {}
                _ = cancel.cancelled() => {
                    debug!(session = %session_id, "request closed, auto-releasing");
                    let released = task::spawn_blocking(move || {
                        let mut guard = core.sessions.lock().unwrap();
                        core.release_locked(&mut guard, &session_id, false, debug)
                    })
                    .await;
                    match released {
                        Ok(Err(err)) => debug!("auto-release failed: {err}"),
                        Err(err) => debug!("auto-release task failed: {err}"),
                        Ok(Ok(())) => {}
                    }
                }
            }
        });
    }

    fn transfer(
        &self,
        msg: Option<Message>,
        device: &dyn Device,
        mode: CallMode,
    ) -> Result<Option<Message>> {
        match mode {
            CallMode::Read => {
                if msg.is_some() {
                    return Err(CoreError::NonEmptyBodyOnRead);
                }
            }
            CallMode::Write | CallMode::ReadWrite => {
                let msg = msg.ok_or(CoreError::Protocol(ProtocolError::MalformedData))?;
                io::write_message(device, &msg)?;
            }
        }
        if mode == CallMode::Write {
            return Ok(None);
        }
        Ok(Some(io::read_message(device)?))
    }

    fn listen(
        &self,
        cancel: &CancellationToken,
        mut baseline: Vec<EnumerateEntry>,
    ) -> Result<Option<Vec<EnumerateEntry>>> {
        baseline.sort_by(|a, b| a.path.cmp(&b.path));

        for _ in 0..ITER_MAX {
            let mut current = self.enumerate()?;
            for entry in &mut current {
                // the type tag is not part of the wire form; leaving it set
                // would make every comparison spuriously different
                entry.device_type = DeviceType::default();
            }
            if current != baseline {
                return Ok(Some(current));
            }
            if cancel.is_cancelled() {
                debug!("listen: request closed");
                return Ok(None);
            }
            thread::sleep(ITER_DELAY);
        }
        // budget exhausted without change; identical-to-baseline return
        // tells the client to re-listen
        Ok(Some(baseline))
    }
}

fn build_entries(sessions: &SessionTable, infos: &[DeviceInfo]) -> Vec<EnumerateEntry> {
    let mut entries: Vec<EnumerateEntry> = infos
        .iter()
        .map(|info| EnumerateEntry {
            path: info.path.clone(),
            vendor: info.vendor_id,
            product: info.product_id,
            device_type: info.device_type,
            debug: info.debug,
            session: sessions
                .find_by_device(&info.path, false)
                .map(|s| s.id.clone()),
            debug_session: sessions
                .find_by_device(&info.path, true)
                .map(|s| s.id.clone()),
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}
