//! The socket engine and its dispatch thread.
//!
//! One thread owns the mio [`Poll`]. It routes readiness to sockets, drains
//! requests posted from other threads (re-posted events, lookup results,
//! messages) and fires timers. Other threads talk to it through an mpsc
//! channel followed by a [`Waker`] wake-up.
//!
//! The engine lock (socket table, timers and the request sender) is always
//! taken before a socket lock. Neither is held while a sink runs.

pub(crate) mod resolver;
pub(crate) mod table;
pub mod timers;

use crate::config::EngineConfig;
use crate::error::{Error, OsErrorCode};
use crate::event::{NetEvent, Param, SocketEvent, SocketEventSink};
use crate::socket::{self, Readiness, Socket, SocketRef, SocketUid};
use crate::supervisor::{ThreadKey, ThreadQueue};
use table::SocketTable;
use timers::{Tick, TimerEntry, TimerRegistry};

use ::config::Config;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const SLOT_BITS: u32 = 16;
const SLOT_MASK: usize = (1 << SLOT_BITS) - 1;
const SERIAL_MASK: usize = usize::MAX >> SLOT_BITS;
const WAKE_TOKEN: Token = Token(usize::MAX);

const DISPATCH_THREAD: &str = "sockengine-dispatch";
const DISPATCH_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll token of a handle: table slot in the low bits, handle serial above.
pub(crate) fn token_for(slot: usize, serial: usize) -> Token {
    Token((serial << SLOT_BITS) | (slot & SLOT_MASK))
}

fn split_token(token: Token) -> (usize, usize) {
    (token.0 & SLOT_MASK, token.0 >> SLOT_BITS)
}

/// Work handed to the dispatch thread.
#[derive(Debug)]
pub(crate) enum Request {
    Net {
        slot: usize,
        serial: usize,
        event: NetEvent,
    },
    HostResolved {
        target: SocketRef,
        host_uid: u32,
        result: Result<Ipv4Addr, OsErrorCode>,
    },
    Event {
        target: SocketRef,
        event: SocketEvent,
    },
    Close,
}

pub(crate) struct EngineState {
    pub(crate) table: SocketTable,
    pub(crate) timers: TimerRegistry,
    timer_deadline: Option<Tick>,
    timer_kick: bool,
    terminating: bool,
    sender: Option<Sender<Request>>,
}

pub(crate) struct Shared {
    state: Mutex<EngineState>,
    pub(crate) registry: Registry,
    waker: Waker,
    pub(crate) config: EngineConfig,
    pub(crate) threads: ThreadQueue,
    next_uid: AtomicU64,
    next_serial: AtomicUsize,
    started: Instant,
}

impl Shared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_serial(&self) -> usize {
        (self.next_serial.fetch_add(1, Ordering::Relaxed) & SERIAL_MASK).max(1)
    }

    pub(crate) fn tick_count(&self) -> Tick {
        self.started.elapsed().as_millis() as Tick
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            error!(%err, "Failed to wake dispatch thread");
        }
    }

    /// Queues `request` for the dispatch thread.
    pub(crate) fn post(&self, request: Request) -> Result<(), Error> {
        {
            let state = self.lock_state();
            let sender = state.sender.as_ref().ok_or(Error::EngineTerminated)?;
            sender.send(request).map_err(|_| Error::EngineTerminated)?;
        }
        self.waker.wake()?;
        Ok(())
    }

    /// Arms the timer for the nearest pending deadline.
    fn rearm(&self, state: &mut EngineState) {
        state.timer_deadline = None;
        state.timer_kick = false;
        if state.terminating {
            return;
        }
        let Some(head) = state.timers.head_deadline() else {
            return;
        };
        if (head.wrapping_sub(self.tick_count()) as i32) > 0 {
            state.timer_deadline = Some(head);
        } else {
            state.timer_kick = true;
        }
        self.wake();
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let state = self.lock_state();
        if state.timer_kick {
            return Some(Duration::ZERO);
        }
        let deadline = state.timer_deadline?;
        let remaining = deadline.wrapping_sub(self.tick_count()) as i32;
        Some(Duration::from_millis(remaining.max(0) as u64))
    }

    fn timer_due(&self) -> bool {
        let state = self.lock_state();
        state.timer_kick
            || state
                .timer_deadline
                .is_some_and(|deadline| self.tick_count().wrapping_sub(deadline) as i32 >= 0)
    }

    fn resolve(&self, target: SocketRef) -> Option<Arc<Socket>> {
        self.lock_state().table.resolve(target)
    }

    fn socket_at(&self, slot: usize) -> Option<Arc<Socket>> {
        self.lock_state().table.get(slot).cloned()
    }
}

// ============================================================================
// Socket Engine
// ============================================================================

/// Owner of the dispatch thread, the socket table and the timers.
///
/// Dropping the engine terminates and joins the dispatch thread.
pub struct SocketEngine {
    shared: Arc<Shared>,
    dispatch: Option<ThreadKey>,
}

impl std::fmt::Debug for SocketEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEngine")
            .field("config", &self.shared.config)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl SocketEngine {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates an engine reading `{name}.{key}` settings before `key`.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::with_config(EngineConfig::from_config(config, name)?)
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (sender, receiver) = channel();

        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                table: SocketTable::new(config.max_sockets),
                timers: TimerRegistry::new(),
                timer_deadline: None,
                timer_kick: false,
                terminating: false,
                sender: Some(sender),
            }),
            registry,
            waker,
            config,
            threads: ThreadQueue::new("sockengine"),
            next_uid: AtomicU64::new(1),
            next_serial: AtomicUsize::new(1),
            started: Instant::now(),
        });

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            poll,
            receiver,
            last_timer_pass: Instant::now(),
        };
        let (running_tx, running_rx) = channel();
        let dispatch = shared.threads.start_thread(DISPATCH_THREAD, move || {
            // The constructor waits for this before returning.
            let _ = running_tx.send(());
            dispatcher.run();
        })?;
        running_rx
            .recv()
            .map_err(|_| Error::ThreadSpawn(DISPATCH_THREAD.to_string()))?;

        info!(
            max_sockets = shared.config.max_sockets,
            poll_capacity = shared.config.poll_capacity,
            "Socket engine started"
        );
        Ok(Self {
            shared,
            dispatch: Some(dispatch),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// The threads owned by the engine: the dispatch thread and lookups.
    pub fn threads(&self) -> &ThreadQueue {
        &self.shared.threads
    }

    /// Milliseconds since the engine started, wrapping at `u32::MAX`.
    pub fn tick_count(&self) -> Tick {
        self.shared.tick_count()
    }

    /// Creates a socket whose events go to `sink`.
    pub fn create_socket(&self, sink: Arc<dyn SocketEventSink>) -> Arc<Socket> {
        let uid = self.shared.next_uid.fetch_add(1, Ordering::Relaxed);
        trace!(uid, "Socket created");
        Socket::new(uid, Arc::downgrade(&self.shared), sink)
    }

    /// Holds the engine lock until the guard is dropped. No socket or engine
    /// operation may be called on this thread meanwhile.
    pub fn lock_sockets_thread(&self) -> SocketsLock<'_> {
        SocketsLock {
            state: self.shared.lock_state(),
        }
    }

    /// Exchanges the connections of `a` and `b`, including their table slots,
    /// and keeps the engine locked until the returned guard is dropped.
    #[instrument(skip(self, a, b), fields(a = a.uid(), b = b.uid()))]
    pub fn begin_sockets_swap(
        &self,
        a: &Arc<Socket>,
        b: &Arc<Socket>,
    ) -> Result<SocketsLock<'_>, Error> {
        let mut state = self.shared.lock_state();
        let slot_a = a.msg_index().ok_or(Error::NotRegistered { uid: a.uid() });
        let slot_b = b.msg_index().ok_or(Error::NotRegistered { uid: b.uid() });
        let (slot_a, slot_b) = match (slot_a, slot_b) {
            (Ok(slot_a), Ok(slot_b)) => (slot_a, slot_b),
            (Err(err), _) | (_, Err(err)) => {
                error!(%err, "Swapping a socket that is not registered");
                return Err(err);
            }
        };

        socket::swap_endpoints(a, b);
        state.table.swap(slot_a, slot_b);
        debug!(slot_a, slot_b, "Sockets swapped");
        Ok(SocketsLock { state })
    }

    pub fn swap_sockets(&self, a: &Arc<Socket>, b: &Arc<Socket>) -> Result<(), Error> {
        self.begin_sockets_swap(a, b).map(drop)
    }

    /// Registers a timer firing at `deadline`, delivered to `target` as
    /// [`SocketEvent::Timer`].
    pub fn add_timer(
        &self,
        target: SocketRef,
        deadline: Tick,
        id: u32,
        param: Option<Param>,
    ) -> Result<(), Error> {
        let mut state = self.shared.lock_state();
        let index = state
            .timers
            .insert(TimerEntry::new(target, deadline, id, param))?;
        trace!(uid = target.uid, id, deadline, index, "Timer added");
        if index == 0 {
            self.shared.rearm(&mut state);
        }
        Ok(())
    }

    pub fn add_timer_after(
        &self,
        target: SocketRef,
        delay: Duration,
        id: u32,
        param: Option<Param>,
    ) -> Result<(), Error> {
        let delay = delay.as_millis().min(i32::MAX as u128) as Tick;
        let deadline = self.tick_count().wrapping_add(delay);
        self.add_timer(target, deadline, id, param)
    }

    /// Removes the timers `id` of socket `uid`. Returns whether any existed.
    pub fn delete_timer(&self, uid: SocketUid, id: u32) -> bool {
        let mut state = self.shared.lock_state();
        let deletion = state.timers.delete(uid, id);
        if deletion.head_removed {
            self.shared.rearm(&mut state);
        }
        trace!(uid, id, matched = deletion.matched, "Timer deleted");
        deletion.matched > 0
    }

    /// Delivers [`SocketEvent::Message`] to `target` on the dispatch thread.
    pub fn post_socket_message(
        &self,
        target: SocketRef,
        id: u32,
        param: Option<Param>,
    ) -> Result<(), Error> {
        self.shared.post(Request::Event {
            target,
            event: SocketEvent::Message { id, param },
        })
    }

    /// Whether the registered socket `uid` has an open handle; `None` when no
    /// such socket is registered.
    pub fn is_socket_connected(&self, uid: SocketUid) -> Option<bool> {
        let state = self.shared.lock_state();
        state
            .table
            .find_by_uid(uid)
            .map(|socket| socket.stamp_connected_query())
    }

    /// Removes the socket from the table without touching its handle.
    pub fn detach_socket(&self, socket: &Socket) -> Result<(), Error> {
        let mut state = self.shared.lock_state();
        socket::detach(socket, &mut state)
    }

    /// Closes the socket if it is still open, then detaches it.
    pub fn delete_socket(&self, socket: &Socket) -> Result<(), Error> {
        if socket.is_connected() {
            error!(uid = socket.uid(), "Deleting a socket that is still open");
            // Whatever the close reports, the socket is going away.
            let _ = socket.close_socket();
        }
        if socket.msg_index().is_none() {
            return Ok(());
        }
        self.detach_socket(socket)
    }

    /// Stops timers and asks the dispatch thread to exit.
    pub fn terminate(&self) {
        let mut state = self.shared.lock_state();
        if state.terminating {
            return;
        }
        state.terminating = true;
        state.timer_deadline = None;
        state.timer_kick = false;
        if let Some(sender) = state.sender.as_ref() {
            // A closed channel means the thread is already gone.
            let _ = sender.send(Request::Close);
        }
        drop(state);
        self.shared.wake();
        info!("Socket engine terminating");
    }
}

impl Drop for SocketEngine {
    fn drop(&mut self) {
        self.terminate();

        if let Some(dispatch) = self.dispatch.take() {
            if self.shared.threads.is_current(dispatch) {
                warn!("Socket engine dropped on its own dispatch thread");
            } else if !self
                .shared
                .threads
                .wait_for_exit(dispatch, DISPATCH_EXIT_TIMEOUT)
            {
                warn!("Dispatch thread did not stop in time");
            }
        }
        self.shared
            .threads
            .kill_all(true, Duration::from_secs(1), Duration::from_secs(1));

        let remaining = self.shared.lock_state().table.live_count();
        if remaining > 0 {
            warn!(remaining, "Sockets still registered at engine shutdown");
        }
    }
}

/// Engine-wide lock, see [`SocketEngine::lock_sockets_thread`].
pub struct SocketsLock<'a> {
    state: MutexGuard<'a, EngineState>,
}

impl SocketsLock<'_> {
    pub fn socket_count(&self) -> usize {
        self.state.table.live_count()
    }

    pub fn find_socket(&self, uid: SocketUid) -> Option<Arc<Socket>> {
        self.state.table.find_by_uid(uid).cloned()
    }

    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.state.table.iter().cloned().collect()
    }
}

// ============================================================================
// Dispatch Thread
// ============================================================================

struct Dispatcher {
    shared: Arc<Shared>,
    poll: Poll,
    receiver: Receiver<Request>,
    last_timer_pass: Instant,
}

impl Dispatcher {
    fn run(mut self) {
        info!("Dispatch thread running");
        let mut events = Events::with_capacity(self.shared.config.poll_capacity);

        loop {
            let timeout = self.shared.poll_timeout();
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "Poll failed, stopping dispatch thread");
                break;
            }

            // Busy sockets must not keep timers from firing.
            if self.last_timer_pass.elapsed() >= self.shared.config.timer_starvation {
                self.receive_timer();
            }

            for event in events.iter() {
                if event.token() != WAKE_TOKEN {
                    self.route_readiness(event);
                }
            }

            if !self.drain_requests() {
                break;
            }

            if self.shared.timer_due() {
                self.receive_timer();
            }
        }

        self.shared.lock_state().sender = None;
        let undelivered = self.receiver.try_iter().count();
        if undelivered > 0 {
            warn!(undelivered, "Requests dropped at shutdown");
        }
        info!("Dispatch thread stopped");
    }

    fn route_readiness(&self, event: &Event) {
        let (slot, serial) = split_token(event.token());
        let Some(socket) = self.shared.socket_at(slot) else {
            trace!(slot, serial, "Readiness for an empty slot");
            return;
        };

        let readiness = Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
        };
        trace!(uid = socket.uid(), slot, serial, ?readiness, "Readiness");
        for net_event in socket.readiness_events(serial, readiness) {
            socket.deliver_net_event(serial, net_event);
        }
    }

    /// Handles queued requests; returns false once asked to stop.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(Request::Close) => return false,
                Ok(request) => self.handle_request(request),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_request(&self, request: Request) {
        match request {
            Request::Net {
                slot,
                serial,
                event,
            } => match self.shared.socket_at(slot) {
                Some(socket) => socket.deliver_net_event(serial, event),
                None => trace!(slot, serial, ?event, "Re-posted event for an empty slot"),
            },
            Request::HostResolved {
                target,
                host_uid,
                result,
            } => match self.shared.resolve(target) {
                Some(socket) => socket.deliver_host_resolved(host_uid, result),
                None => warn!(uid = target.uid, host_uid, "Lost host lookup result"),
            },
            Request::Event { target, event } => match self.shared.resolve(target) {
                Some(socket) => socket.notify(event),
                None => warn!(uid = target.uid, ?event, "Lost posted event"),
            },
            Request::Close => {}
        }
    }

    /// Fires every due timer. The due prefix stays locked while the sinks
    /// run, so they may add and delete timers freely.
    fn receive_timer(&mut self) {
        self.last_timer_pass = Instant::now();
        let shared = &self.shared;
        let mut state = shared.lock_state();
        state.timer_deadline = None;
        state.timer_kick = false;
        if state.timers.is_locked() {
            return;
        }

        let due = state.timers.lock_due(shared.tick_count());
        for index in 0..due {
            let Some(fired) = state.timers.take_locked(index) else {
                continue;
            };
            let socket = state.table.resolve(fired.target);
            drop(state);

            match socket {
                Some(socket) => socket.notify(SocketEvent::Timer {
                    id: fired.id,
                    param: fired.param,
                }),
                None => warn!(uid = fired.target.uid, id = fired.id, "Lost timer event"),
            }
            state = shared.lock_state();
        }

        state.timers.unlock();
        shared.rearm(&mut state);
    }
}
