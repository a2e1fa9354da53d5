//! The cooperative event scheduler.
//!
//! A single thread multiplexes every connection: one blocking readiness wait
//! per iteration, then callbacks run to completion without preemption.
//! Invariants therefore only need to hold between callback invocations, and
//! no state in this crate is guarded by a lock.
//!
//! There are three kinds of registration:
//!
//! * **Timers** fire at an absolute instant. Exactly one timer — the
//!   earliest — fires per iteration even if several are due, which bounds
//!   the latency any single callback can add to the loop. Timers are
//!   one-shot; persistence requires the callback to rearm explicitly by
//!   returning [`Reschedule::After`].
//! * **Fd interest** entries pair a descriptor with a readiness direction.
//!   The fd list is visited once per iteration; a callback returning
//!   [`Interest::Done`] is deregistered on the spot, and the scheduler
//!   tolerates the owning object being destroyed as a direct side effect of
//!   the call.
//! * **Always callbacks** run once per iteration after I/O, and force the
//!   readiness wait to be non-blocking so they run promptly. They serve as
//!   "must run soon but must not block I/O" markers.
//!
//! Callbacks receive the scheduler itself, the context object `C` and their
//! own [`EventId`]. Registrations are identified by generation-checked ids,
//! never by references; cancelling one takes effect immediately, including
//! from within another callback in the same iteration.
//!
//! On an interrupt signal the loop finishes the current iteration, drops all
//! remaining registrations without invoking them, and returns.
//!
//! [`Reschedule::After`]: enum.Reschedule.html
//! [`Interest::Done`]: enum.Interest.html
//! [`EventId`]: struct.EventId.html
use std::os::unix::io::RawFd;

use crate::managed::{Arena, Key};
use crate::sys::{self, Direction};
use crate::time::{Duration, Instant};

/// Decision of a timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Fire again after the given delay.
    After(Duration),
    /// The timer is finished; the registration is dropped.
    Done,
}

/// Decision of an fd or always callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Keep the registration.
    Keep,
    /// No longer interested; the registration is dropped.
    Done,
}

/// Handle to a registration.
///
/// Stale handles are harmless: operations on an id whose registration is
/// gone do nothing, even if the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Key);

type TimerFn<C> = Box<dyn FnMut(&mut Scheduler<C>, &mut C, EventId) -> Reschedule>;
type IoFn<C> = Box<dyn FnMut(&mut Scheduler<C>, &mut C, EventId) -> Interest>;

enum Call<C: 'static> {
    Timer(TimerFn<C>),
    Io(IoFn<C>),
    /// Placeholder while the callback is being invoked.
    Taken,
}

enum Kind {
    Timer { at: Instant },
    Fd { fd: RawFd, direction: Direction },
    Always,
}

struct Event<C: 'static> {
    kind: Kind,
    call: Call<C>,
}

/// The scheduler. `C` is the context object passed to every callback.
pub struct Scheduler<C: 'static> {
    events: Arena<Event<C>>,
}

impl<C: 'static> Scheduler<C> {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Scheduler { events: Arena::new() }
    }

    /// Register a timer at an absolute instant.
    pub fn timer_at<F>(&mut self, at: Instant, f: F) -> EventId
    where
        F: FnMut(&mut Scheduler<C>, &mut C, EventId) -> Reschedule + 'static,
    {
        EventId(self.events.insert(Event {
            kind: Kind::Timer { at },
            call: Call::Timer(Box::new(f)),
        }))
    }

    /// Register a timer after a relative delay.
    pub fn timer_after<F>(&mut self, delay: Duration, f: F) -> EventId
    where
        F: FnMut(&mut Scheduler<C>, &mut C, EventId) -> Reschedule + 'static,
    {
        self.timer_at(sys::now() + delay, f)
    }

    /// Register interest in a descriptor becoming readable.
    pub fn on_readable<F>(&mut self, fd: RawFd, f: F) -> EventId
    where
        F: FnMut(&mut Scheduler<C>, &mut C, EventId) -> Interest + 'static,
    {
        self.on_fd(fd, Direction::Read, f)
    }

    /// Register interest in a descriptor becoming writable.
    pub fn on_writable<F>(&mut self, fd: RawFd, f: F) -> EventId
    where
        F: FnMut(&mut Scheduler<C>, &mut C, EventId) -> Interest + 'static,
    {
        self.on_fd(fd, Direction::Write, f)
    }

    fn on_fd<F>(&mut self, fd: RawFd, direction: Direction, f: F) -> EventId
    where
        F: FnMut(&mut Scheduler<C>, &mut C, EventId) -> Interest + 'static,
    {
        EventId(self.events.insert(Event {
            kind: Kind::Fd { fd, direction },
            call: Call::Io(Box::new(f)),
        }))
    }

    /// Register a per-iteration callback.
    pub fn always<F>(&mut self, f: F) -> EventId
    where
        F: FnMut(&mut Scheduler<C>, &mut C, EventId) -> Interest + 'static,
    {
        EventId(self.events.insert(Event {
            kind: Kind::Always,
            call: Call::Io(Box::new(f)),
        }))
    }

    /// Drop a registration. Takes effect immediately; stale ids are ignored.
    pub fn cancel(&mut self, id: EventId) {
        let _ = self.events.remove(id.0);
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no registrations exist.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn earliest_timer(&self) -> Option<(EventId, Instant)> {
        self.events
            .iter()
            .filter_map(|(key, event)| match event.kind {
                Kind::Timer { at } => Some((EventId(key), at)),
                _ => None,
            })
            .min_by_key(|&(_, at)| at)
    }

    /// Whether any per-iteration callback is registered.
    ///
    /// While one is, the readiness wait is non-blocking; useful for driving
    /// the scheduler to quiescence without blocking on distant timers.
    pub fn has_always(&self) -> bool {
        self.events.iter().any(|(_, event)| match event.kind {
            Kind::Always => true,
            _ => false,
        })
    }

    /// Run one scheduler iteration: wait, fire at most one timer, service
    /// ready descriptors, run the always callbacks.
    pub fn step(&mut self, ctx: &mut C) {
        // Snapshot the fd interests for this iteration.
        let mut poll_ids = Vec::new();
        let mut pollfds = Vec::new();
        for (key, event) in self.events.iter() {
            if let Kind::Fd { fd, direction } = event.kind {
                poll_ids.push((EventId(key), direction));
                pollfds.push(sys::poll_entry(fd, direction));
            }
        }

        let due = self.earliest_timer();
        let now = sys::now();

        let ready = match due {
            // An overdue timer is serviced before any readiness wait.
            Some((_, at)) if at <= now => 0,
            _ => {
                let timeout = if self.has_always() {
                    Some(0)
                } else {
                    due.map(|(_, at)| now.millis_until(at))
                };
                match sys::poll_wait(&mut pollfds, timeout) {
                    Ok(n) => n,
                    Err(err) => {
                        log::error!("readiness wait failed: {}", err);
                        0
                    }
                }
            }
        };

        // Fire the single earliest timer if it is due by now.
        if let Some((id, at)) = due {
            if at <= sys::now() {
                self.fire_timer(id, ctx);
            }
        }

        if ready > 0 {
            for (&(id, direction), entry) in poll_ids.iter().zip(&pollfds) {
                if sys::poll_ready(entry, direction) {
                    self.fire_io(id, ctx);
                }
            }
        }

        // The always callbacks run once after I/O. Entries added by earlier
        // callbacks in this very iteration are picked up, entries added
        // during this pass wait for the next one.
        let markers: Vec<EventId> = self.events
            .iter()
            .filter_map(|(key, event)| match event.kind {
                Kind::Always => Some(EventId(key)),
                _ => None,
            })
            .collect();
        for id in markers {
            self.fire_io(id, ctx);
        }
    }

    fn fire_timer(&mut self, id: EventId, ctx: &mut C) {
        // The callback is taken out of the arena for the duration of the
        // call so it can operate on the scheduler without aliasing.
        let call = match self.events.get_mut(id.0) {
            Some(event) => core::mem::replace(&mut event.call, Call::Taken),
            None => return,
        };

        let mut callback = match call {
            Call::Timer(callback) => callback,
            other => {
                // Kind and call variants are paired at registration.
                if let Some(event) = self.events.get_mut(id.0) {
                    event.call = other;
                }
                return;
            }
        };

        match callback(self, ctx, id) {
            Reschedule::After(delay) => {
                // The callback may have cancelled itself; then the decision
                // is moot and the registration stays gone.
                if let Some(event) = self.events.get_mut(id.0) {
                    event.kind = Kind::Timer { at: sys::now() + delay };
                    event.call = Call::Timer(callback);
                }
            }
            Reschedule::Done => self.cancel(id),
        }
    }

    fn fire_io(&mut self, id: EventId, ctx: &mut C) {
        let call = match self.events.get_mut(id.0) {
            Some(event) => core::mem::replace(&mut event.call, Call::Taken),
            None => return,
        };

        let mut callback = match call {
            Call::Io(callback) => callback,
            other => {
                if let Some(event) = self.events.get_mut(id.0) {
                    event.call = other;
                }
                return;
            }
        };

        match callback(self, ctx, id) {
            Interest::Keep => {
                if let Some(event) = self.events.get_mut(id.0) {
                    event.call = Call::Io(callback);
                }
            }
            Interest::Done => self.cancel(id),
        }
    }

    /// Run until interrupted.
    ///
    /// After the interrupt signal arrives the current iteration is finished,
    /// every remaining registration is dropped without being invoked, and
    /// the call returns.
    pub fn run(&mut self, ctx: &mut C) {
        loop {
            self.step(ctx);
            if sys::interrupted() {
                log::info!("interrupt received, shutting down");
                self.events.clear();
                return;
            }
        }
    }
}

impl<C: 'static> Default for Scheduler<C> {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        fired: Vec<&'static str>,
    }

    #[test]
    fn timers_fire_one_per_iteration_in_order() {
        let mut sched: Scheduler<Log> = Scheduler::new();
        let mut log = Log::default();

        let start = sys::now();
        sched.timer_at(start + Duration::from_millis(30), |_, log: &mut Log, _| {
            log.fired.push("late");
            Reschedule::Done
        });
        sched.timer_at(start + Duration::from_millis(10), |_, log: &mut Log, _| {
            log.fired.push("early");
            Reschedule::Done
        });

        sched.step(&mut log);
        assert_eq!(log.fired, ["early"]);
        assert_eq!(sched.len(), 1);

        sched.step(&mut log);
        assert_eq!(log.fired, ["early", "late"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn timer_reschedules_with_same_id() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        let mut count = 0u32;

        let id = sched.timer_after(Duration::from_millis(0), |_, count: &mut u32, _| {
            *count += 1;
            if *count < 2 {
                Reschedule::After(Duration::from_millis(0))
            } else {
                Reschedule::Done
            }
        });

        sched.step(&mut count);
        assert_eq!(count, 1);
        // Still registered under the same id after the explicit rearm.
        assert_eq!(sched.len(), 1);
        sched.cancel(id);
        assert!(sched.is_empty());
    }

    #[test]
    fn always_runs_each_iteration_until_done() {
        let mut sched: Scheduler<u32> = Scheduler::new();
        let mut count = 0u32;

        sched.always(|_, count: &mut u32, _| {
            *count += 1;
            if *count < 3 { Interest::Keep } else { Interest::Done }
        });

        sched.step(&mut count);
        sched.step(&mut count);
        sched.step(&mut count);
        assert_eq!(count, 3);
        assert!(sched.is_empty());
    }

    #[test]
    fn always_prevents_timer_wait() {
        // With an always marker pending, a far-future timer must not make
        // the iteration block.
        let mut sched: Scheduler<u32> = Scheduler::new();
        let mut count = 0u32;

        sched.timer_after(Duration::from_secs(3600), |_, _: &mut u32, _| Reschedule::Done);
        sched.always(|_, count: &mut u32, _| {
            *count += 1;
            Interest::Done
        });

        let before = sys::now();
        sched.step(&mut count);
        assert_eq!(count, 1);
        // Far below the timer deadline; generous bound for slow machines.
        assert!(before.millis_until(sys::now()) < 1000);
        // The far-future timer must not have fired.
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn cancellation_is_synchronous() {
        // The first always callback cancels the second; the second must not
        // run in the same iteration.
        struct Ctx {
            victim: Option<EventId>,
            ran: bool,
        }

        let mut sched: Scheduler<Ctx> = Scheduler::new();
        let mut ctx = Ctx { victim: None, ran: false };

        sched.always(|sched, ctx: &mut Ctx, _| {
            if let Some(victim) = ctx.victim.take() {
                sched.cancel(victim);
            }
            Interest::Done
        });
        let victim = sched.always(|_, ctx: &mut Ctx, _| {
            ctx.ran = true;
            Interest::Done
        });
        ctx.victim = Some(victim);

        sched.step(&mut ctx);
        assert!(!ctx.ran);
        assert!(sched.is_empty());
    }

    #[test]
    fn fd_readiness_and_deregistration() {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(res, 0);
        let [read_end, write_end] = fds;

        let mut sched: Scheduler<Vec<u8>> = Scheduler::new();
        let mut received = Vec::new();

        sched.on_readable(read_end, move |_, received: &mut Vec<u8>, _| {
            let mut buf = [0u8; 16];
            match sys::read_fd(read_end, &mut buf) {
                Ok(n) if n > 0 => {
                    received.extend_from_slice(&buf[..n]);
                    Interest::Keep
                }
                _ => Interest::Done,
            }
        });

        assert_eq!(sys::write_fd(write_end, b"ping"), Ok(4));
        sched.step(&mut received);
        assert_eq!(received, b"ping");

        // Closing the write end delivers EOF; the callback deregisters.
        sys::close_fd(write_end);
        sched.step(&mut received);
        assert!(sched.is_empty());
        sys::close_fd(read_end);
    }
}
