//! The bridge between terminated TCP connections and native IPv4 sockets.
//!
//! Each accepted connection gets one non-blocking stream socket towards the
//! IPv4 destination recovered from the translated address. Socket I/O is
//! driven entirely by the engine's buffer-state notifications:
//!
//! * send-space-available arms a socket *read* event, which stops rearming
//!   once the connection's send buffer fills up;
//! * data-available arms a socket *write* event, which deregisters once the
//!   receive buffer drains.
//!
//! Both directions therefore exert backpressure on a single thread without
//! ever blocking: a stalled peer freezes the corresponding socket direction,
//! nothing else.
//!
//! Orderly EOF from the destination turns into an orderly TCP close towards
//! the peer; an abrupt socket error aborts the connection with a reset, the
//! same way a peer-initiated reset would tear down the socket.
use log::{debug, error, info, warn};
use std::os::unix::io::RawFd;
use std::process;

use crate::event::{EventId, Interest, Scheduler};
use crate::managed::Arena;
use crate::sys::{self, ConnectProgress};
use crate::tcp::{AppToken, SessionHandler, TcbKey, View};
use crate::Relay;

/// Per-callback socket transfer cap.
const IO_CHUNK: usize = 65536;

type Sched = Scheduler<Relay<TcpRelay>>;

struct Session {
    fd: RawFd,
    conn: TcbKey,
    e_read: Option<EventId>,
    e_write: Option<EventId>,
}

/// The TCP session bridge.
pub struct TcpRelay {
    sessions: Arena<Session>,
    scratch: Vec<u8>,
}

impl TcpRelay {
    /// Create a bridge with no sessions.
    pub fn new() -> TcpRelay {
        TcpRelay {
            sessions: Arena::new(),
            scratch: vec![0; IO_CHUNK],
        }
    }

    /// Number of active bridge sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn kill(sessions: &mut Arena<Session>, sched: &mut Sched, token: AppToken) {
        if let Some(session) = sessions.remove(token.0) {
            if let Some(id) = session.e_read {
                sched.cancel(id);
            }
            if let Some(id) = session.e_write {
                sched.cancel(id);
            }
            sys::close_fd(session.fd);
            debug!("{} bridge sessions active", sessions.len());
        }
    }

    /// The pending non-blocking connect finished, one way or the other.
    fn connect_ready(relay: &mut Relay<TcpRelay>, sched: &mut Sched, token: AppToken) -> Interest {
        let Relay { tcp, link, app } = relay;
        let (conn, fd) = match app.sessions.get_mut(token.0) {
            Some(session) => {
                session.e_write = None;
                (session.conn, session.fd)
            }
            None => return Interest::Done,
        };

        match sys::take_socket_error(fd) {
            Ok(()) => {
                let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                view.accept(conn);
            }
            Err(err) => {
                warn!("connect failed: {}", err);
                {
                    let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                    view.close(conn, false);
                }
                Self::kill(&mut app.sessions, sched, token);
            }
        }
        Interest::Done
    }

    /// The destination socket has data for the connection's send buffer.
    fn socket_readable(relay: &mut Relay<TcpRelay>, sched: &mut Sched, token: AppToken) -> Interest {
        let Relay { tcp, link, app } = relay;
        let TcpRelay { sessions, scratch } = app;

        let (conn, fd) = match sessions.get_mut(token.0) {
            Some(session) => (session.conn, session.fd),
            None => return Interest::Done,
        };

        let space = tcp.output_space(conn).min(scratch.len());
        if space == 0 {
            // The send buffer is full; the next space notification rearms.
            if let Some(session) = sessions.get_mut(token.0) {
                session.e_read = None;
            }
            return Interest::Done;
        }

        match sys::read_fd(fd, &mut scratch[..space]) {
            Ok(0) => {
                // Orderly EOF from the destination.
                {
                    let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                    view.close(conn, false);
                }
                Self::kill(sessions, sched, token);
                Interest::Done
            }
            Ok(count) => {
                {
                    let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                    view.send(conn, &scratch[..count]);
                }
                if tcp.output_space(conn) == 0 {
                    if let Some(session) = sessions.get_mut(token.0) {
                        session.e_read = None;
                    }
                    Interest::Done
                } else {
                    Interest::Keep
                }
            }
            Err(ref err) if err.is_would_block() => Interest::Keep,
            Err(err) => {
                warn!("destination read failed: {}", err);
                {
                    let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                    view.close(conn, true);
                }
                Self::kill(sessions, sched, token);
                Interest::Done
            }
        }
    }

    /// The destination socket can take data from the receive buffer.
    fn socket_writable(relay: &mut Relay<TcpRelay>, sched: &mut Sched, token: AppToken) -> Interest {
        let Relay { tcp, link, app } = relay;
        let TcpRelay { sessions, scratch } = app;

        let (conn, fd) = match sessions.get_mut(token.0) {
            Some(session) => (session.conn, session.fd),
            None => return Interest::Done,
        };

        let pending = tcp.peek(conn, scratch);
        if pending == 0 {
            if let Some(session) = sessions.get_mut(token.0) {
                session.e_write = None;
            }
            return Interest::Done;
        }

        match sys::write_fd(fd, &scratch[..pending]) {
            Ok(0) => Interest::Keep,
            Ok(written) => {
                // Only what the socket took leaves the buffer; a short write
                // keeps the event armed for the rest.
                {
                    let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                    view.consume(conn, written);
                }
                if tcp.readable(conn) == 0 {
                    if let Some(session) = sessions.get_mut(token.0) {
                        session.e_write = None;
                    }
                    Interest::Done
                } else {
                    Interest::Keep
                }
            }
            Err(ref err) if err.is_would_block() => Interest::Keep,
            Err(err) => {
                warn!("destination write failed: {}", err);
                {
                    let mut view = View { sched: &mut *sched, tcp: &mut *tcp, link: link.as_mut() };
                    view.close(conn, true);
                }
                Self::kill(sessions, sched, token);
                Interest::Done
            }
        }
    }
}

impl Default for TcpRelay {
    fn default() -> Self {
        TcpRelay::new()
    }
}

impl SessionHandler for TcpRelay {
    fn incoming_session(&mut self, mut view: View<'_, Self>, conn: TcbKey) -> Option<AppToken> {
        let (laddr, lport) = view.tcp.local_endpoint(conn)?;
        let dest = laddr.trailing_ipv4();

        let fd = match sys::tcp_socket() {
            Ok(fd) => fd,
            Err(err) => {
                if err.is_fatal_exhaustion() {
                    error!("cannot create destination sockets: {}", err);
                    process::exit(1);
                }
                warn!("socket creation failed: {}", err);
                view.close(conn, false);
                return None;
            }
        };

        let token = AppToken(self.sessions.insert(Session {
            fd,
            conn,
            e_read: None,
            e_write: None,
        }));
        info!(
            "session towards {}.{}.{}.{}:{}, {} active",
            dest[0], dest[1], dest[2], dest[3], lport, self.sessions.len());

        match sys::connect_ipv4(fd, dest, lport) {
            Ok(ConnectProgress::Connected) => view.accept(conn),
            Ok(ConnectProgress::InProgress) => {
                let id = view.sched.on_writable(fd, move |sched, relay: &mut Relay<TcpRelay>, _| {
                    TcpRelay::connect_ready(relay, sched, token)
                });
                if let Some(session) = self.sessions.get_mut(token.0) {
                    session.e_write = Some(id);
                }
            }
            Err(err) => {
                warn!(
                    "connect to {}.{}.{}.{}:{} failed: {}",
                    dest[0], dest[1], dest[2], dest[3], lport, err);
                view.close(conn, false);
                Self::kill(&mut self.sessions, view.sched, token);
                return None;
            }
        }

        Some(token)
    }

    fn send_space_available(&mut self, view: View<'_, Self>, app: AppToken, bytes: usize) {
        let session = match self.sessions.get_mut(app.0) {
            Some(session) => session,
            None => return,
        };
        if bytes == 0 || session.e_read.is_some() {
            return;
        }
        let token = app;
        let id = view.sched.on_readable(session.fd, move |sched, relay: &mut Relay<TcpRelay>, _| {
            TcpRelay::socket_readable(relay, sched, token)
        });
        session.e_read = Some(id);
    }

    fn data_available(&mut self, view: View<'_, Self>, app: AppToken, _bytes: usize) {
        let session = match self.sessions.get_mut(app.0) {
            Some(session) => session,
            None => return,
        };
        if session.e_write.is_some() {
            return;
        }
        let token = app;
        let id = view.sched.on_writable(session.fd, move |sched, relay: &mut Relay<TcpRelay>, _| {
            TcpRelay::socket_writable(relay, sched, token)
        });
        session.e_write = Some(id);
    }

    fn closing(&mut self, view: View<'_, Self>, app: AppToken, hard: bool) {
        debug!("bridge session torn down ({})", if hard { "reset" } else { "orderly" });
        Self::kill(&mut self.sessions, view.sched, app);
    }
}
