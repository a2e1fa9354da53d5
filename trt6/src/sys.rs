//! Thin wrappers around the libc calls the relay depends on.
//!
//! Everything unsafe lives here: the monotonic clock, `poll(2)`, non-blocking
//! IPv4 stream sockets for the bridge, the tun device, and the SIGINT flag.
//! Return values are interpreted through the small `LibcResult` helpers so
//! call sites read as ordinary `Result` code.
#![allow(unsafe_code)]

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};
use std::os::unix::io::RawFd;

use crate::time::Instant;

/// An errno value.
///
/// This is used as the error representation of raw libc calls. It can be
/// converted into a `std::io::Error`, where it will consequently have much
/// more extensive error information.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub libc::c_int);

#[derive(Clone, Copy)]
struct FdResult(libc::c_int);

#[derive(Clone, Copy)]
struct IoLenResult(libc::ssize_t);

type ClockResult = FdResult;

/// Trait for interpreting integer return values.
trait LibcResult: Copy {
    fn is_fail(self) -> bool;

    fn errno(self) -> Result<(), Errno> {
        if self.is_fail() {
            Err(Errno::new())
        } else {
            Ok(())
        }
    }
}

impl LibcResult for FdResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

impl LibcResult for IoLenResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

impl Errno {
    /// Read the current thread errno.
    pub fn new() -> Errno {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// The operation would have blocked.
    pub fn is_would_block(&self) -> bool {
        self.0 == libc::EWOULDBLOCK || self.0 == libc::EAGAIN
    }

    /// A non-blocking connect that has not finished yet.
    pub fn is_in_progress(&self) -> bool {
        self.0 == libc::EINPROGRESS
    }

    /// The call was interrupted by a signal.
    pub fn is_interrupted(&self) -> bool {
        self.0 == libc::EINTR
    }

    /// Resource exhaustion from which the process can not recover by closing
    /// a single session.
    pub fn is_fatal_exhaustion(&self) -> bool {
        match self.0 {
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => true,
            _ => false,
        }
    }
}

impl Default for Errno {
    fn default() -> Self {
        Errno(0)
    }
}

impl From<Errno> for std::io::Error {
    fn from(err: Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(err.0 as i32)
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

/// The current monotonic time.
pub fn now() -> Instant {
    let ts = unsafe {
        let mut ts = mem::MaybeUninit::<libc::timespec>::uninit();
        let res = libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
        FdResult(res).errno().expect("monotonic clock");
        ts.assume_init()
    };

    Instant::from_millis(ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000)
}

/// Readiness direction of an fd registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Wake when the descriptor becomes readable.
    Read,
    /// Wake when the descriptor becomes writable.
    Write,
}

impl Direction {
    pub(crate) fn poll_events(self) -> libc::c_short {
        match self {
            Direction::Read => libc::POLLIN,
            Direction::Write => libc::POLLOUT,
        }
    }
}

/// Construct a pollfd entry for the given interest.
pub(crate) fn poll_entry(fd: RawFd, direction: Direction) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: direction.poll_events(),
        revents: 0,
    }
}

/// Block in `poll(2)` for the given set of interests.
///
/// `timeout` is in milliseconds, `None` blocks indefinitely. An interrupted
/// wait reports zero ready descriptors so the caller can run its shutdown
/// check.
pub(crate) fn poll_wait(fds: &mut [libc::pollfd], timeout: Option<i64>) -> Result<usize, Errno> {
    let timeout = match timeout {
        Some(ms) => ms.max(0).min(i32::max_value() as i64) as libc::c_int,
        None => -1,
    };

    let res = unsafe {
        libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout)
    };

    match FdResult(res).errno() {
        Ok(()) => Ok(res as usize),
        Err(ref err) if err.is_interrupted() => Ok(0),
        Err(err) => Err(err),
    }
}

/// Whether a pollfd entry came back ready for its registered interest.
///
/// Error and hangup conditions count as ready so the owning callback observes
/// the failure from its `read`/`write` call.
pub(crate) fn poll_ready(entry: &libc::pollfd, direction: Direction) -> bool {
    let wanted = direction.poll_events() | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
    entry.revents & wanted != 0
}

fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    FdResult(flags).errno()?;
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    FdResult(res).errno()
}

/// Open a non-blocking IPv4 stream socket.
pub fn tcp_socket() -> Result<RawFd, Errno> {
    let fd = unsafe { libc::socket(libc::PF_INET, libc::SOCK_STREAM, 0) };
    FdResult(fd).errno()?;
    set_nonblocking(fd)?;
    Ok(fd)
}

/// Outcome of a non-blocking connect.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectProgress {
    /// The connection completed immediately.
    Connected,
    /// Completion is signalled by the socket becoming writable.
    InProgress,
}

/// Start connecting `fd` to an IPv4 address and port.
pub fn connect_ipv4(fd: RawFd, addr: [u8; 4], port: u16) -> Result<ConnectProgress, Errno> {
    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr) },
        sin_zero: [0; 8],
    };

    let res = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
    };

    match FdResult(res).errno() {
        Ok(()) => Ok(ConnectProgress::Connected),
        Err(ref err) if err.is_in_progress() => Ok(ConnectProgress::InProgress),
        Err(err) => Err(err),
    }
}

/// Retrieve and clear the pending error of a connecting socket.
pub fn take_socket_error(fd: RawFd) -> Result<(), Errno> {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut libc::c_int as *mut libc::c_void,
            &mut len)
    };

    FdResult(res).errno()?;
    if error == 0 {
        Ok(())
    } else {
        Err(Errno(error))
    }
}

/// Read from a descriptor.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let len = unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    };
    IoLenResult(len).errno()?;
    Ok(len as usize)
}

/// Write to a descriptor.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize, Errno> {
    let len = unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    };
    IoLenResult(len).errno()?;
    Ok(len as usize)
}

/// Close a descriptor, ignoring errors.
pub fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd); }
}

static TUN_PATH: &[u8] = b"/dev/net/tun\0";

const TUNSETIFF: libc::c_ulong = 0x4004_54CA;
const IFF_TUN: libc::c_short = 0x0001;

#[repr(C)]
struct TunRequest {
    ifr_name: [libc::c_char; libc::IF_NAMESIZE],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open the tun device and attach it to the named interface.
///
/// Returns the descriptor and the actual interface name (the kernel picks one
/// when `name` is empty). The descriptor delivers raw datagrams prefixed with
/// the 4-byte packet information header.
pub fn open_tun(name: &str) -> Result<(RawFd, String), Errno> {
    let fd = unsafe {
        libc::open(TUN_PATH.as_ptr() as *const libc::c_char, libc::O_RDWR)
    };
    FdResult(fd).errno()?;

    let mut request = TunRequest {
        ifr_name: [0; libc::IF_NAMESIZE],
        ifr_flags: IFF_TUN,
        _pad: [0; 22],
    };
    for (i, byte) in name.as_bytes().iter().take(libc::IF_NAMESIZE - 1).enumerate() {
        request.ifr_name[i] = *byte as libc::c_char;
    }

    let res = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut request as *mut _) };
    if let Err(err) = FdResult(res).errno() {
        close_fd(fd);
        return Err(err);
    }

    if let Err(err) = set_nonblocking(fd) {
        close_fd(fd);
        return Err(err);
    }

    let name = request.ifr_name.iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect();

    Ok((fd, name))
}

static SIGINT_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_sigint(_: libc::c_int) {
    if SIGINT_COUNT.fetch_add(1, Ordering::SeqCst) >= 1 {
        unsafe { libc::abort() };
    }
}

/// Install the SIGINT handler.
///
/// The first signal requests an orderly shutdown through [`interrupted`]; a
/// second one aborts the process.
///
/// [`interrupted`]: fn.interrupted.html
pub fn install_interrupt_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

/// Whether an interrupt signal has been received.
pub fn interrupted() -> bool {
    SIGINT_COUNT.load(Ordering::SeqCst) > 0
}
