//! PTY byte-stream endpoint.
//!
//! Wraps a pseudo-terminal master so external programs can talk to the
//! voice system through the slave side (optionally published under a
//! stable symlink). Received bytes arrive through the `data_received`
//! signal, driven by a reactor read watch. The endpoint keeps its own
//! slave descriptor open so the master stays usable while no external
//! client is attached.

use anyhow::{anyhow, Context, Result};
use std::cell::RefCell;
use std::ffi::CStr;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::rc::Rc;

use crate::reactor::{FdWatch, FdWatchDir, Reactor};
use crate::signal::Signal;

struct PtyState {
    master: RawFd,
    slave: RawFd,
    slave_path: Option<PathBuf>,
    watch: Option<FdWatch>,
}

impl PtyState {
    fn closed() -> Self {
        Self {
            master: -1,
            slave: -1,
            slave_path: None,
            watch: None,
        }
    }
}

struct PtyInner {
    reactor: Reactor,
    slave_link: Option<PathBuf>,
    state: RefCell<PtyState>,
    data_received: Signal<[u8]>,
}

/// A reactor-driven PTY master endpoint. Cheaply cloneable handle; the
/// descriptors close when the last handle goes away.
#[derive(Clone)]
pub struct Pty {
    inner: Rc<PtyInner>,
}

impl Pty {
    /// `slave_link`, when given, is a filesystem path kept as a symlink to
    /// the slave device while the PTY is open.
    pub fn new(reactor: &Reactor, slave_link: Option<PathBuf>) -> Self {
        Self {
            inner: Rc::new(PtyInner {
                reactor: reactor.clone(),
                slave_link,
                state: RefCell::new(PtyState::closed()),
                data_received: Signal::new(),
            }),
        }
    }

    /// Bytes written to the slave side by external clients.
    pub fn data_received(&self) -> &Signal<[u8]> {
        &self.inner.data_received
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.borrow().master >= 0
    }

    pub fn slave_path(&self) -> Option<PathBuf> {
        self.inner.state.borrow().slave_path.clone()
    }

    /// Open the PTY. An already open endpoint is closed first.
    pub fn open(&self) -> Result<()> {
        if self.is_open() {
            self.close();
        }

        let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
        if master < 0 {
            return Err(io_err("posix_openpt failed"));
        }
        let mut guard = FdGuard(master);
        if unsafe { libc::grantpt(master) } != 0 {
            return Err(io_err("grantpt failed"));
        }
        if unsafe { libc::unlockpt(master) } != 0 {
            return Err(io_err("unlockpt failed"));
        }
        let slave_path = slave_name(master)?;

        // Hold our own slave descriptor so reads on the master do not
        // report EOF while no external client is attached.
        let slave = {
            let cpath = std::ffi::CString::new(slave_path.as_os_str().as_bytes())
                .context("slave path contains NUL")?;
            unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) }
        };
        if slave < 0 {
            return Err(io_err("opening the slave side failed"));
        }
        let mut slave_guard = FdGuard(slave);
        set_nonblocking(master)?;

        if let Some(link) = &self.inner.slave_link {
            let _ = fs::remove_file(link);
            symlink(&slave_path, link)
                .with_context(|| format!("linking {} failed", link.display()))?;
        }

        let weak = Rc::downgrade(&self.inner);
        let watch = self
            .inner
            .reactor
            .add_fd_watch(master, FdWatchDir::Read, move || {
                if let Some(inner) = weak.upgrade() {
                    on_readable(&inner);
                }
            });

        let mut state = self.inner.state.borrow_mut();
        state.master = guard.release();
        state.slave = slave_guard.release();
        state.slave_path = Some(slave_path.clone());
        state.watch = Some(watch);
        tracing::debug!(slave = %slave_path.display(), "pty opened");
        Ok(())
    }

    /// Close the PTY if it is open. Safe to call in any state; registered
    /// `data_received` slots stay connected.
    pub fn close(&self) {
        close_state(&self.inner);
    }

    /// Close and open again. On failure the endpoint stays closed.
    pub fn reopen(&self) -> Result<()> {
        self.close();
        self.open()
    }

    /// Write bytes towards the slave side. Returns the number written;
    /// zero means the line is congested and nothing was taken.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let master = self.inner.state.borrow().master;
        if master < 0 {
            return Err(anyhow!("pty is not open"));
        }
        loop {
            let n = unsafe { libc::write(master, data.as_ptr() as *const libc::c_void, data.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(0),
                _ => return Err(anyhow!("write to pty failed: {err}")),
            }
        }
    }
}

fn close_state(inner: &Rc<PtyInner>) {
    let mut state = inner.state.borrow_mut();
    if state.master < 0 {
        return;
    }
    if let Some(link) = &inner.slave_link {
        let _ = fs::remove_file(link);
    }
    state.watch = None;
    unsafe {
        libc::close(state.slave);
        libc::close(state.master);
    }
    *state = PtyState::closed();
    tracing::debug!("pty closed");
}

fn on_readable(inner: &Rc<PtyInner>) {
    let master = inner.state.borrow().master;
    if master < 0 {
        return;
    }
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(master, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            inner.data_received.emit(&buf[..n as usize]);
            continue;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    tracing::warn!(%err, "pty read error, reopening");
                }
            }
        }
        // EOF or a hard error: the slave side hung up. Reopen so the
        // endpoint survives reconnecting clients.
        close_state(inner);
        let pty = Pty {
            inner: Rc::clone(inner),
        };
        if let Err(err) = pty.open() {
            tracing::warn!(%err, "pty reopen failed, endpoint stays closed");
        }
        return;
    }
}

fn slave_name(master: RawFd) -> Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    if unsafe { libc::ptsname_r(master, buf.as_mut_ptr(), buf.len()) } != 0 {
        return Err(io_err("ptsname_r failed"));
    }
    let cstr = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(
        std::ffi::OsStr::from_bytes(cstr.to_bytes()).to_os_string(),
    ))
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io_err("F_GETFL failed"));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io_err("F_SETFL failed"));
    }
    Ok(())
}

fn io_err(what: &str) -> anyhow::Error {
    anyhow!("{what}: {}", io::Error::last_os_error())
}

/// Closes the held descriptor unless released.
struct FdGuard(RawFd);

impl FdGuard {
    fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.0, -1)
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { libc::close(self.0) };
        }
    }
}

impl Drop for PtyInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.master >= 0 {
            if let Some(link) = &self.slave_link {
                let _ = fs::remove_file(link);
            }
            unsafe {
                libc::close(state.slave);
                libc::close(state.master);
            }
        }
    }
}
