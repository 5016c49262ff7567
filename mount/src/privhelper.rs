//! The privilege-separation helper.
//!
//! A small privileged process performs mount/unmount/bind-mount on behalf
//! of the unprivileged daemon. The two sides speak length-prefixed frames
//! over an inherited Unix-domain socketpair; file descriptors ride the
//! frames out-of-band via SCM_RIGHTS.
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};

use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::wire::{recv_frame, send_frame, Reader, Writer};

const MSG_FUSE_MOUNT: u32 = 1;
const MSG_FUSE_UNMOUNT: u32 = 2;
const MSG_BIND_MOUNT: u32 = 3;
const MSG_TAKEOVER_SHUTDOWN: u32 = 4;
const MSG_TAKEOVER_STARTUP: u32 = 5;
const MSG_SET_LOG_FILE: u32 = 6;

const RESP_OK: u32 = 0;
const RESP_ERR: u32 = 1;

/// The fd number the helper process inherits its socket on.
pub const HELPER_SOCKET_FD: RawFd = 3;

fn put_path(w: &mut Writer, path: &Path) {
    w.put_len_bytes(path.as_os_str().as_bytes());
}

fn read_path(r: &mut Reader) -> io::Result<PathBuf> {
    let bytes = r
        .read_len_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
}

/// Client half, held by the daemon. Thread-safe: requests serialize on the
/// socket lock.
pub struct PrivHelperClient {
    stream: Mutex<UnixStream>,
    child: Mutex<Option<Child>>,
}

impl PrivHelperClient {
    /// Spawns the helper as a child process running `exe privhelper` with
    /// one end of a socketpair on fd 3. Must be called while still
    /// privileged, before the daemon drops to its real user.
    pub fn spawn(exe: &Path) -> io::Result<Self> {
        let (client_side, helper_side) = UnixStream::pair()?;
        let helper_fd = helper_side.into_raw_fd();

        let mut command = Command::new(exe);
        command.arg("privhelper");
        unsafe {
            command.pre_exec(move || {
                if libc::dup2(helper_fd, HELPER_SOCKET_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn()?;
        // the helper's copy travels with the child
        unsafe { libc::close(helper_fd) };

        Ok(Self {
            stream: Mutex::new(client_side),
            child: Mutex::new(Some(child)),
        })
    }

    /// Wraps an already-connected socket (tests, takeover).
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            child: Mutex::new(None),
        }
    }

    fn request(
        &self,
        msg_type: u32,
        body: &[u8],
        fds: &[RawFd],
    ) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
        let stream = self.stream.lock();
        send_frame(&stream, msg_type, body, fds)?;
        let (resp_type, resp_body, resp_fds) = recv_frame(&stream)?;
        match resp_type {
            RESP_OK => Ok((resp_body, resp_fds)),
            RESP_ERR => {
                let mut r = Reader::new(&resp_body);
                let errno = r.read_u32().unwrap_or(0);
                let message = r
                    .read_len_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Err(if errno != 0 {
                    io::Error::from_raw_os_error(errno as i32)
                } else {
                    io::Error::new(io::ErrorKind::Other, message)
                })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected helper response type {other}"),
            )),
        }
    }

    /// Mounts a FUSE filesystem at `path`, returning the kernel channel fd.
    #[instrument(skip(self))]
    pub fn fuse_mount(&self, path: &Path) -> io::Result<OwnedFd> {
        let mut w = Writer::new();
        put_path(&mut w, path);
        let (_, mut fds) = self.request(MSG_FUSE_MOUNT, &w.finish(), &[])?;
        fds.pop().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "helper sent no mount fd")
        })
    }

    #[instrument(skip(self))]
    pub fn fuse_unmount(&self, path: &Path) -> io::Result<()> {
        let mut w = Writer::new();
        put_path(&mut w, path);
        self.request(MSG_FUSE_UNMOUNT, &w.finish(), &[]).map(|_| ())
    }

    #[instrument(skip(self))]
    pub fn bind_mount(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut w = Writer::new();
        put_path(&mut w, from);
        put_path(&mut w, to);
        self.request(MSG_BIND_MOUNT, &w.finish(), &[]).map(|_| ())
    }

    /// Tells the helper this mount is being handed to a successor daemon
    /// and must not be unmounted when this client goes away.
    #[instrument(skip(self))]
    pub fn fuse_takeover_shutdown(&self, path: &Path) -> io::Result<()> {
        let mut w = Writer::new();
        put_path(&mut w, path);
        self.request(MSG_TAKEOVER_SHUTDOWN, &w.finish(), &[])
            .map(|_| ())
    }

    /// Announces an inherited mount (with its bind mounts) to the helper.
    #[instrument(skip(self))]
    pub fn fuse_takeover_startup(&self, path: &Path, bind_mounts: &[PathBuf]) -> io::Result<()> {
        let mut w = Writer::new();
        put_path(&mut w, path);
        w.put_u32(bind_mounts.len() as u32);
        for bind_mount in bind_mounts {
            put_path(&mut w, bind_mount);
        }
        self.request(MSG_TAKEOVER_STARTUP, &w.finish(), &[])
            .map(|_| ())
    }

    /// Redirects the helper's log output to the given descriptor.
    pub fn set_log_file(&self, fd: RawFd) -> io::Result<()> {
        self.request(MSG_SET_LOG_FILE, &[], &[fd]).map(|_| ())
    }

    /// Closes the socket and reaps the helper, returning its exit status so
    /// startup failures can be surfaced.
    pub fn stop(&self) -> io::Result<Option<ExitStatus>> {
        // dropping our end makes the helper's serve loop exit
        drop(self.stream.lock().shutdown(std::net::Shutdown::Both));
        match self.child.lock().take() {
            Some(mut child) => Ok(Some(child.wait()?)),
            None => Ok(None),
        }
    }
}

/// What the helper actually does for each message. Split out so the frame
/// plumbing is testable without root.
pub trait PrivHelperHandler: Send {
    fn fuse_mount(&mut self, path: &Path) -> io::Result<OwnedFd>;
    fn fuse_unmount(&mut self, path: &Path) -> io::Result<()>;
    fn bind_mount(&mut self, from: &Path, to: &Path) -> io::Result<()>;
    fn takeover_shutdown(&mut self, path: &Path) -> io::Result<()>;
    fn takeover_startup(&mut self, path: &Path, bind_mounts: &[PathBuf]) -> io::Result<()>;
    fn set_log_file(&mut self, fd: OwnedFd) -> io::Result<()>;
}

/// The real, privileged handler.
pub struct MountHandler;

impl PrivHelperHandler for MountHandler {
    fn fuse_mount(&mut self, path: &Path) -> io::Result<OwnedFd> {
        use std::fs::OpenOptions;

        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/fuse")?;
        let fd = OwnedFd::from(device);

        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let data = format!(
            "fd={},rootmode=40000,user_id={},group_id={},default_permissions",
            fd.as_raw_fd(),
            uid,
            gid
        );
        nix::mount::mount(
            Some("weft"),
            path,
            Some("fuse"),
            nix::mount::MsFlags::MS_NOSUID | nix::mount::MsFlags::MS_NODEV,
            Some(data.as_str()),
        )
        .map_err(io::Error::from)?;

        info!(?path, "mounted fuse filesystem");
        Ok(fd)
    }

    fn fuse_unmount(&mut self, path: &Path) -> io::Result<()> {
        nix::mount::umount2(path, nix::mount::MntFlags::MNT_FORCE).map_err(io::Error::from)
    }

    fn bind_mount(&mut self, from: &Path, to: &Path) -> io::Result<()> {
        nix::mount::mount(
            Some(from),
            to,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(io::Error::from)
    }

    fn takeover_shutdown(&mut self, path: &Path) -> io::Result<()> {
        // The mount stays alive; the successor inherits the kernel fd.
        info!(?path, "mount handed over");
        Ok(())
    }

    fn takeover_startup(&mut self, path: &Path, bind_mounts: &[PathBuf]) -> io::Result<()> {
        info!(?path, bind_mounts = bind_mounts.len(), "mount inherited");
        Ok(())
    }

    fn set_log_file(&mut self, fd: OwnedFd) -> io::Result<()> {
        nix::unistd::dup2(fd.as_raw_fd(), libc::STDERR_FILENO).map_err(io::Error::from)?;
        Ok(())
    }
}

/// The helper's serve loop: handles requests until the daemon side closes
/// the socket. Runs inside the privileged helper process.
pub fn serve(stream: UnixStream, handler: &mut dyn PrivHelperHandler) -> io::Result<()> {
    loop {
        let (msg_type, body, mut fds) = match recv_frame(&stream) {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut response_fd: Option<OwnedFd> = None;
        let result: io::Result<()> = (|| {
            let mut r = Reader::new(&body);
            match msg_type {
                MSG_FUSE_MOUNT => {
                    let path = read_path(&mut r)?;
                    response_fd = Some(handler.fuse_mount(&path)?);
                    Ok(())
                }
                MSG_FUSE_UNMOUNT => {
                    let path = read_path(&mut r)?;
                    handler.fuse_unmount(&path)
                }
                MSG_BIND_MOUNT => {
                    let from = read_path(&mut r)?;
                    let to = read_path(&mut r)?;
                    handler.bind_mount(&from, &to)
                }
                MSG_TAKEOVER_SHUTDOWN => {
                    let path = read_path(&mut r)?;
                    handler.takeover_shutdown(&path)
                }
                MSG_TAKEOVER_STARTUP => {
                    let path = read_path(&mut r)?;
                    let count = r
                        .read_u32()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    let mut bind_mounts = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        bind_mounts.push(read_path(&mut r)?);
                    }
                    handler.takeover_startup(&path, &bind_mounts)
                }
                MSG_SET_LOG_FILE => {
                    let fd = fds.pop().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "missing log fd")
                    })?;
                    handler.set_log_file(fd)
                }
                other => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown helper message type {other}"),
                )),
            }
        })();

        match result {
            Ok(()) => {
                let fds: Vec<RawFd> = response_fd.iter().map(|fd| fd.as_raw_fd()).collect();
                send_frame(&stream, RESP_OK, &[], &fds)?;
            }
            Err(e) => {
                warn!(msg_type, error = %e, "helper request failed");
                let mut w = Writer::new();
                w.put_u32(e.raw_os_error().unwrap_or(0) as u32);
                w.put_len_bytes(e.to_string().as_bytes());
                send_frame(&stream, RESP_ERR, &w.finish(), &[])?;
            }
        }
    }
}

/// Entry point for the `privhelper` subcommand: serve on the inherited fd.
pub fn run_inherited() -> io::Result<()> {
    let stream = unsafe { UnixStream::from_raw_fd(HELPER_SOCKET_FD) };
    serve(stream, &mut MountHandler)
}
