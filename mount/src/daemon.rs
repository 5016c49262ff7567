//! Daemon lifecycle: the process lock, service wiring, signal handling and
//! the takeover accept loop.
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use weft_castore::backingstore::BackingStore;
use weft_castore::localstore::RedbLocalStore;
use weft_castore::objectstore::ObjectStore;

use crate::config::CheckoutConfig;
use crate::fs::fuse::FuseDaemon;
use crate::fs::WorkingCopyFs;
use crate::mount::Mount;
use crate::overlay::FsOverlay;
use crate::privhelper::PrivHelperClient;
use crate::takeover::{
    self, SerializedFileHandle, TakeoverData, TAKEOVER_SOCKET_NAME,
};

pub const LOCK_FILE_NAME: &str = "lock";
const LOCAL_STORE_FILE_NAME: &str = "local-store.redb";

#[derive(Clone, Debug)]
pub struct DaemonOptions {
    pub state_dir: PathBuf,
    pub mountpoint: PathBuf,
    pub fuse_threads: usize,
    pub allow_other: bool,
}

/// Installs the process-wide tracing subscriber, filtered by RUST_LOG.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Takes the state directory's `lock` file and writes our pid into it.
/// The descriptor is intentionally leaked; the kernel drops the lock when
/// the process exits.
pub fn acquire_process_lock(state_dir: &Path) -> io::Result<RawFd> {
    let path = state_dir.join(LOCK_FILE_NAME);
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)?;

    nix::fcntl::flock(
        file.as_raw_fd(),
        nix::fcntl::FlockArg::LockExclusiveNonblock,
    )
    .map_err(|_| {
        io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("another daemon holds {}", path.display()),
        )
    })?;

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;

    let fd = file.as_raw_fd();
    std::mem::forget(file);
    Ok(fd)
}

/// Everything a running daemon owns.
pub struct Daemon {
    pub options: DaemonOptions,
    pub config: CheckoutConfig,
    pub mount: Arc<Mount>,
    pub privhelper: Option<PrivHelperClient>,
    pub fuse: Option<FuseDaemon>,
    lock_fd: RawFd,
}

impl Daemon {
    /// Wires up stores and mount state. The backing store is the caller's:
    /// repo-format adapters live outside this crate.
    pub async fn start(
        options: DaemonOptions,
        backing: Arc<dyn BackingStore>,
    ) -> Result<Daemon, Box<dyn std::error::Error + Send + Sync>> {
        let lock_fd = acquire_process_lock(&options.state_dir)?;
        let config = CheckoutConfig::load(&options.state_dir)?;
        let root_hash = config.snapshot()?;

        let privhelper = match std::env::current_exe()
            .and_then(|exe| PrivHelperClient::spawn(&exe))
        {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "privilege helper unavailable; mounts need external setup");
                None
            }
        };

        let local = Arc::new(
            RedbLocalStore::new(options.state_dir.join(LOCAL_STORE_FILE_NAME)).await?,
        );
        let store = ObjectStore::new(backing, local);
        let overlay = Arc::new(FsOverlay::new(config.overlay_path()));

        // A predecessor with a live takeover socket hands us its state.
        let takeover_socket = options.state_dir.join(TAKEOVER_SOCKET_NAME);
        let mount = if takeover_socket.exists() {
            match tokio::task::spawn_blocking({
                let takeover_socket = takeover_socket.clone();
                move || takeover::request_takeover(&takeover_socket)
            })
            .await?
            {
                Ok((data, _fds)) => {
                    info!(
                        mounts = data.mounts.len(),
                        next_inode = data.next_inode_number,
                        "inherited mounts from predecessor"
                    );
                    Mount::resume(store, overlay, root_hash, data.next_inode_number).await?
                }
                Err(e) => {
                    warn!(error = %e, "takeover failed; starting fresh");
                    Mount::new(store, overlay, root_hash).await?
                }
            }
        } else {
            Mount::new(store, overlay, root_hash).await?
        };

        Ok(Daemon {
            options,
            config,
            mount,
            privhelper,
            fuse: None,
            lock_fd,
        })
    }

    /// Mounts the FUSE filesystem and starts serving.
    pub fn serve(&mut self) -> io::Result<()> {
        let fs = WorkingCopyFs::new(self.mount.clone());
        let fuse = FuseDaemon::new(
            fs,
            &self.options.mountpoint,
            self.options.fuse_threads,
            self.options.allow_other,
        )?;
        self.fuse = Some(fuse);

        if let Some(ref privhelper) = self.privhelper {
            for bind_mount in &self.config.bind_mounts {
                let target = self.options.mountpoint.join(&bind_mount.client_path);
                if let Err(e) =
                    privhelper.bind_mount(Path::new(&bind_mount.mount_path), &target)
                {
                    warn!(error = %e, client_path = %bind_mount.client_path, "bind mount failed");
                }
            }
        }
        Ok(())
    }

    /// The takeover snapshot of this daemon and the descriptors that go
    /// with it.
    pub async fn takeover_data(&self) -> (TakeoverData, Vec<RawFd>) {
        let mount = takeover::serialize_mount(
            &self.mount,
            self.options.mountpoint.clone(),
            self.options.state_dir.clone(),
            self.config
                .bind_mounts
                .iter()
                .map(|b| {
                    (
                        PathBuf::from(&b.client_path),
                        PathBuf::from(&b.mount_path),
                    )
                })
                .collect(),
            Vec::<SerializedFileHandle>::new(),
            )
        .await;

        let data = TakeoverData {
            version: takeover::SUPPORTED_VERSIONS[0],
            next_inode_number: self.mount.next_inode_number(),
            mounts: vec![mount],
        };
        (data, vec![self.lock_fd])
    }

    /// Runs until a termination signal or a successful takeover handshake.
    /// Returns the process exit code.
    pub async fn run_until_shutdown(&mut self) -> i32 {
        let listener = match takeover::bind_socket(&self.options.state_dir) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to bind the takeover socket");
                return 1;
            }
        };

        let (handoff_tx, mut handoff_rx) = tokio::sync::mpsc::channel::<()>(1);
        let (data, fds) = self.takeover_data().await;
        std::thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, _)) => match takeover::serve_handshake(&stream, &data, &fds) {
                    Ok(true) => {
                        let _ = handoff_tx.blocking_send(());
                        return;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        // successor died mid-handshake; roll back and keep
                        // serving
                        warn!(error = %e, "takeover handshake failed; still serving");
                        continue;
                    }
                },
                Err(e) => {
                    error!(error = %e, "takeover accept failed");
                    return;
                }
            }
        });

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler cannot fail");

        let handed_off = tokio::select! {
            _ = tokio::signal::ctrl_c() => false,
            _ = sigterm.recv() => false,
            _ = handoff_rx.recv() => true,
        };

        if handed_off {
            info!("mounts handed to successor; exiting without unmount");
            if let Some(ref privhelper) = self.privhelper {
                let _ = privhelper.fuse_takeover_shutdown(&self.options.mountpoint);
            }
        } else {
            info!("shutting down");
            if let Err(e) = self.mount.close().await {
                warn!(error = %e, "overlay close failed");
            }
            if let Some(fuse) = self.fuse.take() {
                if let Err(e) = fuse.unmount() {
                    warn!(error = %e, "unmount failed");
                }
            }
        }

        if let Some(ref privhelper) = self.privhelper {
            match privhelper.stop() {
                Ok(Some(status)) if !status.success() => {
                    warn!(?status, "privilege helper exited uncleanly");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to stop the privilege helper"),
            }
        }
        0
    }
}
