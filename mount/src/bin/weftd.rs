//! The weft daemon: mounts a virtualized working copy and serves it until
//! shutdown or takeover by a successor.
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use weft_castore::backingstore::{BackingStore, FakeBackingStore};
use weft_mount::daemon::{self, Daemon, DaemonOptions};
use weft_mount::privhelper;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon for one checkout.
    Daemon(DaemonArgs),
    /// Internal: the privileged mount helper, speaking on an inherited fd.
    #[command(hide = true)]
    Privhelper,
}

#[derive(Args)]
struct DaemonArgs {
    /// State directory holding config.json, the lock file and caches.
    #[arg(long)]
    state_dir: PathBuf,

    /// Where to mount the working copy.
    #[arg(long)]
    mountpoint: PathBuf,

    /// Number of kernel channel threads.
    #[arg(long, default_value_t = 4)]
    fuse_threads: usize,

    /// Let other users access the mount.
    #[arg(long)]
    allow_other: bool,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Privhelper => match privhelper::run_inherited() {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("privhelper: {e}");
                std::process::ExitCode::FAILURE
            }
        },
        Command::Daemon(args) => {
            daemon::init_tracing();

            let options = DaemonOptions {
                state_dir: args.state_dir,
                mountpoint: args.mountpoint,
                fuse_threads: args.fuse_threads,
                allow_other: args.allow_other,
            };

            // Repo-format adapters plug in here; out of the box only the
            // in-memory store is wired up.
            let backing: Arc<dyn BackingStore> = Arc::new(FakeBackingStore::new());

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("building the tokio runtime cannot fail at startup");

            let code = runtime.block_on(async move {
                let mut daemon = match Daemon::start(options, backing).await {
                    Ok(daemon) => daemon,
                    Err(e) => {
                        eprintln!("startup failed: {e}");
                        return 1;
                    }
                };
                if let Err(e) = daemon.serve() {
                    eprintln!("failed to mount: {e}");
                    return 1;
                }
                daemon.run_until_shutdown().await
            });

            std::process::ExitCode::from(code as u8)
        }
    }
}
