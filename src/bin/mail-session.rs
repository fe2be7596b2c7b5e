//! Mail-session process: the store side of the session-pipe protocol.
//!
//! Spawned by the pop3-rs dispatcher under the authenticated user's uid/gid
//! with the session pipe wired to stdin/stdout. Exits after COMMIT or when
//! the protocol-handler closes its pipe ends.

use anyhow::{bail, Context};
use clap::Parser;
use pop3_rs::storage::{session::serve_session, MaildirStore};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mail-session", about = "Serve one mailbox over the session pipe")]
struct Args {
    /// Store backend type.
    #[arg(long = "type", default_value = "maildir")]
    store_type: String,

    /// Base path of the message store.
    #[arg(long)]
    basepath: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the wire protocol; logs go to stderr only.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    if args.store_type != "maildir" {
        bail!("unsupported store type: {}", args.store_type);
    }

    let mut store = MaildirStore::new(args.basepath);
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();

    serve_session(&mut store, stdin, stdout).context("session pipe failure")?;
    Ok(())
}
