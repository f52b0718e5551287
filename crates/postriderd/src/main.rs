use anyhow::Context;
use clap::Parser;
use mailq::MailQueue;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod context;
mod dispatcher;
mod grouper;
mod scheduler;
mod signer;
mod smtp_server;

use context::Daemon;
use signer::Signer;

/// Outbound SMTP relay daemon.
///
/// Accepts mail from trusted local clients on the submission socket,
/// spools it to disk, and delivers it asynchronously to the MX hosts of
/// each recipient domain.
#[derive(Clone, Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Name to present in EHLO when talking to remote MX hosts.
    #[arg(long, default_value = "localhost")]
    localname: String,

    /// Address the submission listener binds to.
    #[arg(long, default_value = "127.0.0.1:587")]
    listen: String,

    /// Path of the queue database.
    #[arg(long, default_value = "postrider.db")]
    spool: PathBuf,

    /// Path to a PEM-encoded PKCS#1 RSA private key used to DKIM-sign
    /// outgoing mail. Signing requires --dkim-domain and --dkim-selector
    /// as well.
    #[arg(long)]
    dkim_key: Option<PathBuf>,

    /// DKIM signing domain.
    #[arg(long)]
    dkim_domain: Option<String>,

    /// DKIM selector.
    #[arg(long)]
    dkim_selector: Option<String>,
}

fn init_logging() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(
        std::env::var("POSTRIDER_LOG")
            .as_deref()
            .unwrap_or("postriderd=info,mailq=info,smtp_client=info,dns_resolver=info"),
    )?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_thread_names(true)
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
    Ok(())
}

/// Signing runs only when the full DKIM configuration is present and the
/// key parses; in every other case the daemon delivers unsigned and says
/// why.
fn build_signer(opts: &Opt) -> Option<Arc<Signer>> {
    let (key, domain, selector) = match (&opts.dkim_key, &opts.dkim_domain, &opts.dkim_selector) {
        (Some(key), Some(domain), Some(selector)) => (key, domain, selector),
        (None, None, None) => {
            tracing::info!("no DKIM configuration, emails will not be signed");
            return None;
        }
        _ => {
            tracing::warn!(
                "incomplete DKIM configuration (need --dkim-key, --dkim-domain \
                 and --dkim-selector), emails will not be signed"
            );
            return None;
        }
    };

    let pem = match std::fs::read_to_string(key) {
        Ok(pem) => pem,
        Err(err) => {
            tracing::warn!(
                "could not read DKIM key {}: {err}, emails will not be signed",
                key.display()
            );
            return None;
        }
    };

    match Signer::new(domain, selector, &pem) {
        Ok(signer) => {
            tracing::info!("DKIM signing enabled for {domain} with selector {selector}");
            Some(Arc::new(signer))
        }
        Err(err) => {
            tracing::warn!("could not parse DKIM private key: {err:#}, emails will not be signed");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    init_logging()?;

    tracing::info!("localname: {}", opts.localname);

    let queue = Arc::new(
        MailQueue::open(&opts.spool)
            .with_context(|| format!("opening queue database {}", opts.spool.display()))?,
    );
    let signer = build_signer(&opts);

    let (daemon, wakeup_rx) = Daemon::new(Arc::clone(&queue), signer, opts.localname.clone());

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler = tokio::spawn(scheduler::run(
        Arc::clone(&daemon),
        wakeup_rx,
        shutdown_tx.subscribe(),
    ));

    let listener = TcpListener::bind(&opts.listen)
        .await
        .with_context(|| format!("binding submission listener on {}", opts.listen))?;
    tracing::info!("listening on {}", opts.listen);

    tokio::select! {
        result = smtp_server::serve(daemon, listener) => {
            result.context("submission listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    shutdown_tx.send(()).ok();
    scheduler.await?.ok();
    queue.flush()?;
    Ok(())
}
