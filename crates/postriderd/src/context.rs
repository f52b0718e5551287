use crate::grouper::group_by_host;
use crate::signer::Signer;
use mailq::MailQueue;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message accepted by the submission listener, before per-host
/// grouping. Recipients may span any number of destination domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub from: String,
    pub to: Vec<String>,
    pub data: Vec<u8>,
}

/// Everything the listener, scheduler and workers share. One instance
/// per daemon, threaded explicitly rather than held in globals.
pub struct Daemon {
    pub queue: Arc<MailQueue>,
    pub signer: Option<Arc<Signer>>,
    pub localname: String,
    wakeup: mpsc::Sender<()>,
}

impl Daemon {
    /// Build the context plus the receiving side of the scheduler wakeup
    /// signal. The channel holds a single slot: if a signal is already
    /// pending, another would be redundant.
    pub fn new(
        queue: Arc<MailQueue>,
        signer: Option<Arc<Signer>>,
        localname: String,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (wakeup, wakeup_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                queue,
                signer,
                localname,
                wakeup,
            }),
            wakeup_rx,
        )
    }

    /// Accept one submitted message: split it into per-host envelopes,
    /// persist each, then nudge the scheduler. Individual push failures
    /// are logged and do not block the remaining envelopes.
    pub fn submit(&self, msg: &Submission) {
        for env in group_by_host(msg) {
            let host = env.host.clone();
            match self.queue.push(&env) {
                Ok(_) => {
                    tracing::info!(
                        "queued message for {host}, queue length is now {}",
                        self.queue.len()
                    );
                }
                Err(err) => {
                    tracing::error!("failed to queue message for {host}: {err:#}");
                }
            }
        }

        self.notify();
    }

    /// Non-blocking scheduler wakeup. A full slot means a wakeup is
    /// already pending and this one can be dropped.
    pub fn notify(&self) {
        let _ = self.wakeup.try_send(());
    }
}
