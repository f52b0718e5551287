use crate::context::Daemon;
use crate::dispatcher;
use mailq::{Envelope, QueueKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// How many entries each drain iteration takes from the queue.
const DRAIN_BATCH_SIZE: usize = 50;

/// The periodic sweep that catches entries whose backoff has elapsed.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period after a submission wakeup, so a burst of related
/// submissions coalesces into a single drain.
const COALESCE_WINDOW: Duration = Duration::from_secs(3);

/// The delivery loop. Reclaims interrupted work once at startup, then
/// alternates between draining everything currently due and waiting for
/// either a submission wakeup or the periodic sweep.
pub async fn run(
    ctx: Arc<Daemon>,
    mut wakeup: mpsc::Receiver<()>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    match ctx.queue.recover() {
        Ok(0) => {}
        Ok(moved) => tracing::info!("recovered {moved} in-flight message(s)"),
        Err(err) => tracing::error!("error recovering in-flight messages: {err:#}"),
    }

    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick is immediate; the unconditional drain below covers it.
    sweep.tick().await;

    loop {
        drain(&ctx);

        tokio::select! {
            _ = sweep.tick() => {}
            Some(()) = wakeup.recv() => {
                tokio::time::sleep(COALESCE_WINDOW).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("scheduler shutting down");
                return Ok(());
            }
        }
    }
}

/// Take batches off the queue until nothing more is due, grouping each
/// batch by destination host and spawning one delivery worker per host.
/// Workers run detached: their entries sit in the outgoing partition, so
/// the next drain cannot hand them out twice.
fn drain(ctx: &Arc<Daemon>) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::new();

    loop {
        let (batch, err) = ctx.queue.pop_batch(DRAIN_BATCH_SIZE);
        let drained = batch.is_empty();

        for (host, entries) in group_batch(batch) {
            let ctx = Arc::clone(ctx);
            workers.push(tokio::spawn(async move {
                dispatcher::deliver_batch(&ctx, &host, entries).await;
            }));
        }

        if let Some(err) = err {
            tracing::error!("error draining queue: {err:#}");
            break;
        }
        // An empty batch means nothing further is due right now.
        if drained {
            break;
        }
    }

    workers
}

fn group_batch(batch: Vec<(QueueKey, Envelope)>) -> HashMap<String, Vec<(QueueKey, Envelope)>> {
    let mut by_host: HashMap<String, Vec<(QueueKey, Envelope)>> = HashMap::new();
    for (key, env) in batch {
        by_host.entry(env.host.clone()).or_default().push((key, env));
    }
    by_host
}

#[cfg(test)]
mod test {
    use super::*;
    use mailq::MailQueue;

    #[tokio::test]
    async fn drain_groups_by_host_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MailQueue::open(dir.path().join("q")).unwrap());
        let (ctx, _wakeup) = Daemon::new(queue, None, "localhost".to_string());

        // Two separate submissions to the test domain; the short-circuit
        // path lets this run without any network access.
        for n in 0..2 {
            ctx.queue
                .push(&Envelope::new(
                    "example.com".to_string(),
                    format!("sender-{n}@origin.test"),
                    vec![format!("rcpt-{n}@example.com")],
                    Vec::new(),
                ))
                .unwrap();
        }

        let workers = drain(&ctx);
        // Same destination host: a single worker handles the batch.
        k9::assert_equal!(workers.len(), 1);
        for worker in workers {
            worker.await.unwrap();
        }

        k9::assert_equal!(ctx.queue.len(), 0);
        k9::assert_equal!(ctx.queue.in_flight_len(), 0);
        k9::assert_equal!(ctx.queue.dead_len(), 0);
    }

    #[tokio::test]
    async fn drain_on_empty_queue_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MailQueue::open(dir.path().join("q")).unwrap());
        let (ctx, _wakeup) = Daemon::new(queue, None, "localhost".to_string());
        assert!(drain(&ctx).is_empty());
    }
}
