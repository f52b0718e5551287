use crate::clock::{Clock, WallClock};
use crate::envelope::Envelope;
use chrono::{DateTime, SecondsFormat, Utc};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, Transactional,
};
use sled::{Config, Db, Mode, Tree};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const INCOMING: &str = "incoming";
const OUTGOING: &str = "outgoing";
const DEAD: &str = "dead";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message {0} is not present in the outgoing partition")]
    NotInFlight(QueueKey),
    #[error("malformed queue key {0:?}")]
    MalformedKey(String),
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error("envelope record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Identifies a stored envelope. The key text is the entry's
/// eligible-at instant rendered as RFC3339 UTC with a full nine digits of
/// fractional seconds, so the lexicographic order sled maintains is
/// exactly eligibility order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey(String);

impl QueueKey {
    fn from_instant(instant: DateTime<Utc>) -> Self {
        Self(instant.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, QueueError> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(Self(text.to_string())),
            Err(_) => Err(QueueError::MalformedKey(
                String::from_utf8_lossy(bytes).to_string(),
            )),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The instant at which this entry becomes eligible for delivery.
    pub fn instant(&self) -> Result<DateTime<Utc>, QueueError> {
        DateTime::parse_from_rfc3339(&self.0)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| QueueError::MalformedKey(self.0.clone()))
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

/// Retry spacing: attempt `n` waits `n²` minutes, counted from the moment
/// the retry is recorded.
pub fn backoff(retry: u32) -> chrono::Duration {
    chrono::Duration::minutes(i64::from(retry) * i64::from(retry))
}

/// The persistent queue. All state lives in the sled database; this
/// handle is cheap to share behind an `Arc` and every mutation that spans
/// partitions is a single sled transaction.
pub struct MailQueue {
    db: Db,
    incoming: Tree,
    outgoing: Tree,
    dead: Tree,
    clock: Arc<dyn Clock>,
    // Instant of the most recently issued push/recover key. Keys must be
    // unique per partition, so a clock reading that fails to advance is
    // bumped 1ns past the previous key.
    last_key: Mutex<Option<DateTime<Utc>>>,
    sync_writes: bool,
}

impl MailQueue {
    /// Open (creating if necessary) the queue database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        Self::open_with_clock(path, Arc::new(WallClock))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let db = Config::new()
            .path(path.as_ref())
            .mode(Mode::HighThroughput)
            .use_compression(false)
            .open()?;

        let incoming = db.open_tree(INCOMING)?;
        let outgoing = db.open_tree(OUTGOING)?;
        let dead = db.open_tree(DEAD)?;

        Ok(Self {
            db,
            incoming,
            outgoing,
            dead,
            clock,
            last_key: Mutex::new(None),
            sync_writes: true,
        })
    }

    /// Insert a newly accepted envelope into `incoming`, keyed by the
    /// current instant so it is immediately eligible.
    pub fn push(&self, env: &Envelope) -> Result<QueueKey, QueueError> {
        let key = self.next_key();
        let bytes = env.encode()?;
        self.incoming.insert(key.as_bytes(), bytes)?;
        self.maybe_flush()?;
        Ok(key)
    }

    /// Take the earliest eligible envelope, moving it `incoming` →
    /// `outgoing` atomically. Returns `None` when the queue is empty or
    /// the head entry is not yet due; keys sort by eligibility, so a
    /// future-dated head means nothing later can be due either.
    pub fn pop(&self) -> Result<Option<(QueueKey, Envelope)>, QueueError> {
        loop {
            let Some((head, _)) = self.incoming.first()? else {
                return Ok(None);
            };
            let key = QueueKey::from_bytes(&head)?;
            if key.instant()? > self.clock.now() {
                return Ok(None);
            }

            let moved = flatten_tx((&self.incoming, &self.outgoing).transaction(
                |(incoming, outgoing)| -> ConflictableTransactionResult<Option<Vec<u8>>, QueueError> {
                    match incoming.remove(head.clone())? {
                        Some(value) => {
                            outgoing.insert(head.clone(), value.clone())?;
                            Ok(Some(value.to_vec()))
                        }
                        // Head vanished between the scan and the
                        // transaction; rescan.
                        None => Ok(None),
                    }
                },
            ))?;

            match moved {
                Some(bytes) => {
                    self.maybe_flush()?;
                    return Ok(Some((key, Envelope::decode(&bytes)?)));
                }
                None => continue,
            }
        }
    }

    /// Pop repeatedly until `max` entries are collected, the head is not
    /// yet due, the queue is empty, or an error occurs. Each pop is its
    /// own transaction; whatever was collected before an error is
    /// returned alongside it.
    pub fn pop_batch(&self, max: usize) -> (Vec<(QueueKey, Envelope)>, Option<QueueError>) {
        let mut entries = Vec::new();
        while entries.len() < max {
            match self.pop() {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break,
                Err(err) => return (entries, Some(err)),
            }
        }
        (entries, None)
    }

    /// Record a failed attempt: increment the retry counter and reinsert
    /// into `incoming` under a new key that becomes eligible after the
    /// quadratic backoff. The outgoing entry at `key` is consumed.
    pub fn retry(&self, key: &QueueKey) -> Result<(), QueueError> {
        let now = self.clock.now();
        flatten_tx((&self.incoming, &self.outgoing).transaction(
            |(incoming, outgoing)| -> ConflictableTransactionResult<(), QueueError> {
                let value = outgoing
                    .remove(key.as_bytes())?
                    .ok_or_else(|| abort(QueueError::NotInFlight(key.clone())))?;
                let mut env = Envelope::decode(&value).map_err(|err| abort(err.into()))?;
                env.retry += 1;
                let due = QueueKey::from_instant(now + backoff(env.retry));
                let bytes = env.encode().map_err(|err| abort(err.into()))?;
                incoming.insert(due.as_bytes(), bytes)?;
                Ok(())
            },
        ))?;
        self.maybe_flush()
    }

    /// Move the outgoing entry at `key` to the dead-letter partition,
    /// preserving the key. Terminal: delivery never reads `dead`.
    pub fn kill(&self, key: &QueueKey) -> Result<(), QueueError> {
        flatten_tx((&self.outgoing, &self.dead).transaction(
            |(outgoing, dead)| -> ConflictableTransactionResult<(), QueueError> {
                let value = outgoing
                    .remove(key.as_bytes())?
                    .ok_or_else(|| abort(QueueError::NotInFlight(key.clone())))?;
                dead.insert(key.as_bytes(), value)?;
                Ok(())
            },
        ))?;
        self.maybe_flush()
    }

    /// Forget a delivered envelope. Removing a key that is already gone
    /// is not an error.
    pub fn remove_delivered(&self, key: &QueueKey) -> Result<(), QueueError> {
        self.outgoing.remove(key.as_bytes())?;
        self.maybe_flush()
    }

    /// Reclaim entries orphaned in `outgoing` by an unclean shutdown,
    /// re-dating each under a fresh key so it is immediately eligible
    /// again. Returns the number of entries moved.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let mut moved = 0;
        while let Some((head, _)) = self.outgoing.first()? {
            let fresh = self.next_key();
            flatten_tx((&self.incoming, &self.outgoing).transaction(
                |(incoming, outgoing)| -> ConflictableTransactionResult<(), QueueError> {
                    if let Some(value) = outgoing.remove(head.clone())? {
                        incoming.insert(fresh.as_bytes(), value)?;
                    }
                    Ok(())
                },
            ))?;
            moved += 1;
        }
        if moved > 0 {
            self.maybe_flush()?;
        }
        Ok(moved)
    }

    /// Number of entries awaiting delivery.
    pub fn len(&self) -> usize {
        self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries currently being attempted.
    pub fn in_flight_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of dead-lettered entries.
    pub fn dead_len(&self) -> usize {
        self.dead.len()
    }

    /// Force all prior mutations to disk.
    pub fn flush(&self) -> Result<(), QueueError> {
        self.db.flush()?;
        Ok(())
    }

    fn maybe_flush(&self) -> Result<(), QueueError> {
        if self.sync_writes {
            self.db.flush()?;
        }
        Ok(())
    }

    fn next_key(&self) -> QueueKey {
        let mut last = self.last_key.lock().unwrap();
        let mut now = self.clock.now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + chrono::Duration::nanoseconds(1);
            }
        }
        *last = Some(now);
        QueueKey::from_instant(now)
    }
}

fn abort(err: QueueError) -> ConflictableTransactionError<QueueError> {
    ConflictableTransactionError::Abort(err)
}

fn flatten_tx<T>(result: Result<T, TransactionError<QueueError>>) -> Result<T, QueueError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(err)) => Err(err),
        Err(TransactionError::Storage(err)) => Err(QueueError::Storage(err)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn sample() -> Envelope {
        Envelope::new(
            "h".to_string(),
            "a".to_string(),
            vec!["x@h".to_string(), "y@h".to_string()],
            b"Subject: hello\r\n\r\nworld\r\n".to_vec(),
        )
    }

    fn manual_clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap())
    }

    impl MailQueue {
        fn in_incoming(&self, key: &QueueKey) -> bool {
            self.incoming.contains_key(key.as_bytes()).unwrap()
        }

        fn in_outgoing(&self, key: &QueueKey) -> bool {
            self.outgoing.contains_key(key.as_bytes()).unwrap()
        }

        fn in_dead(&self, key: &QueueKey) -> bool {
            self.dead.contains_key(key.as_bytes()).unwrap()
        }
    }

    #[test]
    fn push_pop_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let q = MailQueue::open(dir.path().join("q")).unwrap();

        let env = sample();
        let pushed = q.push(&env).unwrap();
        k9::assert_equal!(q.len(), 1);

        let (key, popped) = q.pop().unwrap().expect("entry is due");
        k9::assert_equal!(key, pushed);
        // Every field survives the store, including data bytes, recipient
        // order and the retry counter.
        k9::assert_equal!(popped, env);

        assert!(!q.in_incoming(&key));
        assert!(q.in_outgoing(&key));

        q.remove_delivered(&key).unwrap();
        k9::assert_equal!(q.len(), 0);
        k9::assert_equal!(q.in_flight_len(), 0);
        k9::assert_equal!(q.dead_len(), 0);
    }

    #[test]
    fn pop_on_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let q = MailQueue::open(dir.path().join("q")).unwrap();
        assert!(q.pop().unwrap().is_none());
    }

    #[test]
    fn remove_delivered_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let q = MailQueue::open(dir.path().join("q")).unwrap();
        q.push(&sample()).unwrap();
        let (key, _) = q.pop().unwrap().unwrap();
        q.remove_delivered(&key).unwrap();
        // A second removal of the same key is not an error.
        q.remove_delivered(&key).unwrap();
    }

    #[test]
    fn retry_defers_until_backoff_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let q = MailQueue::open_with_clock(dir.path().join("q"), Arc::new(clock.clone())).unwrap();

        q.push(&sample()).unwrap();
        let (key, _) = q.pop().unwrap().unwrap();
        q.retry(&key).unwrap();

        assert!(!q.in_outgoing(&key));
        // The reinserted entry is dated one minute out, so an immediate
        // pop sees nothing.
        assert!(q.pop().unwrap().is_none());

        clock.advance(chrono::Duration::minutes(1));
        let (key2, env) = q.pop().unwrap().expect("due after backoff");
        k9::assert_equal!(env.retry, 1);
        assert!(key2 != key);
    }

    #[test]
    fn retry_requires_in_flight_entry() {
        let dir = tempfile::tempdir().unwrap();
        let q = MailQueue::open(dir.path().join("q")).unwrap();
        q.push(&sample()).unwrap();
        let (key, _) = q.pop().unwrap().unwrap();
        q.remove_delivered(&key).unwrap();
        assert!(matches!(
            q.retry(&key).unwrap_err(),
            QueueError::NotInFlight(_)
        ));
    }

    #[test]
    fn kill_moves_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let q = MailQueue::open(dir.path().join("q")).unwrap();
        q.push(&sample()).unwrap();
        let (key, _) = q.pop().unwrap().unwrap();
        q.kill(&key).unwrap();

        assert!(!q.in_outgoing(&key));
        assert!(q.in_dead(&key));
        k9::assert_equal!(q.len(), 0);
        k9::assert_equal!(q.dead_len(), 1);
    }

    #[test]
    fn exhausted_retries_reach_the_dead_letter_cap() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let q = MailQueue::open_with_clock(dir.path().join("q"), Arc::new(clock.clone())).unwrap();

        q.push(&sample()).unwrap();

        // Initial attempt plus six retries, stepping the clock over each
        // quadratic backoff window.
        for attempt in 1..=6u32 {
            let (key, env) = q.pop().unwrap().expect("due");
            k9::assert_equal!(env.retry, attempt - 1);
            q.retry(&key).unwrap();
            clock.advance(backoff(attempt));
        }

        let (key, env) = q.pop().unwrap().expect("due");
        k9::assert_equal!(env.retry, 6);
        q.kill(&key).unwrap();

        k9::assert_equal!(q.len(), 0);
        k9::assert_equal!(q.in_flight_len(), 0);
        k9::assert_equal!(q.dead_len(), 1);
    }

    #[test]
    fn recover_after_unclean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        let env = sample();

        let k1 = {
            let q = MailQueue::open(&path).unwrap();
            q.push(&env).unwrap();
            let (k1, _) = q.pop().unwrap().unwrap();
            // Neither removed nor retried: simulate a crash mid-attempt
            // by dropping the handle with the entry still in flight.
            k1
        };

        let q = MailQueue::open(&path).unwrap();
        k9::assert_equal!(q.in_flight_len(), 1);
        k9::assert_equal!(q.recover().unwrap(), 1);
        k9::assert_equal!(q.in_flight_len(), 0);

        let (k2, recovered) = q.pop().unwrap().expect("recovered entry is due");
        // Recovery mints a fresh key but preserves the envelope
        // bit-for-bit.
        assert!(k2 != k1);
        k9::assert_equal!(recovered, env);

        q.remove_delivered(&k2).unwrap();
        k9::assert_equal!(q.len(), 0);
        k9::assert_equal!(q.in_flight_len(), 0);
        k9::assert_equal!(q.dead_len(), 0);
    }

    #[test]
    fn pop_batch_is_fifo_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let q = MailQueue::open(dir.path().join("q")).unwrap();

        let mut keys = Vec::new();
        for n in 0..5 {
            let mut env = sample();
            env.from = format!("sender-{n}");
            keys.push(q.push(&env).unwrap());
        }

        let (batch, err) = q.pop_batch(3);
        assert!(err.is_none());
        k9::assert_equal!(batch.len(), 3);
        for (n, (key, env)) in batch.iter().enumerate() {
            k9::assert_equal!(key, &keys[n]);
            k9::assert_equal!(env.from, format!("sender-{n}"));
        }

        let (rest, err) = q.pop_batch(50);
        assert!(err.is_none());
        k9::assert_equal!(rest.len(), 2);
        k9::assert_equal!(q.len(), 0);
        k9::assert_equal!(q.in_flight_len(), 5);
    }

    #[test]
    fn keys_stay_unique_under_a_frozen_clock() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let q = MailQueue::open_with_clock(dir.path().join("q"), Arc::new(clock)).unwrap();

        // The clock never moves, so the second key must be disambiguated
        // rather than overwrite the first.
        let k1 = q.push(&sample()).unwrap();
        let k2 = q.push(&sample()).unwrap();
        assert!(k1 != k2);
        k9::assert_equal!(q.len(), 2);
        assert!(k2.instant().unwrap() > k1.instant().unwrap());
    }

    #[test]
    fn quadratic_backoff() {
        k9::assert_equal!(backoff(1), chrono::Duration::minutes(1));
        k9::assert_equal!(backoff(2), chrono::Duration::minutes(4));
        k9::assert_equal!(backoff(6), chrono::Duration::minutes(36));
    }

    #[test]
    fn key_text_is_parseable_and_ordered() {
        let t = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        let a = QueueKey::from_instant(t);
        let b = QueueKey::from_instant(t + chrono::Duration::nanoseconds(1));
        k9::assert_equal!(a.instant().unwrap(), t);
        // Fixed-width fractional seconds keep byte order aligned with
        // time order.
        assert!(a.as_bytes() < b.as_bytes());

        assert!(matches!(
            QueueKey::from_bytes(b"not-a-timestamp").unwrap().instant(),
            Err(QueueError::MalformedKey(_))
        ));
    }
}
