//! Coordinating a set of gateway sessions for horizontal sharding.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::signal::Flag;
use crate::{Error, Result};

/// One member of a shard set.
///
/// [`Session`](crate::Session) implements this; tests and embedders can
/// substitute their own.
#[async_trait]
pub trait Shard: Send + Sync {
    async fn open(&self, cancel: Flag) -> Result<()>;
    async fn close(&self);
}

#[async_trait]
impl Shard for crate::Session {
    async fn open(&self, cancel: Flag) -> Result<()> {
        crate::Session::open(self, cancel).await
    }

    async fn close(&self) {
        crate::Session::close(self).await
    }
}

/// Identity of a shard within its set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId {
    pub id: u32,
    pub total: u32,
}

/// Builds one shard. Receives the manager so per-shard handlers and state
/// can be installed before the shard is opened.
pub type ShardFactory = Box<dyn Fn(&ShardManager, ShardId) -> Arc<dyn Shard> + Send + Sync>;

/// Owns N shards, opening them in id order with rate-limited concurrency.
///
/// Shards whose ids fall in the same wave (sized by the server-advertised
/// `max_concurrency`) open together; a barrier separates waves, which keeps
/// every identify bucket serialized.
pub struct ShardManager {
    factory: ShardFactory,
    max_concurrency: usize,
    shards: Mutex<Vec<Arc<dyn Shard>>>,
}

impl ShardManager {
    pub fn new(factory: ShardFactory, max_concurrency: usize) -> ShardManager {
        ShardManager {
            factory,
            max_concurrency: max_concurrency.max(1),
            shards: Mutex::new(Vec::new()),
        }
    }

    /// Number of shards currently held.
    pub async fn shard_count(&self) -> usize {
        self.shards.lock().await.len()
    }

    /// Run `f` over every shard, in id order.
    pub async fn for_each(&self, mut f: impl FnMut(&Arc<dyn Shard>)) {
        for shard in self.shards.lock().await.iter() {
            f(shard);
        }
    }

    /// Construct and open `total` shards.
    ///
    /// On any open failure the already-opened shards are closed in reverse
    /// order and the failure is surfaced.
    pub async fn open(&self, cancel: &Flag, total: u32) -> Result<()> {
        {
            let shards = self.shards.lock().await;
            if !shards.is_empty() {
                return Err(Error::Other("shard set already open"));
            }
        }

        let built: Vec<Arc<dyn Shard>> = (0..total)
            .map(|id| (self.factory)(self, ShardId { id, total }))
            .collect();

        let mut opened: Vec<Arc<dyn Shard>> = Vec::new();
        for wave in built.chunks(self.max_concurrency) {
            debug!(wave = wave.len(), "opening shard wave");
            let results =
                futures::future::join_all(wave.iter().map(|shard| shard.open(cancel.clone())))
                    .await;

            let mut failure = None;
            for (shard, result) in wave.iter().zip(results) {
                match result {
                    Ok(()) => opened.push(shard.clone()),
                    Err(err) => failure = Some(failure.unwrap_or(err)),
                }
            }
            if let Some(err) = failure {
                for shard in opened.iter().rev() {
                    shard.close().await;
                }
                return Err(err);
            }
        }

        info!(total, "shard set open");
        *self.shards.lock().await = built;
        Ok(())
    }

    /// Close every shard, in reverse id order.
    pub async fn close(&self) {
        let shards = std::mem::take(&mut *self.shards.lock().await);
        for shard in shards.iter().rev() {
            shard.close().await;
        }
    }

    /// Tear the set down and reopen it at a new size, for when the server
    /// reports that more shards are required.
    pub async fn rescale(&self, cancel: &Flag, total: u32) -> Result<()> {
        info!(total, "rescaling shard set");
        self.close().await;
        self.open(cancel, total).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Journal {
        events: StdMutex<Vec<String>>,
    }

    impl Journal {
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    struct MockShard {
        id: u32,
        journal: Arc<Journal>,
        fail: bool,
    }

    #[async_trait]
    impl Shard for MockShard {
        async fn open(&self, _cancel: Flag) -> Result<()> {
            self.journal.record(format!("open {}", self.id));
            if self.fail {
                Err(Error::Other("shard refused"))
            } else {
                Ok(())
            }
        }

        async fn close(&self) {
            self.journal.record(format!("close {}", self.id));
        }
    }

    fn manager(journal: Arc<Journal>, fail_id: Option<u32>, max_concurrency: usize) -> ShardManager {
        ShardManager::new(
            Box::new(move |_manager, id| {
                Arc::new(MockShard {
                    id: id.id,
                    journal: journal.clone(),
                    fail: Some(id.id) == fail_id,
                })
            }),
            max_concurrency,
        )
    }

    #[tokio::test]
    async fn opens_in_waves_and_closes_in_reverse() {
        let journal = Arc::new(Journal::default());
        let manager = manager(journal.clone(), None, 2);
        manager.open(&Flag::new(), 4).await.unwrap();
        assert_eq!(manager.shard_count().await, 4);

        let events = journal.take();
        // Wave membership is deterministic even if order inside a wave isn't.
        let wave_of = |id: u32| {
            events
                .iter()
                .position(|e| e == &format!("open {}", id))
                .unwrap()
                / 2
        };
        assert_eq!(wave_of(0), 0);
        assert_eq!(wave_of(1), 0);
        assert_eq!(wave_of(2), 1);
        assert_eq!(wave_of(3), 1);

        manager.close().await;
        assert_eq!(
            journal.take(),
            vec!["close 3", "close 2", "close 1", "close 0"]
        );
        assert_eq!(manager.shard_count().await, 0);
    }

    #[tokio::test]
    async fn failure_closes_opened_shards_in_reverse() {
        let journal = Arc::new(Journal::default());
        let manager = manager(journal.clone(), Some(2), 1);
        let err = manager.open(&Flag::new(), 3).await.unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(manager.shard_count().await, 0);

        assert_eq!(
            journal.take(),
            vec!["open 0", "open 1", "open 2", "close 1", "close 0"]
        );
    }

    #[tokio::test]
    async fn rescale_reopens_at_new_size() {
        let journal = Arc::new(Journal::default());
        let counter = Arc::new(AtomicU32::new(0));
        let manager = {
            let journal = journal.clone();
            let counter = counter.clone();
            ShardManager::new(
                Box::new(move |_manager, id| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Arc::new(MockShard {
                        id: id.id,
                        journal: journal.clone(),
                        fail: false,
                    })
                }),
                4,
            )
        };

        manager.open(&Flag::new(), 2).await.unwrap();
        manager.rescale(&Flag::new(), 4).await.unwrap();
        assert_eq!(manager.shard_count().await, 4);
        // Two shards built initially, four after the rescale.
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }
}
