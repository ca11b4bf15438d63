use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::trace;

struct CleanerInner {
    subs: Vec<mpsc::Sender<()>>,
    closed: bool,
    deadline: Instant,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

/// Per-session idle watchdog with subscribe/broadcast close semantics.
///
/// Every long-running session loop subscribes and selects on its receiver;
///  `close` fires exactly once, notifies every subscriber (late subscribers
///  are notified immediately) and runs the cleanup callback.
#[derive(Clone)]
pub struct Cleaner {
    inner: Arc<Mutex<CleanerInner>>,
}

impl Cleaner {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Cleaner {
        Cleaner {
            inner: Arc::new(Mutex::new(CleanerInner {
                subs: Vec::new(),
                closed: false,
                deadline: Instant::now(),
                on_close: Some(Box::new(on_close)),
            })),
        }
    }

    /// Register for the close broadcast. The receiver yields exactly one
    ///  notification; if the cleaner is already closed it is pre-filled.
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            tx.try_send(()).ok();
        } else {
            inner.subs.push(tx);
        }
        rx
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Push the deadline out to `now + d`.
    pub fn refresh(&self, d: Duration) {
        self.inner.lock().unwrap().deadline = Instant::now() + d;
    }

    /// Broadcast close to all subscribers and run the cleanup callback.
    ///  Idempotent - a second call changes nothing.
    pub fn close(&self) {
        let (subs, on_close) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (std::mem::take(&mut inner.subs), inner.on_close.take())
        };

        for sub in subs {
            // capacity 1 and one send per subscriber, so this cannot fail
            //  other than by the receiver being gone already
            sub.try_send(()).ok();
        }
        if let Some(cb) = on_close {
            cb();
        }
    }

    /// Watch the deadline, closing the cleaner once it passes. The watch task
    ///  re-arms itself after every `refresh` and exits after close.
    pub fn spawn_timeout_watch(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let inner = this.inner.lock().unwrap();
                    if inner.closed {
                        return;
                    }
                    inner.deadline
                };

                sleep_until(deadline).await;

                let timed_out = {
                    let inner = this.inner.lock().unwrap();
                    // the deadline may have moved while we slept
                    !inner.closed && Instant::now() >= inner.deadline
                };
                if timed_out {
                    trace!("idle deadline passed - closing");
                    this.close();
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_close_notifies_all_subscribers() {
        let cleaner = Cleaner::new(|| {});
        let mut a = cleaner.subscribe();
        let mut b = cleaner.subscribe();

        cleaner.close();

        assert_eq!(a.recv().await, Some(()));
        assert_eq!(b.recv().await, Some(()));
        assert!(cleaner.closed());
    }

    #[tokio::test]
    async fn test_late_subscriber_is_notified_immediately() {
        let cleaner = Cleaner::new(|| {});
        cleaner.close();

        let mut late = cleaner.subscribe();
        assert_eq!(late.try_recv(), Ok(()));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let cleaner = Cleaner::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        let mut sub = cleaner.subscribe();

        cleaner.close();
        cleaner.close();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sub.recv().await, Some(()));
        // exactly one notification
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_after_deadline() {
        let cleaner = Cleaner::new(|| {});
        let mut sub = cleaner.subscribe();

        cleaner.refresh(Duration::from_secs(5));
        cleaner.spawn_timeout_watch();

        assert_eq!(sub.recv().await, Some(()));
        assert!(cleaner.closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_deadline() {
        let cleaner = Cleaner::new(|| {});
        cleaner.refresh(Duration::from_secs(5));
        cleaner.spawn_timeout_watch();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            assert!(!cleaner.closed());
            cleaner.refresh(Duration::from_secs(5));
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cleaner.closed());
    }
}
