/// Scoped subscription handle
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

type Release = Box<dyn FnOnce() + Send>;

/// Receiving end of a subscription
///
/// The remote subscription is released exactly once: on `unsubscribe()` or
/// when the handle is dropped, whichever comes first.
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
    release: Option<Release>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::Receiver<T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            release: Some(Box::new(release)),
        }
    }

    /// Subscription whose release aborts the task feeding it
    pub fn from_task(receiver: mpsc::Receiver<T>, task: JoinHandle<()>) -> Self {
        Self::new(receiver, move || task.abort())
    }

    /// Next notification, `None` once the source is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next notification if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.receiver.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release_now();
    }
}

/// Forward every change of a watch channel into a subscription
pub fn forward_watch<T>(mut source: watch::Receiver<T>, buffer: usize) -> Subscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let task = tokio::spawn(async move {
        while source.changed().await.is_ok() {
            let value = source.borrow_and_update().clone();
            if tx.send(value).await.is_err() {
                break;
            }
        }
    });
    Subscription::from_task(rx, task)
}
