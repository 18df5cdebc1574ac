use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Events published while a translation task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted {
        chapters: usize,
    },
    ChapterStarted {
        index: usize,
        total: usize,
        name: String,
        chunks: usize,
    },
    ChapterSkipped {
        name: String,
    },
    ChunkRetry {
        chunk_index: usize,
        attempt: u32,
        max_attempts: u32,
        detail: String,
        wait: Duration,
    },
    LeakageFallback {
        chunk_index: usize,
        reason: String,
    },
    StreamDelta {
        chunk_index: usize,
        text: String,
    },
    ChunkFinished {
        chunk_index: usize,
        ok: bool,
        snapshot: ProgressSnapshot,
    },
    ChapterFinished {
        name: String,
        chars: usize,
        elapsed: Duration,
    },
    ChapterFailed {
        name: String,
        error: String,
    },
    RunFinished {
        chapters: usize,
        chars: usize,
        elapsed: Duration,
        cancelled: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub chunks_done: usize,
    pub chunks_total: usize,
    pub chars_translated: usize,
    pub chapters_done: usize,
    pub chapters_total: usize,
}

/// Controller side of a running task: pause, resume, cancel, observe.
#[derive(Debug)]
pub struct TaskHandle {
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    progress: Arc<Mutex<ProgressSnapshot>>,
}

/// Worker side of a running task, cloned into every chunk job.
#[derive(Debug, Clone)]
pub struct TaskControl {
    cancel: CancellationToken,
    pause_rx: watch::Receiver<bool>,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    progress: Arc<Mutex<ProgressSnapshot>>,
}

pub fn task_channel() -> (
    TaskHandle,
    TaskControl,
    mpsc::UnboundedReceiver<ProgressEvent>,
) {
    let cancel = CancellationToken::new();
    let (pause_tx, pause_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let progress = Arc::new(Mutex::new(ProgressSnapshot::default()));

    let handle = TaskHandle {
        cancel: cancel.clone(),
        pause_tx,
        progress: Arc::clone(&progress),
    };
    let control = TaskControl {
        cancel,
        pause_rx,
        events: Some(events_tx),
        progress,
    };
    (handle, control, events_rx)
}

fn lock(progress: &Mutex<ProgressSnapshot>) -> MutexGuard<'_, ProgressSnapshot> {
    match progress.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TaskHandle {
    pub fn pause(&self) {
        self.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause_tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *lock(&self.progress)
    }
}

impl TaskControl {
    /// A control nobody pauses and nobody listens to.
    pub fn detached() -> Self {
        let (_pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause_rx,
            events: None,
            progress: Arc::new(Mutex::new(ProgressSnapshot::default())),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Blocks while paused. Returns `false` once the task is cancelled.
    pub async fn wait_if_paused(&self) -> bool {
        let mut pause_rx = self.pause_rx.clone();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*pause_rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = pause_rx.changed() => {
                    // No controller left to resume us.
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                }
            }
        }
    }

    /// Sleeps unless cancelled first. Returns `false` on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn add_chunks(&self, chunks: usize) {
        lock(&self.progress).chunks_total += chunks;
    }

    pub fn set_chapters_total(&self, chapters: usize) {
        lock(&self.progress).chapters_total = chapters;
    }

    /// Counts one finished chunk; only successful chunks add characters.
    pub fn record_chunk(&self, translated_chars: Option<usize>) -> ProgressSnapshot {
        let mut progress = lock(&self.progress);
        progress.chunks_done += 1;
        if let Some(chars) = translated_chars {
            progress.chars_translated += chars;
        }
        *progress
    }

    pub fn record_chapter(&self) -> ProgressSnapshot {
        let mut progress = lock(&self.progress);
        progress.chapters_done += 1;
        *progress
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *lock(&self.progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let (handle, control, _events) = task_channel();
        handle.pause();
        assert!(handle.is_paused());

        let waiter = tokio::spawn({
            let control = control.clone();
            async move { control.wait_if_paused().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        handle.resume();
        assert!(waiter.await.expect("join waiter"));
    }

    #[tokio::test]
    async fn cancel_releases_paused_waiters() {
        let (handle, control, _events) = task_channel();
        handle.pause();
        let waiter = tokio::spawn({
            let control = control.clone();
            async move { control.wait_if_paused().await }
        });
        handle.cancel();
        assert!(!waiter.await.expect("join waiter"));
        assert!(!control.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn events_reach_the_receiver() {
        let (_handle, control, mut events) = task_channel();
        control.emit(ProgressEvent::ChapterSkipped {
            name: "ch1.xhtml".to_owned(),
        });
        assert_eq!(
            events.recv().await,
            Some(ProgressEvent::ChapterSkipped {
                name: "ch1.xhtml".to_owned()
            })
        );
    }

    #[test]
    fn failures_count_as_done_but_add_no_chars() {
        let (handle, control, _events) = task_channel();
        control.add_chunks(3);
        control.record_chunk(Some(10));
        control.record_chunk(None);
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.chunks_done, 2);
        assert_eq!(snapshot.chunks_total, 3);
        assert_eq!(snapshot.chars_translated, 10);
    }

    #[tokio::test]
    async fn detached_control_is_never_paused() {
        let control = TaskControl::detached();
        assert!(control.wait_if_paused().await);
        control.emit(ProgressEvent::RunStarted { chapters: 1 });
    }
}
