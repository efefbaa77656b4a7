//! Ordered playback of agent speech segments
//!
//! Segments are decoded and played strictly one at a time, in the order they
//! were enqueued. Playback itself runs on the blocking pool; its completion
//! comes back to the owner as a `PlaybackDone` event, which advances the queue.

use crate::codec::decode_segment;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Capability for decoding and playing one segment.
pub trait AudioSink: Send + Sync + 'static {
    /// Play `pcm` to completion, or return early once `cancel` is raised.
    /// Blocks the calling thread.
    fn play(&self, pcm: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()>;
}

/// Completion of one playback
#[derive(Debug)]
pub struct PlaybackDone {
    pub generation: u64,
    pub result: Result<()>,
}

/// One pending segment
#[derive(Debug, Clone)]
pub struct PlaybackEntry {
    pub id: u64,
    pub content: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Segments that played to the end
    pub played: u64,
    /// Segments dropped before reaching the sink (undecodable)
    pub skipped: u64,
    /// Segments the sink failed on
    pub failed: u64,
}

impl PlaybackStats {
    pub fn processed(&self) -> u64 {
        self.played + self.skipped + self.failed
    }
}

struct ActivePlayback {
    generation: u64,
    cancel: Arc<AtomicBool>,
}

/// Single-consumer FIFO with at most one playback in flight
pub struct PlaybackQueue {
    sink: Arc<dyn AudioSink>,
    entries: VecDeque<PlaybackEntry>,
    /// Head of `entries` is playing iff this is set
    active: Option<ActivePlayback>,
    /// Cancelled playback still running in the sink
    draining: Option<u64>,
    next_id: u64,
    next_generation: u64,
    done_tx: UnboundedSender<PlaybackDone>,
    stats: PlaybackStats,
}

impl PlaybackQueue {
    pub fn new(sink: Arc<dyn AudioSink>, done_tx: UnboundedSender<PlaybackDone>) -> Self {
        Self {
            sink,
            entries: VecDeque::new(),
            active: None,
            draining: None,
            next_id: 0,
            next_generation: 0,
            done_tx,
            stats: PlaybackStats::default(),
        }
    }

    /// Append a base64 segment; starts playing it if nothing else is.
    pub fn enqueue(&mut self, content: String) {
        let id = self.next_id;
        self.next_id += 1;
        debug!("🔊 Enqueued segment {} ({} queued)", id, self.entries.len() + 1);
        self.entries.push_back(PlaybackEntry { id, content });
        self.pump();
    }

    /// Handle a completion event. Returns `false` for completions of
    /// playbacks that were cleared, which must be ignored by the caller.
    pub fn on_complete(&mut self, done: PlaybackDone) -> bool {
        if self.draining == Some(done.generation) {
            debug!("Cancelled playback {} has stopped", done.generation);
            self.draining = None;
            self.pump();
            return false;
        }
        match &self.active {
            Some(active) if active.generation == done.generation => {}
            _ => {
                debug!("Ignoring stale playback completion {}", done.generation);
                return false;
            }
        }
        self.active = None;

        let entry = self.entries.pop_front();
        let id = entry.map(|e| e.id).unwrap_or_default();
        match done.result {
            Ok(()) => {
                self.stats.played += 1;
                debug!("🔊 Segment {} finished", id);
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!("Segment {} failed to play, skipping: {}", id, e);
            }
        }

        self.pump();
        true
    }

    /// Drop everything queued and cut the current playback short.
    ///
    /// Nothing new reaches the sink until the cut playback has returned.
    pub fn clear(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.store(true, Ordering::Relaxed);
            self.draining = Some(active.generation);
        }
        if !self.entries.is_empty() {
            info!("🔊 Cleared {} queued segment(s)", self.entries.len());
        }
        self.entries.clear();
    }

    pub fn is_playing(&self) -> bool {
        self.active.is_some()
    }

    /// Nothing playing and nothing waiting
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Start the head entry if idle, skipping entries that fail to decode.
    fn pump(&mut self) {
        while self.active.is_none() && self.draining.is_none() {
            let Some(head) = self.entries.front() else {
                return;
            };

            match decode_segment(&head.content) {
                Ok(pcm) => {
                    let id = head.id;
                    self.start(id, pcm);
                }
                Err(e) => {
                    warn!("Skipping segment {}: {}", head.id, e);
                    self.entries.pop_front();
                    self.stats.skipped += 1;
                }
            }
        }
    }

    fn start(&mut self, id: u64, pcm: Vec<u8>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let cancel = Arc::new(AtomicBool::new(false));

        debug!("🔊 Playing segment {} ({} bytes)", id, pcm.len());
        let sink = self.sink.clone();
        let done_tx = self.done_tx.clone();
        let task_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let result = sink.play(pcm, task_cancel);
            let _ = done_tx.send(PlaybackDone { generation, result });
        });

        self.active = Some(ActivePlayback { generation, cancel });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::KoraError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records what it plays and how many plays overlap.
    pub(crate) struct RecordingSink {
        pub played: Mutex<Vec<Vec<u8>>>,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        /// Play duration; `None` blocks until cancelled
        pub duration: Option<Duration>,
    }

    impl RecordingSink {
        pub(crate) fn new(duration: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                played: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                duration,
            })
        }

        pub(crate) fn played(&self) -> Vec<Vec<u8>> {
            self.played.lock().unwrap().clone()
        }
    }

    impl AudioSink for RecordingSink {
        fn play(&self, pcm: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.played.lock().unwrap().push(pcm);

            match self.duration {
                Some(d) => std::thread::sleep(d),
                None => {
                    while !cancel.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    impl AudioSink for FailingSink {
        fn play(&self, _pcm: Vec<u8>, _cancel: Arc<AtomicBool>) -> Result<()> {
            Err(KoraError::DecodeFailure("unsupported".into()))
        }
    }

    fn b64(bytes: &[u8]) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    async fn drain(queue: &mut PlaybackQueue, rx: &mut mpsc::UnboundedReceiver<PlaybackDone>) {
        while !queue.is_idle() {
            let done = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("playback stalled")
                .expect("channel closed");
            queue.on_complete(done);
        }
    }

    #[tokio::test]
    async fn test_segments_play_in_enqueue_order() {
        let sink = RecordingSink::new(Some(Duration::from_millis(10)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(sink.clone(), tx);

        // Burst of segments arriving within one read
        for i in 0..4u8 {
            queue.enqueue(b64(&[i, i]));
        }
        assert!(queue.is_playing());
        assert_eq!(queue.len(), 4);

        drain(&mut queue, &mut rx).await;

        assert_eq!(sink.played(), vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]]);
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().played, 4);
    }

    #[tokio::test]
    async fn test_payload_reaches_sink_decoded() {
        let sink = RecordingSink::new(Some(Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(sink.clone(), tx);

        queue.enqueue("QUJD".to_string());
        drain(&mut queue, &mut rx).await;

        assert_eq!(sink.played(), vec![vec![0x41, 0x42, 0x43]]);
    }

    #[tokio::test]
    async fn test_decode_failure_skips_entry() {
        let sink = RecordingSink::new(Some(Duration::from_millis(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(sink.clone(), tx);

        queue.enqueue(b64(&[1]));
        queue.enqueue("***not base64***".to_string());
        queue.enqueue(b64(&[3]));
        queue.enqueue(b64(&[4]));
        drain(&mut queue, &mut rx).await;

        assert_eq!(sink.played(), vec![vec![1], vec![3], vec![4]]);
        let stats = queue.stats();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed(), 4);
    }

    #[tokio::test]
    async fn test_undecodable_head_does_not_stall() {
        let sink = RecordingSink::new(Some(Duration::from_millis(1)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(sink.clone(), tx);

        queue.enqueue("!!".to_string());
        assert!(queue.is_idle());
        queue.enqueue(b64(&[9, 9]));
        assert!(queue.is_playing());
        drain(&mut queue, &mut rx).await;
        assert_eq!(sink.played(), vec![vec![9, 9]]);
    }

    #[tokio::test]
    async fn test_sink_failure_advances_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(Arc::new(FailingSink), tx);

        queue.enqueue(b64(&[1, 2]));
        queue.enqueue(b64(&[3, 4]));
        drain(&mut queue, &mut rx).await;

        assert_eq!(queue.stats().failed, 2);
        assert_eq!(queue.stats().processed(), 2);
    }

    #[tokio::test]
    async fn test_clear_stops_playback_and_silences_completion() {
        let sink = RecordingSink::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(sink.clone(), tx);

        for i in 0..4u8 {
            queue.enqueue(b64(&[i, 0]));
        }
        // Let the first segment reach the sink
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(queue.is_playing());
        assert_eq!(queue.len(), 4);

        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_playing());

        // The cancelled playback still reports back, but is ignored
        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!queue.on_complete(done));
        assert!(queue.is_idle());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.played().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_clear_waits_for_cancelled_play() {
        // Ignores cancel, so the cut segment keeps the sink busy
        let sink = RecordingSink::new(Some(Duration::from_millis(100)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = PlaybackQueue::new(sink.clone(), tx);

        queue.enqueue(b64(&[1, 1]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.clear();
        queue.enqueue(b64(&[2, 2]));
        assert!(!queue.is_playing());
        assert!(!queue.is_idle());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.played().len(), 1);

        drain(&mut queue, &mut rx).await;
        assert_eq!(sink.played(), vec![vec![1, 1], vec![2, 2]]);
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().played, 1);
    }
}
