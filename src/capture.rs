//! Microphone capture
//!
//! A dedicated OS thread owns the capture device, reads short frames from it,
//! and hands fixed-duration chunks to a callback. The thread is joined on
//! `stop()`, so every chunk of an utterance has been handed over by the time
//! `stop()` returns.

use crate::codec::u8_to_i16_slice;
use crate::config::SessionConfig;
use crate::error::{KoraError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Length of a single device read
const FRAME_MS: u64 = 20;

/// One chunk of captured S16LE mono PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Press/release cycle the chunk belongs to
    pub utterance: u64,
    /// Position within the utterance
    pub seq: u64,
    pub pcm: Vec<u8>,
}

/// Output of the capture thread
#[derive(Debug)]
pub enum CaptureEvent {
    Chunk(AudioChunk),
    /// The device failed mid-utterance; no more chunks follow
    Failed { utterance: u64, error: KoraError },
}

/// An opened capture device. Lives on the capture thread only.
pub trait CaptureDevice {
    /// Fill `buf` completely with PCM, blocking until it is available.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Capability for acquiring the microphone.
pub trait MicrophoneSource: Send + Sync + 'static {
    /// Open the device. Called on the capture thread.
    fn open(&self) -> Result<Box<dyn CaptureDevice>>;
}

/// Snapshot of the level meter for visualizers
#[derive(Debug, Clone, PartialEq)]
pub struct LevelSample {
    /// Time-domain bytes, 128 is silence
    pub time_domain: Vec<u8>,
    /// RMS level in [0, 1]
    pub level: f32,
}

struct MeterState {
    window: VecDeque<i16>,
    capacity: usize,
    level: f32,
}

/// Read-only analysis side channel fed by the capture thread.
///
/// The capture thread only ever `try_lock`s the meter, so a slow reader can
/// make it skip an update but can never delay chunk delivery.
#[derive(Clone)]
pub struct LevelMeter {
    state: Arc<Mutex<MeterState>>,
}

impl LevelMeter {
    pub fn new(window: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MeterState {
                window: VecDeque::with_capacity(window),
                capacity: window,
                level: 0.0,
            })),
        }
    }

    fn try_update(&self, pcm: &[u8]) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        for sample in u8_to_i16_slice(pcm) {
            if state.window.len() == state.capacity {
                state.window.pop_front();
            }
            state.window.push_back(sample);
        }
        let sum_squares: f64 = state
            .window
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        state.level = if state.window.is_empty() {
            0.0
        } else {
            (sum_squares / state.window.len() as f64).sqrt() as f32
        };
    }

    fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.window.clear();
            state.level = 0.0;
        }
    }

    /// Current analysis window. Silence when capture is not running.
    pub fn sample(&self) -> LevelSample {
        match self.state.lock() {
            Ok(state) => {
                let mut time_domain: Vec<u8> = state
                    .window
                    .iter()
                    .map(|&s| ((s as i32 >> 8) + 128) as u8)
                    .collect();
                time_domain.resize(state.capacity, 128);
                LevelSample {
                    time_domain,
                    level: state.level,
                }
            }
            Err(_) => LevelSample {
                time_domain: Vec::new(),
                level: 0.0,
            },
        }
    }
}

struct CaptureHandle {
    utterance: u64,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Thread exits after its current frame
    }
}

/// Owns the microphone for the duration of one utterance at a time.
pub struct AudioSource {
    source: Arc<dyn MicrophoneSource>,
    chunk_bytes: usize,
    frame_bytes: usize,
    meter: LevelMeter,
    active: Option<CaptureHandle>,
    next_utterance: u64,
}

impl AudioSource {
    pub fn new(source: Arc<dyn MicrophoneSource>, config: &SessionConfig) -> Self {
        let chunk_bytes = config.chunk_bytes();
        let frame_samples = (config.sample_rate as u64 * FRAME_MS / 1000).max(1) as usize;
        let frame_bytes = (frame_samples * 2).min(chunk_bytes);

        Self {
            source,
            chunk_bytes,
            frame_bytes,
            meter: LevelMeter::new(config.analysis_window),
            active: None,
            next_utterance: 1,
        }
    }

    /// Acquire the microphone and start emitting chunks to `on_event`.
    ///
    /// `on_event` returns `false` when the receiver is gone, which stops the
    /// capture thread. Returns the utterance id the chunks are tagged with.
    pub async fn start<F>(&mut self, on_event: F) -> Result<u64>
    where
        F: FnMut(CaptureEvent) -> bool + Send + 'static,
    {
        if let Some(handle) = &self.active {
            debug!("Capture already running for utterance {}", handle.utterance);
            return Ok(handle.utterance);
        }

        let utterance = self.next_utterance;
        self.next_utterance += 1;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (opened_tx, opened_rx) = oneshot::channel::<Result<()>>();

        let worker = CaptureWorker {
            source: self.source.clone(),
            utterance,
            chunk_bytes: self.chunk_bytes,
            frame_bytes: self.frame_bytes,
            meter: self.meter.clone(),
            shutdown: shutdown.clone(),
        };

        let thread = std::thread::Builder::new()
            .name(format!("kora-capture-{}", utterance))
            .spawn(move || worker.run(opened_tx, on_event))?;

        let mut handle = CaptureHandle {
            utterance,
            shutdown,
            thread: Some(thread),
        };

        match opened_rx.await {
            Ok(Ok(())) => {
                info!("🎤 Microphone open, capturing utterance {}", utterance);
                self.active = Some(handle);
                Ok(utterance)
            }
            Ok(Err(e)) => {
                join_thread(handle.thread.take()).await;
                Err(e)
            }
            Err(_) => {
                join_thread(handle.thread.take()).await;
                Err(KoraError::DeviceUnavailable(
                    "capture thread exited before opening the device".into(),
                ))
            }
        }
    }

    /// Stop capturing and release the device. No-op when not started.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.active.take() else {
            return;
        };
        handle.shutdown.store(true, Ordering::Relaxed);
        join_thread(handle.thread.take()).await;
        self.meter.reset();
        info!("🎤 Capture stopped for utterance {}", handle.utterance);
    }

    /// Utterance currently being captured
    pub fn utterance(&self) -> Option<u64> {
        self.active.as_ref().map(|h| h.utterance)
    }

    pub fn meter(&self) -> LevelMeter {
        self.meter.clone()
    }
}

async fn join_thread(thread: Option<JoinHandle<()>>) {
    if let Some(thread) = thread {
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            error!("Capture thread panicked");
        }
    }
}

struct CaptureWorker {
    source: Arc<dyn MicrophoneSource>,
    utterance: u64,
    chunk_bytes: usize,
    frame_bytes: usize,
    meter: LevelMeter,
    shutdown: Arc<AtomicBool>,
}

impl CaptureWorker {
    fn run<F>(self, opened_tx: oneshot::Sender<Result<()>>, mut on_event: F)
    where
        F: FnMut(CaptureEvent) -> bool,
    {
        let mut device = match self.source.open() {
            Ok(device) => {
                let _ = opened_tx.send(Ok(()));
                device
            }
            Err(e) => {
                warn!("Failed to open microphone: {}", e);
                let _ = opened_tx.send(Err(e));
                return;
            }
        };

        let mut frame = vec![0u8; self.frame_bytes];
        let mut pending = Vec::with_capacity(self.chunk_bytes);
        let mut seq = 0u64;
        let mut failure = None;

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = device.read(&mut frame) {
                error!("Audio read error: {}", e);
                failure = Some(e);
                break;
            }
            self.meter.try_update(&frame);
            pending.extend_from_slice(&frame);

            if pending.len() >= self.chunk_bytes {
                let rest = pending.split_off(self.chunk_bytes);
                let pcm = std::mem::replace(&mut pending, rest);
                let chunk = AudioChunk { utterance: self.utterance, seq, pcm };
                if !on_event(CaptureEvent::Chunk(chunk)) {
                    debug!("Chunk receiver dropped, ending capture");
                    return;
                }
                seq += 1;
            }
        }

        // Flush the tail so the last words are not lost
        if !pending.is_empty() {
            on_event(CaptureEvent::Chunk(AudioChunk {
                utterance: self.utterance,
                seq,
                pcm: pending,
            }));
        }
        if let Some(error) = failure {
            on_event(CaptureEvent::Failed {
                utterance: self.utterance,
                error,
            });
        }
        debug!("Capture thread for utterance {} finished", self.utterance);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Produces a ramp of samples at roughly real-time pace.
    pub(crate) struct FakeMicrophone {
        pub deny: bool,
        /// Device reads that succeed before the device breaks
        pub fail_after: Option<usize>,
        pub opened: Arc<AtomicUsize>,
    }

    impl FakeMicrophone {
        pub(crate) fn new() -> Self {
            Self {
                deny: false,
                fail_after: None,
                opened: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FakeDevice {
        next: i16,
        reads_left: Option<usize>,
    }

    impl CaptureDevice for FakeDevice {
        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            match &mut self.reads_left {
                Some(0) => return Err(KoraError::DeviceUnavailable("unplugged".into())),
                Some(n) => *n -= 1,
                None => {}
            }
            for pair in buf.chunks_exact_mut(2) {
                pair.copy_from_slice(&self.next.to_le_bytes());
                self.next = self.next.wrapping_add(64);
            }
            // 16 kHz mono S16LE: 32 bytes per millisecond
            std::thread::sleep(Duration::from_millis((buf.len() / 32) as u64));
            Ok(())
        }
    }

    impl MicrophoneSource for FakeMicrophone {
        fn open(&self) -> Result<Box<dyn CaptureDevice>> {
            if self.deny {
                return Err(KoraError::PermissionDenied("denied by test".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDevice {
                next: 0,
                reads_left: self.fail_after,
            }))
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            chunk_interval: Duration::from_millis(40),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order_and_stop_flushes() {
        let mut source = AudioSource::new(Arc::new(FakeMicrophone::new()), &test_config());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let utterance = source.start(move |event| tx.send(event).is_ok()).await.unwrap();
        assert_eq!(source.utterance(), Some(utterance));
        tokio::time::sleep(Duration::from_millis(150)).await;
        source.stop().await;
        assert_eq!(source.utterance(), None);

        let mut chunks = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CaptureEvent::Chunk(chunk) => chunks.push(chunk),
                CaptureEvent::Failed { error, .. } => panic!("capture failed: {}", error),
            }
        }
        assert!(chunks.len() >= 2, "got {} chunks", chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.utterance, utterance);
            assert_eq!(chunk.seq, i as u64);
            assert!(!chunk.pcm.is_empty());
            assert!(chunk.pcm.len() <= 1280);
        }
        // Nothing is emitted once stop() has returned
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces() {
        let mut mic = FakeMicrophone::new();
        mic.deny = true;
        let mut source = AudioSource::new(Arc::new(mic), &test_config());

        let err = source.start(|_| true).await.unwrap_err();
        assert!(matches!(err, KoraError::PermissionDenied(_)));
        assert_eq!(source.utterance(), None);
    }

    #[tokio::test]
    async fn test_device_failure_mid_utterance_is_reported() {
        let mut mic = FakeMicrophone::new();
        mic.fail_after = Some(3);
        let mut source = AudioSource::new(Arc::new(mic), &test_config());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let utterance = source.start(move |event| tx.send(event).is_ok()).await.unwrap();

        let mut captured = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                CaptureEvent::Chunk(chunk) => captured += chunk.pcm.len(),
                CaptureEvent::Failed { utterance: failed, error } => {
                    assert_eq!(failed, utterance);
                    assert!(matches!(error, KoraError::DeviceUnavailable(_)));
                    break;
                }
            }
        }
        // Three 20 ms frames made it out before the failure
        assert_eq!(captured, 3 * 640);

        source.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mic = FakeMicrophone::new();
        let opened = mic.opened.clone();
        let mut source = AudioSource::new(Arc::new(mic), &test_config());

        source.stop().await;
        let first = source.start(|_| true).await.unwrap();
        let again = source.start(|_| true).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        source.stop().await;
        source.stop().await;
        let second = source.start(|_| true).await.unwrap();
        assert_eq!(second, first + 1);
        source.stop().await;
    }

    #[test]
    fn test_level_meter_window() {
        let meter = LevelMeter::new(4);
        assert_eq!(meter.sample().time_domain, vec![128; 4]);
        assert_eq!(meter.sample().level, 0.0);

        let loud: Vec<u8> = [i16::MAX, i16::MIN, i16::MAX, i16::MIN, i16::MAX, i16::MIN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        meter.try_update(&loud);
        let sample = meter.sample();
        assert_eq!(sample.time_domain.len(), 4);
        assert!(sample.level > 0.99);

        meter.reset();
        assert_eq!(meter.sample().level, 0.0);
    }
}
