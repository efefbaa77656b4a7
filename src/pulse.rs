//! PulseAudio devices
//!
//! Microphone capture and speaker playback over the PulseAudio simple API,
//! 16-bit little-endian mono PCM. Playback runs on its own thread because the
//! simple stream handle must stay on the thread that created it.

use crate::capture::{CaptureDevice, MicrophoneSource};
use crate::codec::check_pcm16;
use crate::config::SessionConfig;
use crate::error::{KoraError, Result};
use crate::playback::AudioSink;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Playback is written in slices this long so a cancel takes effect quickly
const PLAYBACK_SLICE_MS: usize = 40;

fn spec(sample_rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate: sample_rate,
    }
}

fn map_open_error(err: PAErr, what: &str) -> KoraError {
    if err.0.abs() == Code::Access as i32 {
        KoraError::PermissionDenied(format!("{}: {}", what, err))
    } else {
        KoraError::DeviceUnavailable(format!("{}: {}", what, err))
    }
}

/// Microphone source backed by a PulseAudio record stream
pub struct PulseMicrophone {
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
}

impl PulseMicrophone {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            device: config.input_device.clone(),
            sample_rate: config.sample_rate,
        }
    }
}

struct PulseRecordStream {
    simple: Simple,
}

impl CaptureDevice for PulseRecordStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.simple
            .read(buf)
            .map_err(|e| KoraError::DeviceUnavailable(format!("read failed: {}", e)))
    }
}

impl MicrophoneSource for PulseMicrophone {
    fn open(&self) -> Result<Box<dyn CaptureDevice>> {
        info!(
            "Opening PulseAudio source {}",
            self.device.as_deref().unwrap_or("<default>")
        );
        let simple = Simple::new(
            None, // default server
            &self.app_name,
            Direction::Record,
            self.device.as_deref(),
            "microphone",
            &spec(self.sample_rate),
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| map_open_error(e, "microphone"))?;

        Ok(Box::new(PulseRecordStream { simple }))
    }
}

struct PlayJob {
    pcm: Vec<u8>,
    cancel: Arc<AtomicBool>,
    done: mpsc::SyncSender<Result<()>>,
}

/// Speaker sink backed by a PulseAudio playback stream
pub struct PulseSpeaker {
    jobs: Mutex<mpsc::Sender<PlayJob>>,
}

impl PulseSpeaker {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<PlayJob>();
        let worker = SpeakerWorker {
            app_name: config.app_name.clone(),
            device: config.output_device.clone(),
            sample_rate: config.sample_rate,
            simple: None,
        };
        std::thread::Builder::new()
            .name("kora-playback".into())
            .spawn(move || worker.run(jobs_rx))?;

        Ok(Self {
            jobs: Mutex::new(jobs_tx),
        })
    }
}

impl AudioSink for PulseSpeaker {
    fn play(&self, pcm: Vec<u8>, cancel: Arc<AtomicBool>) -> Result<()> {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        {
            let jobs = self.jobs.lock().map_err(|_| KoraError::ChannelClosed)?;
            jobs.send(PlayJob {
                pcm,
                cancel,
                done: done_tx,
            })
            .map_err(|_| KoraError::ChannelClosed)?;
        }
        done_rx.recv().map_err(|_| KoraError::ChannelClosed)?
    }
}

struct SpeakerWorker {
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
    simple: Option<Simple>,
}

impl SpeakerWorker {
    fn run(mut self, jobs: mpsc::Receiver<PlayJob>) {
        while let Ok(job) = jobs.recv() {
            let result = self.play(&job.pcm, &job.cancel);
            if let Err(e) = &result {
                // Reopen on the next segment in case the stream broke
                warn!("Playback failed: {}", e);
                if !matches!(e, KoraError::DecodeFailure(_)) {
                    self.simple = None;
                }
            }
            let _ = job.done.send(result);
        }
        debug!("Playback thread finished");
    }

    fn stream(&mut self) -> Result<&Simple> {
        if self.simple.is_none() {
            let simple = Simple::new(
                None,
                &self.app_name,
                Direction::Playback,
                self.device.as_deref(),
                "agent speech",
                &spec(self.sample_rate),
                None,
                None,
            )
            .map_err(|e| map_open_error(e, "speaker"))?;
            self.simple = Some(simple);
        }
        self.simple
            .as_ref()
            .ok_or_else(|| KoraError::DeviceUnavailable("speaker not open".into()))
    }

    fn play(&mut self, pcm: &[u8], cancel: &AtomicBool) -> Result<()> {
        check_pcm16(pcm)?;
        let slice_bytes = (self.sample_rate as usize * PLAYBACK_SLICE_MS / 1000).max(1) * 2;
        let simple = self.stream()?;

        for slice in pcm.chunks(slice_bytes) {
            if cancel.load(Ordering::Relaxed) {
                simple
                    .flush()
                    .map_err(|e| KoraError::DeviceUnavailable(format!("flush failed: {}", e)))?;
                debug!("🔊 Playback cancelled");
                return Ok(());
            }
            simple
                .write(slice)
                .map_err(|e| KoraError::DeviceUnavailable(format!("write failed: {}", e)))?;
        }
        simple
            .drain()
            .map_err(|e| KoraError::DeviceUnavailable(format!("drain failed: {}", e)))
    }
}

/// A capture source known to the sound server
#[derive(Debug, Clone)]
pub struct InputDevice {
    /// PulseAudio source name
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of an output rather than a microphone
    pub is_monitor: bool,
}

/// List capture sources, microphones first.
pub fn list_input_devices(app_name: &str) -> Result<Vec<InputDevice>> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let devices_clone = devices.clone();

    let mut proplist = Proplist::new()
        .ok_or_else(|| KoraError::DeviceUnavailable("failed to create proplist".into()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, app_name)
        .map_err(|_| KoraError::DeviceUnavailable("failed to set application name".into()))?;

    let mut mainloop = Mainloop::new()
        .ok_or_else(|| KoraError::DeviceUnavailable("failed to create mainloop".into()))?;
    let mut context = Context::new_with_proplist(&mainloop, "kora-device-lister", &proplist)
        .ok_or_else(|| KoraError::DeviceUnavailable("failed to create context".into()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| map_open_error(e, "sound server"))?;

    loop {
        match mainloop.iterate(true) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(KoraError::DeviceUnavailable("mainloop iterate failed".into()));
            }
            IterateResult::Success(_) => {}
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(KoraError::DeviceUnavailable(
                    "sound server connection failed".into(),
                ));
            }
            _ => {}
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(info) => {
            let is_monitor = info.monitor_of_sink.is_some()
                || info
                    .name
                    .as_ref()
                    .map(|name| name.contains("monitor"))
                    .unwrap_or(false);
            if let (Some(name), Some(description)) = (
                info.name.as_ref().map(|s| s.to_string()),
                info.description.as_ref().map(|s| s.to_string()),
            ) {
                if let Ok(mut devices) = devices_clone.lock() {
                    devices.push(InputDevice {
                        name,
                        description,
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        is_monitor,
                    });
                }
            }
        }
        ListResult::End => done_clone.store(true, Ordering::SeqCst),
        ListResult::Error => {
            error!("Error listing audio sources");
            done_clone.store(true, Ordering::SeqCst);
        }
    });

    while !done.load(Ordering::SeqCst) {
        match mainloop.iterate(true) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(KoraError::DeviceUnavailable("mainloop iterate failed".into()));
            }
            IterateResult::Success(_) => {}
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let mut devices = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| KoraError::DeviceUnavailable("device list poisoned".into()))?;
    devices.sort_by_key(|d| d.is_monitor);
    Ok(devices)
}
