//! Playback engine: one configured session and its dedicated playback thread.
//!
//! The control surface owns a [`PlaybackEngine`]. `setup` opens a sink and spawns the
//! playback thread; the thread drains the [`SampleQueue`] into the sink, whose blocking
//! `write` paces it at device speed, and raises [`FeederEvent::FeedSamples`] when the queue
//! runs low. Events go out over a channel; the thread never calls back into the host.
//!
//! Shutdown is deterministic: `release` (or dropping the engine) sets the stop flag, closes
//! the queue to interrupt the bounded wait, releases the sink to unblock a pending write,
//! and joins the thread before returning.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use pcm_types::FeederEvent;
use thread_priority::{ThreadPriority, set_current_thread_priority};

use crate::chunk;
use crate::config::FeederConfig;
use crate::error::{EngineError, SetupError, SinkError};
use crate::queue::SampleQueue;
use crate::sink::{AudioSink, SinkConfig, SinkFactory};

/// Observable engine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Playing,
    Paused,
    /// The sink failed mid-stream; only `setup` or `release` recover.
    Faulted,
}

/// Debounce for feed requests; cleared by every `feed`.
#[derive(Debug, Default)]
struct FeedWatch {
    notified_threshold: bool,
    notified_zero: bool,
}

/// State shared between the control surface and the playback thread.
struct SessionShared {
    config: SinkConfig,
    queue: SampleQueue,
    sink: Arc<dyn AudioSink>,
    playing: AtomicBool,
    stop_requested: AtomicBool,
    threshold: Arc<AtomicU64>,
    watch: Mutex<FeedWatch>,
    /// Held by the playback thread around "is playing? then write", so `stop` can wait out
    /// a write that started before playback was paused.
    write_gate: Mutex<()>,
    fault: Mutex<Option<String>>,
    events: Sender<FeederEvent>,
    poll_interval: Duration,
}

impl SessionShared {
    fn watch(&self) -> MutexGuard<'_, FeedWatch> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault_message(&self) -> Option<String> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Decide whether this iteration owes the host a feed request.
    ///
    /// Runs under the watch lock so it cannot interleave with a `feed` that clears the flags
    /// and enqueues.
    fn poll_feed_request(&self) -> Option<u64> {
        let mut watch = self.watch();
        let remaining = self.queue.remaining_frames();
        let threshold = self.threshold.load(Ordering::Relaxed);

        let threshold_event = remaining <= threshold && !watch.notified_threshold;
        let zero_event = remaining == 0 && !watch.notified_zero;
        if !(threshold_event || zero_event) {
            return None;
        }
        watch.notified_threshold = true;
        if remaining == 0 {
            watch.notified_zero = true;
        }
        Some(remaining)
    }

    fn emit(&self, event: FeederEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("feeder event dropped: no receiver");
        }
    }

    /// Record a fatal sink error and tell the host.
    fn fail(&self, err: SinkError) {
        tracing::error!("sink write failed; stopping session: {err}");
        let message = err.to_string();
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
        self.playing.store(false, Ordering::Release);
        self.emit(FeederEvent::PlaybackFault { message });
    }
}

struct Session {
    shared: Arc<SessionShared>,
    worker: Option<JoinHandle<()>>,
}

/// Owner of the current playback session.
pub struct PlaybackEngine {
    factory: Arc<dyn SinkFactory>,
    config: FeederConfig,
    threshold: Arc<AtomicU64>,
    events: Sender<FeederEvent>,
    session: Option<Session>,
}

impl PlaybackEngine {
    /// Create an engine with no session. Feed requests are sent to `events`.
    pub fn new(factory: Arc<dyn SinkFactory>, config: FeederConfig, events: Sender<FeederEvent>) -> Self {
        let threshold = Arc::new(AtomicU64::new(config.default_feed_threshold));
        Self {
            factory,
            config,
            threshold,
            events,
            session: None,
        }
    }

    /// Configure a new session, tearing down any existing one first.
    ///
    /// On error the engine is left uninitialized and no thread is running.
    pub fn setup(&mut self, sample_rate: u32, channels: u16) -> Result<(), SetupError> {
        self.teardown();

        if sample_rate == 0 {
            return Err(SetupError::InvalidSampleRate(sample_rate.into()));
        }
        if !(1..=2).contains(&channels) {
            return Err(SetupError::InvalidChannels(channels.into()));
        }

        let config = SinkConfig::new(sample_rate, channels);
        let min_buffer = self
            .factory
            .min_buffer_size(&config)
            .map_err(SetupError::BufferSize)?;
        if min_buffer == 0 {
            return Err(SetupError::BufferSize(SinkError::Query(
                "device reported an empty buffer".to_string(),
            )));
        }
        let sink = self
            .factory
            .open(&config, min_buffer)
            .map_err(SetupError::Open)?;

        let shared = Arc::new(SessionShared {
            config,
            queue: SampleQueue::new(config.frame_size()),
            sink,
            playing: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            threshold: self.threshold.clone(),
            watch: Mutex::new(FeedWatch::default()),
            write_gate: Mutex::new(()),
            fault: Mutex::new(None),
            events: self.events.clone(),
            poll_interval: self.config.poll_interval,
        });

        let shared_for_thread = shared.clone();
        let worker = std::thread::Builder::new()
            .name("pcm-playback".to_string())
            .spawn(move || playback_thread_main(shared_for_thread))
            .map_err(|e| {
                shared.sink.release();
                SetupError::Open(SinkError::Open(format!("spawn playback thread: {e}")))
            })?;

        tracing::info!(
            sample_rate,
            channels,
            min_buffer_bytes = min_buffer,
            "playback session configured"
        );

        self.session = Some(Session {
            shared,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Queue PCM bytes for playback and re-arm feed requests.
    ///
    /// `buffer` must hold whole frames (`2 * channels` bytes each); anything else is rejected
    /// before touching the queue.
    pub fn feed(&self, buffer: impl Into<Arc<[u8]>>) -> Result<(), EngineError> {
        let shared = self.shared()?;
        if let Some(msg) = shared.fault_message() {
            return Err(EngineError::Faulted(msg));
        }

        let buffer = buffer.into();
        let frame_size = shared.config.frame_size();
        if buffer.len() % frame_size != 0 {
            return Err(EngineError::PartialFrame {
                len: buffer.len(),
                frame_size,
            });
        }
        let chunks = chunk::split(buffer, self.config.max_chunk_bytes);

        let mut watch = shared.watch();
        watch.notified_threshold = false;
        watch.notified_zero = false;
        shared.queue.enqueue_all(chunks);
        Ok(())
    }

    /// Resume playback. A no-op when unconfigured or already playing.
    pub fn start(&self) -> Result<(), EngineError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let shared = &session.shared;
        if shared.playing.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(msg) = shared.fault_message() {
            return Err(EngineError::Faulted(msg));
        }
        shared.sink.play()?;
        shared.playing.store(true, Ordering::Release);
        tracing::debug!("playback started");
        Ok(())
    }

    /// Pause playback and discard everything buffered. A no-op when not playing.
    ///
    /// The playback thread keeps running and drops whatever it dequeues until `start`.
    /// When this returns, no further write reaches the sink until `start`, even if the sink
    /// failed to pause (that error is still returned).
    pub fn stop(&self) -> Result<(), EngineError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let shared = &session.shared;
        if !shared.playing.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let paused = shared.sink.pause();
        shared.sink.flush();
        drop(shared.write_gate.lock().unwrap_or_else(PoisonError::into_inner));
        shared.sink.flush();
        shared.queue.clear();
        if let Err(e) = &paused {
            tracing::warn!("sink pause failed: {e}");
        }
        tracing::debug!("playback stopped");
        paused.map_err(EngineError::from)
    }

    /// Set the low-buffer watermark in frames. Applies to current and future sessions.
    pub fn set_feed_threshold(&self, frames: u64) {
        self.threshold.store(frames, Ordering::Relaxed);
    }

    pub fn feed_threshold(&self) -> u64 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Tear down the session: stop and join the playback thread, release the sink.
    ///
    /// Idempotent. When this returns no write is in flight and none will follow.
    pub fn release(&mut self) {
        self.teardown();
    }

    pub fn state(&self) -> EngineState {
        match self.session.as_ref() {
            None => EngineState::Uninitialized,
            Some(s) if s.shared.fault_message().is_some() => EngineState::Faulted,
            Some(s) if s.shared.playing.load(Ordering::Acquire) => EngineState::Playing,
            Some(_) => EngineState::Paused,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.session.is_some()
    }

    /// Format of the current session.
    pub fn session_config(&self) -> Option<SinkConfig> {
        self.session.as_ref().map(|s| s.shared.config)
    }

    /// Frames still queued; zero when unconfigured.
    pub fn remaining_frames(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| s.shared.queue.remaining_frames())
            .unwrap_or(0)
    }

    fn shared(&self) -> Result<&SessionShared, EngineError> {
        self.session
            .as_ref()
            .map(|s| s.shared.as_ref())
            .ok_or(EngineError::NotConfigured)
    }

    fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let shared = &session.shared;
        shared.stop_requested.store(true, Ordering::Release);
        shared.playing.store(false, Ordering::Release);
        shared.queue.close();
        shared.sink.release();

        if let Some(worker) = session.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("playback thread panicked");
            }
        }
        shared.queue.clear();
        tracing::info!("playback session released");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Body of the playback thread.
///
/// Runs until the stop flag is set or the sink fails. Chunks dequeued while paused are
/// dropped so nothing accumulates in the sink.
fn playback_thread_main(shared: Arc<SessionShared>) {
    raise_playback_priority();
    tracing::debug!(
        sample_rate = shared.config.sample_rate,
        channels = shared.config.channels,
        "playback thread started"
    );

    if let Err(e) = shared.sink.play() {
        if !shared.is_stopping() {
            shared.fail(e);
        }
    } else {
        run_loop(&shared);
    }

    shared.sink.stop();
    shared.sink.flush();
    shared.sink.release();
    tracing::debug!("playback thread finished");
}

/// Ask the OS for the highest priority it grants this thread. Best effort: an unprivileged
/// process is often refused, and playback proceeds at normal priority.
fn raise_playback_priority() -> bool {
    match set_current_thread_priority(ThreadPriority::Max) {
        Ok(()) => {
            tracing::debug!("playback thread priority raised");
            true
        }
        Err(e) => {
            tracing::debug!("failed to raise playback thread priority: {e:?}");
            false
        }
    }
}

fn run_loop(shared: &SessionShared) {
    while !shared.is_stopping() {
        if let Some(chunk) = shared.queue.try_dequeue(shared.poll_interval) {
            let _gate = shared.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
            if shared.playing.load(Ordering::Acquire) {
                if let Err(e) = shared.sink.write(&chunk) {
                    if !shared.is_stopping() {
                        shared.fail(e);
                    }
                    return;
                }
            }
        }

        if shared.is_stopping() {
            return;
        }
        if let Some(remaining_frames) = shared.poll_feed_request() {
            tracing::trace!(remaining_frames, "requesting more samples");
            shared.emit(FeederEvent::FeedSamples { remaining_frames });
        }
    }
}
