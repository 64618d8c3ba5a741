//! In-memory sink: records everything the engine does to it.
//!
//! Used by the test suites and by the CLI's `--dry-run` mode (with real-time pacing so the
//! feed/notify cadence matches a real device).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::SinkError;
use crate::sink::{AudioSink, SinkConfig, SinkFactory};

/// One observed sink operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    Opened { sink: u64, buffer_bytes: usize },
    Play { sink: u64 },
    Pause { sink: u64 },
    Flush { sink: u64 },
    Write { sink: u64, len: usize },
    Stop { sink: u64 },
    Released { sink: u64 },
}

#[derive(Default)]
struct ProbeState {
    events: Vec<SinkEvent>,
    data: Vec<u8>,
    held: bool,
}

/// Shared view of every sink opened by one [`MemorySinkFactory`].
#[derive(Clone, Default)]
pub struct MemorySinkProbe {
    state: Arc<(Mutex<ProbeState>, Condvar)>,
}

impl MemorySinkProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: SinkEvent, bytes: Option<&[u8]>) {
        let mut g = self.lock();
        if let Some(bytes) = bytes {
            g.data.extend_from_slice(bytes);
        }
        g.events.push(event);
        drop(g);
        self.state.1.notify_all();
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.lock().events.clone()
    }

    /// All bytes written so far, across sinks, in write order.
    pub fn written(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Sizes of every write, in order.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Write { len, .. } => Some(*len),
                _ => None,
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.write_sizes().len()
    }

    /// Whether the sink with id `sink` has been released.
    pub fn is_released(&self, sink: u64) -> bool {
        self.lock()
            .events
            .iter()
            .any(|e| *e == SinkEvent::Released { sink })
    }

    /// Make subsequent writes block until [`MemorySinkProbe::resume_writes`] or release.
    pub fn hold_writes(&self) {
        self.lock().held = true;
    }

    pub fn resume_writes(&self) {
        self.lock().held = false;
        self.state.1.notify_all();
    }

    /// Wait until at least `len` bytes have been written.
    pub fn wait_for_bytes(&self, len: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.data.len() >= len)
    }

    /// Wait until `pred` holds for the recorded events.
    pub fn wait_for_event(&self, timeout: Duration, pred: impl Fn(&SinkEvent) -> bool) -> bool {
        self.wait_until(timeout, |s| s.events.iter().any(&pred))
    }

    fn wait_until(&self, timeout: Duration, pred: impl Fn(&ProbeState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if pred(&g) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _timeout) = self
                .state
                .1
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
    }
}

/// Scripted behavior for sinks produced by a [`MemorySinkFactory`].
#[derive(Clone, Debug, Default)]
pub struct MemorySinkOptions {
    /// Sleep for the playback duration of each write.
    pub realtime: bool,
    /// Fail the minimum-buffer query.
    pub fail_min_buffer: bool,
    /// Fail `open`.
    pub fail_open: bool,
    /// Fail `pause` with a stream error.
    pub fail_pause: bool,
    /// Fail every write after this many successful ones.
    pub fail_write_after: Option<usize>,
}

/// Factory for [`MemorySink`]s sharing one probe.
pub struct MemorySinkFactory {
    options: MemorySinkOptions,
    probe: MemorySinkProbe,
    next_id: AtomicU64,
}

impl MemorySinkFactory {
    pub fn new(options: MemorySinkOptions) -> Self {
        Self {
            options,
            probe: MemorySinkProbe::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn probe(&self) -> MemorySinkProbe {
        self.probe.clone()
    }
}

impl Default for MemorySinkFactory {
    fn default() -> Self {
        Self::new(MemorySinkOptions::default())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn min_buffer_size(&self, config: &SinkConfig) -> Result<usize, SinkError> {
        if self.options.fail_min_buffer {
            return Err(SinkError::UnsupportedFormat {
                sample_rate: config.sample_rate,
                channels: config.channels,
            });
        }
        Ok(config.frame_size() * (config.sample_rate as usize / 50).max(1))
    }

    fn open(&self, config: &SinkConfig, buffer_bytes: usize) -> Result<Arc<dyn AudioSink>, SinkError> {
        if self.options.fail_open {
            return Err(SinkError::Open("scripted open failure".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.probe.record(
            SinkEvent::Opened {
                sink: id,
                buffer_bytes,
            },
            None,
        );
        Ok(Arc::new(MemorySink {
            id,
            config: *config,
            options: self.options.clone(),
            probe: self.probe.clone(),
            writes: AtomicU64::new(0),
            released: AtomicBool::new(false),
        }))
    }
}

/// Sink that stores written bytes in its probe instead of playing them.
pub struct MemorySink {
    id: u64,
    config: SinkConfig,
    options: MemorySinkOptions,
    probe: MemorySinkProbe,
    writes: AtomicU64,
    released: AtomicBool,
}

impl MemorySink {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl AudioSink for MemorySink {
    fn play(&self) -> Result<(), SinkError> {
        if self.is_released() {
            return Err(SinkError::Released);
        }
        self.probe.record(SinkEvent::Play { sink: self.id }, None);
        Ok(())
    }

    fn pause(&self) -> Result<(), SinkError> {
        if self.is_released() {
            return Err(SinkError::Released);
        }
        if self.options.fail_pause {
            return Err(SinkError::Stream("scripted pause failure".to_string()));
        }
        self.probe.record(SinkEvent::Pause { sink: self.id }, None);
        Ok(())
    }

    fn flush(&self) {
        if !self.is_released() {
            self.probe.record(SinkEvent::Flush { sink: self.id }, None);
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, SinkError> {
        {
            let mut g = self.probe.lock();
            while g.held && !self.is_released() {
                let (ng, _timeout) = self
                    .probe
                    .state
                    .1
                    .wait_timeout(g, Duration::from_millis(5))
                    .unwrap_or_else(PoisonError::into_inner);
                g = ng;
            }
        }
        if self.is_released() {
            return Err(SinkError::Released);
        }
        let done = self.writes.fetch_add(1, Ordering::Relaxed) as usize;
        if self.options.fail_write_after.is_some_and(|limit| done >= limit) {
            return Err(SinkError::Stream("scripted write failure".to_string()));
        }
        if self.options.realtime {
            std::thread::sleep(self.config.duration_of(bytes.len()));
        }
        self.probe.record(
            SinkEvent::Write {
                sink: self.id,
                len: bytes.len(),
            },
            Some(bytes),
        );
        Ok(bytes.len())
    }

    fn stop(&self) {
        if !self.is_released() {
            self.probe.record(SinkEvent::Stop { sink: self.id }, None);
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.probe.record(SinkEvent::Released { sink: self.id }, None);
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
