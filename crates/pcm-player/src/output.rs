//! CPAL-backed sink.
//!
//! Bridges the blocking `write` model the engine expects onto CPAL's pull callback:
//! - `write` pushes s16 samples into a bounded [`DeviceBuffer`], blocking while it is full
//! - the output callback drains the buffer without blocking and converts to the device format
//! - underruns and paused periods are filled with silence
//!
//! CPAL streams are not `Send` on every host, so each sink owns a keeper thread that builds
//! the stream, reports the outcome, and then applies play/pause/release commands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::config::MAX_CHUNK_BYTES;
use crate::device;
use crate::error::SinkError;
use crate::sink::{AudioSink, SinkConfig, SinkFactory};

/// Bounded queue of interleaved s16 samples between `write` and the output callback.
///
/// ## Design
/// - **Single producer / single consumer**: the playback thread and the CPAL callback.
/// - **Bounded** by `capacity` samples; this is the device buffer the writer paces against.
/// - A `closed` flag under the same mutex releases blocked writers on teardown.
/// - `clear` bumps a flush generation; a writer blocked across a flush drops the rest of its
///   samples instead of waiting for a paused callback to drain.
pub struct DeviceBuffer {
    inner: Mutex<DeviceBufferInner>,
    cv: Condvar,
    capacity: usize,
}

struct DeviceBufferInner {
    samples: VecDeque<i16>,
    closed: bool,
    flushes: u64,
}

impl DeviceBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(DeviceBufferInner {
                samples: VecDeque::with_capacity(capacity),
                closed: false,
                flushes: 0,
            }),
            cv: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceBufferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Push samples, blocking while the buffer is full.
    ///
    /// Returns [`SinkError::Released`] if the buffer is closed before every sample fits. If the
    /// buffer is flushed while this waits, the samples not yet pushed are discarded along with
    /// the flushed ones.
    pub fn push_blocking(&self, samples: &[i16]) -> Result<(), SinkError> {
        let mut offset = 0;
        let flushes = self.lock().flushes;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.samples.len() >= self.capacity && !g.closed && g.flushes == flushes {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.closed {
                return Err(SinkError::Released);
            }
            if g.flushes != flushes {
                return Ok(());
            }

            let room = self.capacity - g.samples.len();
            let take = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;
        }
        Ok(())
    }

    /// Fill `out` from the buffer without blocking; missing samples become silence.
    ///
    /// Returns the number of samples that came from the buffer.
    pub fn pop_into<T>(&self, out: &mut [T]) -> usize
    where
        T: cpal::SizedSample + cpal::FromSample<i16>,
    {
        let mut g = self.lock();
        let available = g.samples.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(g.samples.drain(..available)) {
            *slot = <T as cpal::Sample>::from_sample::<i16>(sample);
        }
        drop(g);
        out[available..].fill(T::EQUILIBRIUM);
        if available > 0 {
            self.cv.notify_all();
        }
        available
    }

    /// Drop every buffered sample and abandon a blocked push.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.samples.clear();
        g.flushes += 1;
        drop(g);
        self.cv.notify_all();
    }

    /// Close the buffer; blocked and future pushes fail. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }
}

/// Opens [`CpalSink`]s on the default host.
#[derive(Clone, Debug, Default)]
pub struct CpalSinkFactory {
    /// Substring of the output device name; `None` selects the default device.
    pub device: Option<String>,
    /// Lower bound applied to the device-reported minimum buffer, in frames.
    pub min_buffer_floor_frames: u32,
}

impl CpalSinkFactory {
    pub fn new(device: Option<String>, min_buffer_floor_frames: u32) -> Self {
        Self {
            device,
            min_buffer_floor_frames,
        }
    }
}

impl SinkFactory for CpalSinkFactory {
    fn min_buffer_size(&self, config: &SinkConfig) -> Result<usize, SinkError> {
        let host = cpal::default_host();
        let dev = device::pick_device(&host, self.device.as_deref())?;
        let supported = device::find_output_config(&dev, config)?;
        let (frames, _) = device::pick_buffer_frames(
            supported.buffer_size(),
            config.sample_rate,
            self.min_buffer_floor_frames,
        );
        Ok(frames as usize * config.frame_size())
    }

    fn open(&self, config: &SinkConfig, buffer_bytes: usize) -> Result<Arc<dyn AudioSink>, SinkError> {
        let sink = CpalSink::open(self, *config, buffer_bytes)?;
        Ok(Arc::new(sink))
    }
}

enum StreamCommand {
    Play,
    Pause,
    Release,
}

/// Streaming s16 sink on a CPAL output device.
pub struct CpalSink {
    buffer: Arc<DeviceBuffer>,
    paused: Arc<AtomicBool>,
    stream_error: Arc<Mutex<Option<String>>>,
    underrun_events: Arc<AtomicU64>,
    cmd_tx: Sender<StreamCommand>,
    keeper: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl CpalSink {
    /// Build the output stream on a keeper thread and wait for the outcome.
    ///
    /// The stream starts paused; call [`AudioSink::play`] to begin rendering.
    pub fn open(
        factory: &CpalSinkFactory,
        config: SinkConfig,
        buffer_bytes: usize,
    ) -> Result<Self, SinkError> {
        // Room for at least one queued chunk, so a single write never waits on itself.
        let buffer = Arc::new(DeviceBuffer::new((buffer_bytes / 2).max(MAX_CHUNK_BYTES / 2)));
        let paused = Arc::new(AtomicBool::new(true));
        let stream_error = Arc::new(Mutex::new(None));
        let underrun_events = Arc::new(AtomicU64::new(0));
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let keeper = {
            let factory = factory.clone();
            let shared = StreamShared {
                buffer: buffer.clone(),
                paused: paused.clone(),
                stream_error: stream_error.clone(),
                underrun_events: underrun_events.clone(),
            };
            std::thread::Builder::new()
                .name("pcm-output".to_string())
                .spawn(move || keeper_main(factory, config, shared, ready_tx, cmd_rx))
                .map_err(|e| SinkError::Open(e.to_string()))?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = keeper.join();
                return Err(e);
            }
            Err(_) => {
                let _ = keeper.join();
                return Err(SinkError::Open("output thread exited during setup".to_string()));
            }
        }

        tracing::info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            buffer_bytes,
            "output stream opened"
        );

        Ok(Self {
            buffer,
            paused,
            stream_error,
            underrun_events,
            cmd_tx,
            keeper: Mutex::new(Some(keeper)),
            released: AtomicBool::new(false),
        })
    }

    fn check_stream(&self) -> Result<(), SinkError> {
        let err = self
            .stream_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match err {
            Some(msg) => Err(SinkError::Stream(msg)),
            None => Ok(()),
        }
    }

    fn send(&self, cmd: StreamCommand) -> Result<(), SinkError> {
        self.cmd_tx.send(cmd).map_err(|_| SinkError::Released)
    }
}

impl AudioSink for CpalSink {
    fn play(&self) -> Result<(), SinkError> {
        if self.is_released() {
            return Err(SinkError::Released);
        }
        self.paused.store(false, Ordering::Release);
        self.send(StreamCommand::Play)
    }

    fn pause(&self) -> Result<(), SinkError> {
        if self.is_released() {
            return Err(SinkError::Released);
        }
        self.paused.store(true, Ordering::Release);
        self.send(StreamCommand::Pause)
    }

    fn flush(&self) {
        self.buffer.clear();
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, SinkError> {
        if self.is_released() {
            return Err(SinkError::Released);
        }
        self.check_stream()?;
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.buffer.push_blocking(&samples)?;
        Ok(samples.len() * 2)
    }

    fn stop(&self) {
        if self.is_released() {
            return;
        }
        self.paused.store(true, Ordering::Release);
        let _ = self.send(StreamCommand::Pause);
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.paused.store(true, Ordering::Release);
        self.buffer.close();
        let _ = self.cmd_tx.send(StreamCommand::Release);
        let keeper = self
            .keeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(keeper) = keeper {
            let _ = keeper.join();
        }
        tracing::debug!(
            underrun_events = self.underrun_events.load(Ordering::Relaxed),
            "output stream released"
        );
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.release();
    }
}

struct StreamShared {
    buffer: Arc<DeviceBuffer>,
    paused: Arc<AtomicBool>,
    stream_error: Arc<Mutex<Option<String>>>,
    underrun_events: Arc<AtomicU64>,
}

/// Own the CPAL stream for its whole life: build, report, obey commands, drop.
fn keeper_main(
    factory: CpalSinkFactory,
    config: SinkConfig,
    shared: StreamShared,
    ready_tx: Sender<Result<(), SinkError>>,
    cmd_rx: Receiver<StreamCommand>,
) {
    let stream = match build_stream_for(&factory, &config, shared) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if ready_tx.send(Ok(())).is_err() {
        return;
    }

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            StreamCommand::Play => {
                if let Err(e) = stream.play() {
                    tracing::warn!("stream play failed: {e}");
                }
            }
            StreamCommand::Pause => {
                if let Err(e) = stream.pause() {
                    tracing::debug!("stream pause failed: {e}");
                }
            }
            StreamCommand::Release => break,
        }
    }
    drop(stream);
}

fn build_stream_for(
    factory: &CpalSinkFactory,
    config: &SinkConfig,
    shared: StreamShared,
) -> Result<cpal::Stream, SinkError> {
    let host = cpal::default_host();
    let dev = device::pick_device(&host, factory.device.as_deref())?;
    let supported = device::find_output_config(&dev, config)?;
    let mut stream_config: cpal::StreamConfig = supported.clone().into();
    let (_, buffer_size) = device::pick_buffer_frames(
        supported.buffer_size(),
        config.sample_rate,
        factory.min_buffer_floor_frames,
    );
    if let Some(buffer_size) = buffer_size {
        stream_config.buffer_size = buffer_size;
    }
    if let Ok(desc) = dev.description() {
        tracing::info!(
            device = %desc,
            sample_format = ?supported.sample_format(),
            buffer_size = ?stream_config.buffer_size,
            "output device"
        );
    }

    match supported.sample_format() {
        cpal::SampleFormat::I16 => build_stream::<i16>(&dev, &stream_config, shared),
        cpal::SampleFormat::F32 => build_stream::<f32>(&dev, &stream_config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(&dev, &stream_config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(&dev, &stream_config, shared),
        other => Err(SinkError::Open(format!("unsupported sample format: {other:?}"))),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
///
/// The callback never waits: paused output is silence and does not drain the buffer, and a
/// short buffer is padded with silence and counted as an underrun.
fn build_stream<T>(
    dev: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: StreamShared,
) -> Result<cpal::Stream, SinkError>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    let StreamShared {
        buffer,
        paused,
        stream_error,
        underrun_events,
    } = shared;

    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        if let Ok(mut slot) = stream_error.lock() {
            slot.get_or_insert_with(|| err.to_string());
        }
    };

    dev.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if paused.load(Ordering::Relaxed) {
                data.fill(T::EQUILIBRIUM);
                return;
            }
            let filled = buffer.pop_into(data);
            if filled < data.len() {
                underrun_events.fetch_add(1, Ordering::Relaxed);
            }
        },
        err_fn,
        Some(Duration::from_secs(2)),
    )
    .map_err(|e| SinkError::Open(e.to_string()))
}
