//! Fixed-frequency sampling loop between a capture device and its readers.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use tracing::{error, info, info_span, warn};

use crate::{
    observation::{Channel, Publisher},
    BridgeConfig, BridgeError, CaptureBackend, ControlState, DeviceHandle, Frame, NoCommand,
    ObservationReader, ObservationRecord, RestartPolicy, Result, Snapshot, StateConverter,
    StopSignal, TickSchedule, WebcamConverter,
};

/// Owns a capture device and publishes one observation per tick while running.
///
/// The device is only touched by the sampling thread while the loop runs and
/// is handed back to the bridge when the loop is joined. A loop that dies on a
/// fatal error records it before exiting, so [`fatal_error`](Bridge::fatal_error)
/// reports it as soon as [`is_running`](Bridge::is_running) turns false, and
/// keeps reporting it until the next successful start.
pub struct Bridge<B, C = WebcamConverter>
where
    B: CaptureBackend,
    C: StateConverter<Output = Frame, Command = NoCommand> + Sync,
{
    config: BridgeConfig,
    converter: Arc<C>,
    device: Option<DeviceHandle<B>>,
    channel: Arc<Channel>,
    running: Option<Running<B>>,
    fatal: FatalSlot,
    next_iteration: u64,
    epoch: Option<Instant>,
}

struct Running<B: CaptureBackend> {
    stop: Arc<StopSignal>,
    alive: Arc<AtomicBool>,
    thread: JoinHandle<LoopExit<B>>,
}

struct LoopExit<B: CaptureBackend> {
    device: DeviceHandle<B>,
    next_iteration: u64,
}

/// Last fatal error, written by the sampling thread and read by the owner.
type FatalSlot = Arc<Mutex<Option<Arc<BridgeError>>>>;

impl<B: CaptureBackend> Bridge<B, WebcamConverter> {
    /// Bridge for a camera, whose frames carry no actuator state.
    pub fn webcam(backend: B, config: BridgeConfig) -> Self {
        Self::new(backend, config, WebcamConverter)
    }
}

impl<B, C> Bridge<B, C>
where
    B: CaptureBackend,
    C: StateConverter<Output = Frame, Command = NoCommand> + Sync,
{
    pub fn new(backend: B, config: BridgeConfig, converter: C) -> Self {
        let device = DeviceHandle::with_shape(backend, config.device_index, config.shape);
        Self {
            channel: Channel::new(config.segment_id.clone(), config.history),
            config,
            converter: Arc::new(converter),
            device: Some(device),
            running: None,
            fatal: FatalSlot::default(),
            next_iteration: 0,
            epoch: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn segment_id(&self) -> &str {
        &self.config.segment_id
    }

    /// Returns a new reader over this bridge's observations.
    pub fn reader(&self) -> ObservationReader {
        ObservationReader::new(Arc::clone(&self.channel))
    }

    /// `true` while the sampling thread is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.alive.load(Ordering::SeqCst))
    }

    /// The error that ended the last run, if it ended on one.
    ///
    /// Available as soon as the loop has died, before [`stop`](Self::stop).
    pub fn fatal_error(&self) -> Option<Arc<BridgeError>> {
        lock_fatal(&self.fatal).clone()
    }

    /// Hands the error that ended the last run over to the caller.
    pub fn take_fatal_error(&mut self) -> Option<Arc<BridgeError>> {
        lock_fatal(&self.fatal).take()
    }

    /// Opens the device and starts sampling on a dedicated thread.
    ///
    /// A bridge whose loop has ended on its own must be stopped before it can
    /// be started again.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        self.config.validate()?;
        let period = self.config.period()?;

        let mut device = self
            .device
            .take()
            .ok_or_else(|| BridgeError::msg("device handle was lost by a previous run"))?;
        if let Err(err) = device.open() {
            error!(index = device.index(), %err, "failed to start bridge");
            self.device = Some(device);
            return Err(err);
        }

        lock_fatal(&self.fatal).take();
        let (first_iteration, epoch) = match (self.config.restart, self.epoch) {
            (RestartPolicy::Continue, Some(epoch)) => (self.next_iteration, epoch),
            _ => (0, Instant::now()),
        };
        self.epoch = Some(epoch);

        let publisher = self.channel.begin_run()?;
        let stop = Arc::new(StopSignal::new());
        let alive = Arc::new(AtomicBool::new(true));
        let sampler = Sampler {
            device,
            converter: Arc::clone(&self.converter),
            publisher,
            stop: Arc::clone(&stop),
            fatal: Arc::clone(&self.fatal),
            schedule: TickSchedule::new(period),
            frequency: self.config.frequency,
            epoch,
            iteration: first_iteration,
            state: ControlState::empty(),
            spare: None,
        };

        let span = info_span!("bridge", segment_id = %self.config.segment_id);
        let guard = AliveGuard(Arc::clone(&alive));
        let thread = thread::Builder::new()
            .name(format!("bridge-{}", self.config.segment_id))
            .spawn(move || {
                let _guard = guard;
                let _entered = span.enter();
                sampler.run()
            })?;

        info!(
            segment_id = %self.config.segment_id,
            frequency = self.config.frequency,
            first_iteration,
            "bridge started"
        );
        self.running = Some(Running {
            stop,
            alive,
            thread,
        });
        Ok(())
    }

    /// Ends the loop, joins it and closes the device.
    ///
    /// Safe to call repeatedly, and after the loop has already died.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.stop.request()?;

        match running.thread.join() {
            Ok(exit) => {
                let mut device = exit.device;
                device.close();
                self.device = Some(device);
                self.next_iteration = exit.next_iteration;
            }
            Err(_) => {
                let err = BridgeError::msg("sampling thread panicked");
                *lock_fatal(&self.fatal) = Some(Arc::new(err));
            }
        }

        info!(segment_id = %self.config.segment_id, "bridge stopped");
        Ok(())
    }
}

impl<B, C> Drop for Bridge<B, C>
where
    B: CaptureBackend,
    C: StateConverter<Output = Frame, Command = NoCommand> + Sync,
{
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl<B, C> std::fmt::Debug for Bridge<B, C>
where
    B: CaptureBackend,
    C: StateConverter<Output = Frame, Command = NoCommand> + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("fatal", &self.fatal_error())
            .finish()
    }
}

fn lock_fatal(slot: &FatalSlot) -> MutexGuard<'_, Option<Arc<BridgeError>>> {
    // The slot only ever holds a finished value, so a poisoned lock is still usable.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the liveness flag when the sampling thread exits, panics included.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Sampler<B: CaptureBackend, C> {
    device: DeviceHandle<B>,
    converter: Arc<C>,
    publisher: Publisher,
    stop: Arc<StopSignal>,
    fatal: FatalSlot,
    schedule: TickSchedule,
    frequency: f64,
    epoch: Instant,
    iteration: u64,
    state: ControlState,
    /// Snapshot buffer reclaimed from a superseded record no reader held.
    spare: Option<Snapshot>,
}

impl<B, C> Sampler<B, C>
where
    B: CaptureBackend,
    C: StateConverter<Output = Frame, Command = NoCommand>,
{
    fn run(mut self) -> LoopExit<B> {
        let outcome = loop {
            let deadline = self.schedule.next_deadline(Instant::now());
            match self.stop.wait_until(deadline) {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(err) => break Err(err),
            }
            match self.tick() {
                Ok(()) => {}
                Err(err) if err.is_fatal() => break Err(err),
                Err(err) => {
                    warn!(iteration = self.iteration, %err, "tick skipped");
                }
            }
        };
        self.device.close();

        if let Err(err) = outcome {
            error!(
                index = self.device.index(),
                iteration = self.iteration,
                %err,
                "sampling loop terminated"
            );
            *lock_fatal(&self.fatal) = Some(Arc::new(err));
        }

        LoopExit {
            device: self.device,
            next_iteration: self.iteration,
        }
    }

    fn tick(&mut self) -> Result<()> {
        let command = self.converter.to_command(&self.state);
        self.device.apply(command)?;

        let frame = self.device.read()?;
        let state = self.converter.to_state(&frame);

        let mut extended = self
            .spare
            .take()
            .unwrap_or_else(|| Snapshot::new(self.device.shape()));
        extended.set(&frame)?;

        let record = ObservationRecord::new(
            self.iteration,
            self.frequency,
            self.epoch.elapsed(),
            state.clone(),
            extended,
        );
        self.state = state;
        self.iteration += 1;

        let previous = self.publisher.publish(record)?;
        self.spare = previous
            .and_then(|record| Arc::try_unwrap(record).ok())
            .map(ObservationRecord::into_extended);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{FrameShape, SyntheticBackend, SyntheticScript};

    fn shape() -> FrameShape {
        FrameShape::new(8, 4, 3)
    }

    fn config(frequency: f64) -> BridgeConfig {
        BridgeConfig::new(0, frequency, "bridge_test").with_shape(shape())
    }

    fn stamp(record: &ObservationRecord) -> u64 {
        let bytes = &record.extended().get()[..8];
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Consumes everything a stopped run left behind.
    fn drain(reader: &mut ObservationReader) -> Option<Arc<ObservationRecord>> {
        let mut last = None;
        while let Some(record) = reader.wait_for_next(Duration::from_millis(50)).unwrap() {
            last = Some(record);
        }
        last
    }

    fn wait_until_stopped<B: CaptureBackend>(bridge: &Bridge<B>, limit: Duration) -> bool {
        let started = Instant::now();
        while bridge.is_running() {
            if started.elapsed() > limit {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn publishes_one_record_per_frame() {
        let mut bridge = Bridge::webcam(SyntheticBackend::new(), config(100.0).with_history(64));
        let mut reader = bridge.reader();
        bridge.start().unwrap();

        let mut last = None;
        for _ in 0..10 {
            let record = reader
                .wait_for_next(Duration::from_secs(2))
                .unwrap()
                .expect("bridge should keep publishing");
            // Each tick reads exactly one frame, so the counter tracks the camera sequence.
            assert_eq!(record.iteration(), stamp(&record));
            assert_eq!(record.frequency(), 100.0);
            assert!(record.state().is_empty());
            assert_eq!(record.extended().dimensions(), (4, 8, 3));
            // A reader that keeps up with the history misses nothing.
            if let Some(previous) = last {
                assert_eq!(record.iteration(), previous + 1);
            }
            last = Some(record.iteration());
        }

        bridge.stop().unwrap();
        assert!(bridge.fatal_error().is_none());
    }

    #[test]
    fn tick_count_follows_frequency() {
        let backend = SyntheticBackend::new();
        let stats = backend.stats();
        let mut bridge = Bridge::webcam(backend, config(50.0));
        let reader = bridge.reader();

        bridge.start().unwrap();
        let started = Instant::now();
        thread::sleep(Duration::from_millis(500));
        let elapsed = started.elapsed().as_secs_f64();
        bridge.stop().unwrap();

        // Ticks land at 0, T, 2T, ... so floor(elapsed / T) + 1 deadlines have passed.
        let due = (elapsed * 50.0).floor() as i64 + 1;
        let published = reader.latest().unwrap().unwrap().iteration() as i64 + 1;
        assert!(
            (published - due).abs() <= 1,
            "{published} ticks published, {due} deadlines passed in {elapsed:.3}s"
        );
        assert_eq!(stats.frames() as i64, published);
    }

    #[test]
    fn readers_never_see_torn_snapshots() {
        let mut bridge = Bridge::webcam(SyntheticBackend::new(), config(500.0));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let mut reader = bridge.reader();
                thread::spawn(move || {
                    let mut checked = 0;
                    let timeout = Duration::from_millis(500);
                    while let Some(record) = reader.wait_for_next(timeout).unwrap() {
                        let data = record.extended().get();
                        assert_eq!(data.len(), shape().byte_len());
                        // The last byte is derived from the same sequence as the stamp.
                        let sequence = u64::from_le_bytes(data[..8].try_into().unwrap());
                        let (row, col, channel) = (3usize, 7usize, 2usize);
                        let expected = (row + col + sequence as usize + channel * 85) as u8;
                        assert_eq!(data[data.len() - 1], expected);
                        assert_eq!(sequence, record.iteration());
                        checked += 1;
                    }
                    checked
                })
            })
            .collect();

        bridge.start().unwrap();
        thread::sleep(Duration::from_millis(300));
        bridge.stop().unwrap();

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }

    #[test]
    fn restart_resets_iteration_by_default() {
        let mut bridge = Bridge::webcam(SyntheticBackend::new(), config(100.0));
        let mut reader = bridge.reader();

        bridge.start().unwrap();
        reader.wait_for_next(Duration::from_secs(2)).unwrap().unwrap();
        thread::sleep(Duration::from_millis(50));
        bridge.stop().unwrap();
        assert!(!bridge.is_running());
        let before = drain(&mut reader).unwrap();
        assert!(before.iteration() >= 1);

        bridge.start().unwrap();
        let after = reader.wait_for_next(Duration::from_secs(2)).unwrap().unwrap();
        bridge.stop().unwrap();

        // The first record of the new run comes next, counted from zero again.
        assert_eq!(after.iteration(), 0);
        // The camera was reopened, so its sequence restarted together with the counter.
        assert_eq!(stamp(&after), 0);
        // A fresh timestamp baseline as well.
        assert!(after.timestamp() < Duration::from_millis(500));
    }

    #[test]
    fn restart_can_continue_counting() {
        let config = config(100.0).with_restart(RestartPolicy::Continue);
        let mut bridge = Bridge::webcam(SyntheticBackend::new(), config);
        let mut reader = bridge.reader();

        bridge.start().unwrap();
        reader.wait_for_next(Duration::from_secs(2)).unwrap().unwrap();
        thread::sleep(Duration::from_millis(50));
        bridge.stop().unwrap();
        let last = drain(&mut reader).unwrap();

        bridge.start().unwrap();
        let resumed = reader.wait_for_next(Duration::from_secs(2)).unwrap().unwrap();
        bridge.stop().unwrap();

        assert_eq!(resumed.iteration(), last.iteration() + 1);
        assert_eq!(stamp(&resumed), 0);
        assert!(resumed.timestamp() > last.timestamp());
    }

    #[test]
    fn empty_capture_ends_the_loop() {
        let backend = SyntheticBackend::new().with_script(SyntheticScript::EmptyAfter(3));
        let stats = backend.stats();
        let mut bridge = Bridge::webcam(backend, config(50.0));
        let mut reader = bridge.reader();

        bridge.start().unwrap();
        // Three good ticks, then the fourth read comes back empty.
        assert!(wait_until_stopped(&bridge, Duration::from_secs(2)));
        bridge.stop().unwrap();

        assert!(matches!(
            bridge.fatal_error().as_deref(),
            Some(BridgeError::EmptyCapture { index: 0 })
        ));
        assert_eq!(stats.released(), 1);

        let last = reader.wait_for_next(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(last.iteration(), 2);
        assert!(reader.wait_for_next(Duration::from_millis(100)).unwrap().is_none());
    }

    #[test]
    fn empty_capture_is_detected_within_a_tick() {
        let backend = SyntheticBackend::new().with_script(SyntheticScript::EmptyAfter(0));
        let mut bridge = Bridge::webcam(backend, config(10.0));

        let started = Instant::now();
        bridge.start().unwrap();
        assert!(wait_until_stopped(&bridge, Duration::from_secs(2)));
        // The failing read happens on tick 0, well before tick 1 at 100 ms.
        assert!(started.elapsed() < Duration::from_millis(100));
        bridge.stop().unwrap();
        assert!(bridge.fatal_error().is_some());
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let backend = SyntheticBackend::new().with_script(SyntheticScript::TruncatedAfter(1));
        let mut bridge = Bridge::webcam(backend, config(100.0));

        bridge.start().unwrap();
        assert!(wait_until_stopped(&bridge, Duration::from_secs(2)));
        bridge.stop().unwrap();

        assert!(matches!(
            bridge.fatal_error().as_deref(),
            Some(BridgeError::ShapeMismatch {
                expected: 96,
                actual: 72
            })
        ));
    }

    #[test]
    fn unavailable_device_fails_start() {
        let config = BridgeConfig::new(4, 100.0, "bridge_test").with_shape(shape());
        let mut bridge = Bridge::webcam(SyntheticBackend::new(), config);

        assert!(matches!(
            bridge.start(),
            Err(BridgeError::DeviceUnavailable { index: 4 })
        ));
        assert!(!bridge.is_running());
        // The handle is kept, so the failure is reported the same way again.
        assert!(matches!(
            bridge.start(),
            Err(BridgeError::DeviceUnavailable { index: 4 })
        ));
        bridge.stop().unwrap();
    }

    #[test]
    fn invalid_frequency_never_opens_the_device() {
        let backend = SyntheticBackend::new();
        let stats = backend.stats();
        let mut bridge = Bridge::webcam(backend, config(-1.0));

        assert!(matches!(
            bridge.start(),
            Err(BridgeError::InvalidFrequency(_))
        ));
        assert_eq!(stats.opened(), 0);
    }

    #[test]
    fn frequency_too_small_for_a_period_is_rejected_at_start() {
        let backend = SyntheticBackend::new();
        let stats = backend.stats();
        let mut bridge = Bridge::webcam(backend, config(1e-20));

        for _ in 0..2 {
            assert!(matches!(
                bridge.start(),
                Err(BridgeError::InvalidFrequency(f)) if f == 1e-20
            ));
        }
        assert!(!bridge.is_running());
        assert_eq!(stats.opened(), 0);
        bridge.stop().unwrap();
    }

    #[test]
    fn fatal_error_is_visible_before_stop() {
        let backend = SyntheticBackend::new().with_script(SyntheticScript::EmptyAfter(0));
        let stats = backend.stats();
        let mut bridge = Bridge::webcam(backend, config(100.0));

        bridge.start().unwrap();
        assert!(wait_until_stopped(&bridge, Duration::from_secs(2)));

        assert!(matches!(
            bridge.fatal_error().as_deref(),
            Some(BridgeError::EmptyCapture { index: 0 })
        ));
        // The loop already released the camera on its way out.
        assert_eq!(stats.released(), 1);

        bridge.stop().unwrap();
        assert!(bridge.fatal_error().is_some());
    }

    #[test]
    fn second_start_is_rejected() {
        let mut bridge = Bridge::webcam(SyntheticBackend::new(), config(100.0));
        bridge.start().unwrap();
        assert!(matches!(bridge.start(), Err(BridgeError::AlreadyRunning)));
        bridge.stop().unwrap();
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let backend = SyntheticBackend::new();
        let stats = backend.stats();
        let mut bridge = Bridge::webcam(backend, config(0.2));

        bridge.stop().unwrap();
        bridge.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        bridge.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        bridge.stop().unwrap();

        assert!(!bridge.is_running());
        assert_eq!(stats.released(), 1);
        assert!(bridge.fatal_error().is_none());
    }

    #[test]
    fn fatal_error_is_cleared_by_a_new_start() {
        let backend = SyntheticBackend::new().with_script(SyntheticScript::EmptyAfter(1));
        let mut bridge = Bridge::webcam(backend, config(10.0));

        bridge.start().unwrap();
        assert!(wait_until_stopped(&bridge, Duration::from_secs(2)));
        assert!(matches!(bridge.start(), Err(BridgeError::AlreadyRunning)));
        bridge.stop().unwrap();
        assert!(bridge.fatal_error().is_some());

        bridge.start().unwrap();
        assert!(bridge.fatal_error().is_none());
        bridge.stop().unwrap();
        if let Some(err) = bridge.take_fatal_error() {
            assert!(matches!(*err, BridgeError::EmptyCapture { .. }));
        }
        assert!(bridge.fatal_error().is_none());
    }

    #[test]
    fn dropping_a_running_bridge_releases_the_device() {
        let backend = SyntheticBackend::new();
        let stats = backend.stats();
        {
            let mut bridge = Bridge::webcam(backend, config(100.0));
            bridge.start().unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(stats.opened(), 1);
        assert_eq!(stats.released(), 1);
    }
}
