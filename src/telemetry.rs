// Background telemetry - speed and diagnostic polling
//
// Two independent loops on the tokio runtime, one per quantity. Each tick
// takes the shared link lock on a blocking thread, so polls never interleave
// with command dispatch. A tick that overruns the period makes the next one
// be skipped, never queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::error_sink::ErrorSink;
use crate::link::{DriveLink, LinkHandle, LinkResult};
use crate::messages::{DiagnosticSample, SpeedSample};

/// Shortest accepted poll period
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

type Callback<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Callback registry for one sample type
pub struct Subscribers<S> {
    callbacks: Arc<RwLock<Vec<Callback<S>>>>,
}

impl<S> Clone for Subscribers<S> {
    fn clone(&self) -> Self {
        Self {
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<S> Default for Subscribers<S> {
    fn default() -> Self {
        Self {
            callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl<S> Subscribers<S> {
    pub fn add(&self, callback: impl Fn(&S) + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    fn publish(&self, sample: &S) {
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(sample);
        }
    }
}

struct Running {
    active: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    period: Duration,
}

/// Polls speed and diagnostics while started
pub struct TelemetryPoller {
    link: LinkHandle,
    errors: ErrorSink,
    runtime: Handle,
    speed: Subscribers<SpeedSample>,
    diagnostic: Subscribers<DiagnosticSample>,
    running: Option<Running>,
}

impl TelemetryPoller {
    pub fn new(link: LinkHandle, errors: ErrorSink, runtime: Handle) -> Self {
        Self {
            link,
            errors,
            runtime,
            speed: Subscribers::default(),
            diagnostic: Subscribers::default(),
            running: None,
        }
    }

    pub fn subscribe_speed(&self, callback: impl Fn(&SpeedSample) + Send + Sync + 'static) {
        self.speed.add(callback);
    }

    pub fn subscribe_diagnostic(
        &self,
        callback: impl Fn(&DiagnosticSample) + Send + Sync + 'static,
    ) {
        self.diagnostic.add(callback);
    }

    /// Start both loops. The first poll happens right away, then every
    /// `period`. Starting a running poller restarts it with the new period.
    pub fn start(&mut self, period: Duration) {
        self.stop();

        let period = if period < MIN_POLL_PERIOD {
            warn!("Poll period {:?} too short, using {:?}", period, MIN_POLL_PERIOD);
            MIN_POLL_PERIOD
        } else {
            period
        };

        let active = Arc::new(AtomicBool::new(true));
        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            self.runtime.spawn(poll_loop(
                "speed",
                period,
                active.clone(),
                rx.clone(),
                self.link.clone(),
                self.errors.clone(),
                read_speed,
                self.speed.clone(),
            )),
            self.runtime.spawn(poll_loop(
                "diagnostic",
                period,
                active.clone(),
                rx,
                self.link.clone(),
                self.errors.clone(),
                read_diagnostic,
                self.diagnostic.clone(),
            )),
        ];

        info!("Telemetry started, period {:?}", period);
        self.running = Some(Running {
            active,
            shutdown,
            tasks,
            period,
        });
    }

    /// Stop both loops. No tick starts after this returns; a poll already
    /// in flight finishes and delivers its result.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            // Checked under the link lock, so no poll reaches the link after this
            running.active.store(false, Ordering::SeqCst);
            // Receivers only disappear once the loops have exited
            let _ = running.shutdown.send(true);
            info!("Telemetry stopped");
            // Loops exit on their own; dropping the handles detaches them
            drop(running.tasks);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.running.as_ref().map(|r| r.period)
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_speed(link: &mut dyn DriveLink) -> LinkResult<SpeedSample> {
    Ok(SpeedSample {
        speed: link.speed()?,
    })
}

fn read_diagnostic(link: &mut dyn DriveLink) -> LinkResult<DiagnosticSample> {
    let buf = link.diagnostic_message()?;
    Ok(DiagnosticSample::from_buffer(&buf))
}

async fn poll_loop<S: Send + 'static>(
    name: &'static str,
    period: Duration,
    active: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
    link: LinkHandle,
    errors: ErrorSink,
    read: fn(&mut dyn DriveLink) -> LinkResult<S>,
    subscribers: Subscribers<S>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("{} poll loop running", name);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        let started = Instant::now();
        let link = link.clone();
        let active = active.clone();
        let polled = tokio::task::spawn_blocking(move || {
            link.with(|l| active.load(Ordering::SeqCst).then(|| read(l)))
        })
        .await;

        // Skip still fires an overdue tick at once; wait a full period instead
        let elapsed = started.elapsed();
        if elapsed >= period {
            debug!("{} poll took {:?}, over the {:?} period", name, elapsed, period);
            tick.reset();
        }

        match polled {
            Ok(Some(Ok(sample))) => subscribers.publish(&sample),
            // Failures go to the error log, never to the sample callbacks
            Ok(Some(Err(record))) => errors.push(record),
            // Stopped while waiting for the link
            Ok(None) => break,
            Err(e) => warn!("{} poll task failed: {}", name, e),
        }
    }

    debug!("{} poll loop exited", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use crate::config::DIAGNOSTIC_MSG_LEN;
    use crate::error::ErrorBlock;
    use crate::link::{LinkCall, SimulatedDrive};

    const PERIOD: Duration = Duration::from_millis(20);

    fn opened_sim() -> SimulatedDrive {
        let mut sim = SimulatedDrive::new().with_diagnostic("A0013 Ready for power on");
        sim.open("COM3", 19200).unwrap();
        sim.speed_mode_write(1500.0, 200.0).unwrap();
        sim
    }

    fn poller(sim: &SimulatedDrive, errors: &ErrorSink) -> TelemetryPoller {
        TelemetryPoller::new(
            LinkHandle::new(sim.clone()),
            errors.clone(),
            Handle::current(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_samples_are_published() {
        let sim = opened_sim();
        let errors = ErrorSink::default();
        let mut poller = poller(&sim, &errors);

        let speeds = Arc::new(Mutex::new(Vec::new()));
        let diags = Arc::new(Mutex::new(Vec::new()));
        let s = speeds.clone();
        poller.subscribe_speed(move |sample| s.lock().push(sample.speed));
        let d = diags.clone();
        poller.subscribe_diagnostic(move |sample| d.lock().push(sample.message.clone()));

        poller.start(PERIOD);
        tokio::time::sleep(PERIOD * 5).await;
        poller.stop();

        assert!(!speeds.lock().is_empty());
        assert!(speeds.lock().iter().all(|&v| v == 1500.0));
        assert_eq!(
            diags.lock().first().map(String::as_str),
            Some("A0013 Ready for power on")
        );
        assert!(errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failing_link_routes_every_tick_to_errors() {
        let sim = opened_sim();
        sim.fail_all();
        let errors = ErrorSink::default();
        let mut poller = poller(&sim, &errors);

        let successes = Arc::new(AtomicUsize::new(0));
        let s = successes.clone();
        poller.subscribe_speed(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let d = successes.clone();
        poller.subscribe_diagnostic(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        poller.start(PERIOD);
        tokio::time::sleep(PERIOD * 5).await;
        poller.stop();
        tokio::time::sleep(PERIOD * 2).await;

        assert_eq!(successes.load(Ordering::SeqCst), 0);
        let polls = sim.calls().iter().filter(|c| c.is_telemetry()).count();
        assert!(polls >= 2);
        // One error per failed poll
        assert_eq!(errors.len(), polls);
        assert!(
            errors
                .records()
                .iter()
                .all(|r| r.code == ErrorBlock::Status.code())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_poll_is_immediate() {
        let sim = opened_sim();
        let errors = ErrorSink::default();
        let mut poller = poller(&sim, &errors);

        poller.start(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(100)).await;
        poller.stop();

        let calls = sim.calls();
        assert_eq!(calls.iter().filter(|c| **c == LinkCall::Speed).count(), 1);
        assert_eq!(
            calls
                .iter()
                .filter(|c| **c == LinkCall::DiagnosticMessage)
                .count(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_halts_polling() {
        let sim = opened_sim();
        let errors = ErrorSink::default();
        let mut poller = poller(&sim, &errors);

        poller.start(PERIOD);
        assert!(poller.is_running());
        assert_eq!(poller.period(), Some(PERIOD));
        tokio::time::sleep(PERIOD * 3).await;
        poller.stop();
        assert!(!poller.is_running());

        // Let an in-flight poll drain, then nothing more arrives
        tokio::time::sleep(PERIOD).await;
        let settled = sim.calls().len();
        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(sim.calls().len(), settled);
    }

    /// Drive whose speed read takes `delay`; records when each read began
    struct SlowSpeedLink {
        delay: Duration,
        starts: Arc<Mutex<Vec<std::time::Instant>>>,
    }

    impl DriveLink for SlowSpeedLink {
        fn open(&mut self, _: &str, _: u32) -> LinkResult<()> {
            Ok(())
        }
        fn close(&mut self) -> LinkResult<()> {
            Ok(())
        }
        fn speed_mode_activate(&mut self) -> LinkResult<()> {
            Ok(())
        }
        fn speed_mode_init(&mut self, _: f64, _: f64) -> LinkResult<()> {
            Ok(())
        }
        fn speed_mode_write(&mut self, _: f64, _: f64) -> LinkResult<()> {
            Ok(())
        }
        fn sequencer_activate(&mut self) -> LinkResult<()> {
            Ok(())
        }
        fn sequencer_init(&mut self, _: f64, _: f64) -> LinkResult<()> {
            Ok(())
        }
        fn sequencer_write(
            &mut self,
            _: &[f64],
            _: &[f64],
            _: &[f64],
            _: &[u32],
            _: u16,
        ) -> LinkResult<()> {
            Ok(())
        }
        fn sequencer_soft_trigger(&mut self) -> LinkResult<()> {
            Ok(())
        }
        fn drive_mode(&mut self) -> LinkResult<u32> {
            Ok(0)
        }
        fn operating_state(&mut self) -> LinkResult<u8> {
            Ok(0)
        }
        fn speed(&mut self) -> LinkResult<f64> {
            self.starts.lock().push(std::time::Instant::now());
            std::thread::sleep(self.delay);
            Ok(0.0)
        }
        fn diagnostic_message(&mut self) -> LinkResult<[u8; DIAGNOSTIC_MSG_LEN]> {
            Ok([0; DIAGNOSTIC_MSG_LEN])
        }
        fn diagnostic_number(&mut self) -> LinkResult<u32> {
            Ok(0)
        }
        fn clear_error(&mut self) -> LinkResult<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overrunning_poll_waits_a_full_period() {
        let delay = Duration::from_millis(50);
        let starts = Arc::new(Mutex::new(Vec::new()));
        let link = LinkHandle::new(SlowSpeedLink {
            delay,
            starts: starts.clone(),
        });
        let mut poller = TelemetryPoller::new(link, ErrorSink::default(), Handle::current());

        poller.start(PERIOD);
        tokio::time::sleep(Duration::from_millis(400)).await;
        poller.stop();

        let starts = starts.lock().clone();
        assert!(starts.len() >= 3);
        // Each poll ends at least `delay` after it began; the next waits a period
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= delay + PERIOD, "polls {:?} apart", gap);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_period_is_clamped() {
        let sim = opened_sim();
        let errors = ErrorSink::default();
        let mut poller = poller(&sim, &errors);

        poller.start(Duration::ZERO);
        assert_eq!(poller.period(), Some(MIN_POLL_PERIOD));
        poller.stop();
    }

    #[test]
    fn test_subscribers_share_registry() {
        let subs: Subscribers<SpeedSample> = Subscribers::default();
        let clone = subs.clone();
        clone.add(|_| {});
        assert_eq!(subs.len(), 1);
        assert!(!subs.is_empty());
    }
}
