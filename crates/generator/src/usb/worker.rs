//! Traffic worker thread
//!
//! Issues the planned transfer over and over on a dedicated OS thread until
//! the shared running flag is cleared. Transfer errors are logged and
//! counted but never end the loop.
//!
//! The worker owns the device handle for the whole session and hands it
//! back through its `JoinHandle`, so the controller can only release the
//! device after the thread is gone.

use crate::usb::transfers::{Completed, PayloadGenerator, TransferPlan, issue};
use common::{Direction, Error, LogSink, TrafficDevice, TrafficStats};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Longest uninterrupted sleep, so a cleared flag is noticed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Everything the worker thread needs, moved into it on spawn
pub struct TrafficWorker {
    pub device: Box<dyn TrafficDevice>,
    pub plan: TransferPlan,
    pub running: Arc<AtomicBool>,
    pub sink: LogSink,
    pub stats: Arc<TrafficStats>,
}

impl TrafficWorker {
    /// Run the loop and give the device back when the flag is cleared
    pub fn run(mut self) -> Box<dyn TrafficDevice> {
        run(
            self.device.as_mut(),
            &self.plan,
            &self.running,
            &self.sink,
            &self.stats,
        );
        self.device
    }
}

/// The traffic loop
///
/// Returns once `running` reads false. At most one in-flight transfer
/// (bounded by the plan's timeout) plus one sleep slice can pass between
/// clearing the flag and returning.
pub fn run(
    device: &mut dyn TrafficDevice,
    plan: &TransferPlan,
    running: &AtomicBool,
    sink: &LogSink,
    stats: &TrafficStats,
) {
    info!("Traffic loop started: {}", plan);

    let mut payload = PayloadGenerator::new(plan.payload);
    let mut buf = vec![0u8; plan.length];
    let mut read_buf = vec![0u8; plan.length];
    let mut iterations: u64 = 0;

    while running.load(Ordering::Acquire) {
        iterations += 1;

        if plan.request.direction() == Direction::Out {
            payload.fill(&mut buf);
        }

        match issue(device, &plan.request, &mut buf) {
            Ok(done) => {
                record_completed(stats, &done);
                sink.debug(format!(
                    "{} {} bytes in {:.3} ms",
                    done.direction,
                    done.bytes,
                    done.elapsed.as_secs_f64() * 1000.0
                ));

                // Skipped once Stop is requested, so Stop waits on one transfer only
                if let Some(read_back) = plan
                    .read_back
                    .as_ref()
                    .filter(|_| running.load(Ordering::Acquire))
                {
                    match issue(device, read_back, &mut read_buf) {
                        Ok(back) => {
                            stats.record_read_back(back.bytes);
                            sink.debug(format!("Read back {} bytes", back.bytes));
                        }
                        // Devices that only sink data never answer
                        Err(Error::TransferTimeout { endpoint }) => {
                            sink.debug(format!("No read-back data on {:#04x}", endpoint));
                        }
                        Err(e) => {
                            stats.record_error();
                            sink.warn(format!("Read-back failed: {}", e));
                        }
                    }
                }

                pause(running, plan.interval);
            }
            Err(e) => {
                match &e {
                    Error::TransferTimeout { .. } => stats.record_timeout(),
                    _ => stats.record_error(),
                }
                sink.warn(e.to_string());

                pause(running, plan.error_backoff);
            }
        }
    }

    let snapshot = stats.snapshot();
    info!(
        "Traffic loop stopped after {} iterations ({} packets, {} errors, {} timeouts)",
        iterations, snapshot.packets, snapshot.errors, snapshot.timeouts
    );
}

fn record_completed(stats: &TrafficStats, done: &Completed) {
    match done.direction {
        Direction::Out => stats.record_sent(done.bytes, done.elapsed),
        Direction::In => stats.record_received(done.bytes, done.elapsed),
    }
}

/// Sleep for `duration` in slices, returning early once `running` is cleared
fn pause(running: &AtomicBool, duration: Duration) {
    if duration.is_zero() {
        return;
    }

    let deadline = Instant::now() + duration;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// Spawn the worker on its own OS thread
pub fn spawn_traffic_worker(
    worker: TrafficWorker,
) -> std::io::Result<JoinHandle<Box<dyn TrafficDevice>>> {
    std::thread::Builder::new()
        .name("usb-traffic".to_string())
        .spawn(move || {
            debug!("Traffic worker thread running");
            worker.run()
        })
}
