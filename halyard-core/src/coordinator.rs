//! Director/real-server coordination over a TCP liveness channel.
//!
//! No payload is exchanged: a successful connect to the director's
//! coordination port means the director is alive. The real server probes
//! once per second and gates its worker through a hysteresis rule so that
//! taking over requires a sustained director-down signal while yielding is
//! immediate.

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::traits::WorkerControl;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probe period on the real-server side.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Bind one coordination port. A failure here is fatal at startup.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
        Error::Fatal(format!("unable to listen on coordination port {port}: {e}"))
    })
}

/// Accept liveness connections until cancelled.
///
/// Accepted connections are held open; the peer reads nothing and learns
/// liveness from the connect itself.
pub async fn serve(listener: TcpListener, token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "coordination listener up");
    }
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "real server connected");
                    tokio::spawn(hold(stream));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn hold(mut stream: TcpStream) {
    let mut buf = [0u8; 16];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// One liveness probe against the local director.
///
/// The socket is configured to close in a single round trip: linger zero
/// and no delay; keepalive stays off (the kernel default), so no probe
/// state outlives the call.
pub async fn probe(port: u16) -> bool {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => {
            let _ = stream.set_linger(Some(Duration::ZERO));
            let _ = stream.set_nodelay(true);
            true
        }
        Err(_) => false,
    }
}

/// Spawn the 1 Hz prober, delivering results on a bounded channel.
pub fn spawn_prober(port: u16, token: CancellationToken) -> mpsc::Receiver<bool> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + PROBE_INTERVAL, PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if tx.send(probe(port).await).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

/// Gate the worker on probe results with hysteresis.
///
/// A single up-probe after a takeover stops the worker immediately; a
/// takeover requires `max_tries` consecutive disagreeing down-probes.
/// `tries` starts at 1, so one spurious down-probe after boot never starts
/// the worker. Runs until cancelled, then stops the worker.
pub async fn gate<W: WorkerControl>(
    worker: &mut W,
    probes: &mut mpsc::Receiver<bool>,
    max_tries: u32,
    metrics: Arc<Metrics>,
    token: CancellationToken,
) -> Result<()> {
    let mut last_status = true;
    let mut tries: u32 = 1;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("coordination cancelled, stopping worker");
                return worker.stop().await;
            }
            Some(up) = probes.recv() => {
                metrics
                    .director_checks
                    .with_label_values(&[if up { "up" } else { "down" }])
                    .inc();
                if up && up != last_status {
                    info!("director is back, stopping worker");
                    worker.stop().await?;
                } else if up != last_status && tries >= max_tries {
                    info!("director down for {tries} probes, starting worker");
                    worker.start().await?;
                } else if up != last_status {
                    metrics.coordination_hazards.inc();
                    warn!(tries, max_tries, "director unavailable");
                    tries += 1;
                    continue;
                }
                last_status = up;
                tries = 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use std::sync::atomic::AtomicBool;

    /// Counts start transitions and stop transitions; stopping an idle
    /// worker is a no-op, as with the real worker.
    #[derive(Default)]
    struct FakeWorker {
        running: AtomicBool,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    #[async_trait]
    impl WorkerControl for &FakeWorker {
        async fn start(&mut self) -> Result<()> {
            if !self.running.swap(true, Ordering::SeqCst) {
                self.starts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if self.running.swap(false, Ordering::SeqCst) {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    async fn run_sequence(max_tries: u32, sequence: &[bool]) -> (u32, u32) {
        let worker = FakeWorker::default();
        let metrics = Arc::new(Metrics::new("test"));
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(sequence.len().max(1));
        for &probe in sequence {
            tx.send(probe).await.unwrap();
        }
        drop(tx);

        let gate_token = token.clone();
        {
            let mut handle = &worker;
            // channel closes after the sequence, so cancel once drained
            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            });
            let _ = gate(&mut handle, &mut rx, max_tries, metrics, gate_token).await;
            let _ = canceller.await;
        }
        (
            worker.starts.load(Ordering::SeqCst),
            worker.stops.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn single_down_probe_never_starts_the_worker() {
        let (starts, _) = run_sequence(3, &[false, true, true, true]).await;
        assert_eq!(starts, 0);
    }

    #[tokio::test]
    async fn sustained_outage_starts_once_and_recovery_stops_once() {
        let (starts, stops) = run_sequence(3, &[false, false, false, true]).await;
        assert_eq!(starts, 1);
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn steady_up_probes_do_nothing() {
        let (starts, stops) = run_sequence(3, &[true, true, true]).await;
        assert_eq!(starts, 0);
        assert_eq!(stops, 0);
    }

    #[tokio::test]
    async fn flapping_below_threshold_never_starts() {
        let (starts, _) = run_sequence(3, &[false, true, false, true, false, true]).await;
        assert_eq!(starts, 0);
    }

    #[tokio::test]
    async fn probe_reports_listener_liveness() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe(port).await);
        drop(listener);
        assert!(!probe(port).await);
    }
}
