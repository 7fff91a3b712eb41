use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::{net::TcpStream, task::spawn_blocking, time::Instant};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    cluster::{
        executor::{ExecError, Executor},
        topology::ProcessorSet,
    },
    config::ClusterConfig,
};

use super::{
    cancel::{cancel_pair, CancelToken, Watchdog},
    discovery::{connect, DiscoveryListener},
    error::Error,
    wire::{PartialSum, RecordReader, RecordWriter, SpeedReport, WireTask},
};

/// A machine offering its cores to whichever starter broadcasts next.
pub struct Worker {
    config: ClusterConfig,
    speed: i32,
    set: ProcessorSet,
    threads: usize,
}

impl Worker {
    /// `speed` is what gets reported to the starter; `threads` compute
    /// threads are spread over `set` for every share.
    pub fn new(
        config: ClusterConfig,
        speed: i32,
        set: ProcessorSet,
        threads: usize,
    ) -> Self {
        Self {
            config,
            speed,
            set,
            threads,
        }
    }

    /// Binds the discovery socket for [`Worker::run_round`].
    pub async fn listen(&self) -> Result<DiscoveryListener, Error> {
        let ClusterConfig {
            discovery_port,
            magic,
            ..
        } = self.config;
        DiscoveryListener::bind(discovery_port, magic).await
    }

    /// Serves rounds until a setup fault. Every other failure abandons the
    /// round in progress and goes back to waiting for a broadcast.
    pub async fn run(&self) -> Result<(), Error> {
        let discovery = self.listen().await?;
        info!(
            speed = self.speed,
            threads = self.threads,
            set = %self.set,
            "worker ready"
        );
        let mut round = 0u64;
        loop {
            round += 1;
            match self
                .run_round(&discovery)
                .instrument(debug_span!("round", round))
                .await
            {
                Ok(sum) => info!(round, sum, "round finished"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(round, fault = ?e.fault(), "round failed: {}", e)
                }
            }
        }
    }

    /// Waits for one broadcast, then computes and returns the share handed
    /// out over the resulting connection.
    pub async fn run_round(
        &self,
        discovery: &DiscoveryListener,
    ) -> Result<f64, Error> {
        let from = discovery.wait_for_starter().await?;
        let stream = connect(
            from,
            self.config.task_port,
            self.config.connect_timeout,
            &self.config.keepalive,
        )
        .await?;
        self.serve(stream).await
    }

    /// One handshake, one share, one reply. The connection is closed when
    /// this returns, whatever the outcome.
    pub async fn serve(&self, stream: TcpStream) -> Result<f64, Error> {
        let (rx, tx) = stream.into_split();
        let mut reader = RecordReader::new(rx);
        let mut writer = RecordWriter::new(tx);

        let (canceller, token) = cancel_pair();
        let handshake = token.with_deadline(
            self.config
                .task_timeout
                .map(|timeout| Instant::now() + timeout),
        );
        handshake
            .guard(writer.send(&SpeedReport { speed: self.speed }))
            .await?;
        let task: WireTask = handshake.guard(reader.receive()).await?;
        debug!(
            start_step = task.start_step,
            step_count = task.step_count,
            from = task.lower_bound(),
            to = task.upper_bound(),
            "received task"
        );

        // the starter stays silent until it has our result
        let watchdog = Watchdog::arm(reader.into_inner(), canceller);
        let sum = self.compute(task, &token).await?;
        watchdog.disarm();

        token.guard(writer.send(&PartialSum { sum })).await?;
        debug!(sum, "sent partial sum");
        Ok(sum)
    }

    /// Runs the share on the local cores. If `token` fires first, the compute
    /// threads are told to stop and are waited for before returning.
    async fn compute(
        &self,
        task: WireTask,
        token: &CancelToken,
    ) -> Result<f64, Error> {
        let abort = Arc::new(AtomicBool::new(false));
        let executor =
            Executor::with_abort(self.config.integrand, abort.clone());
        let set = self.set.clone();
        let threads = self.threads;
        let first_cpu = set.iter().next().unwrap_or(0);

        let mut handle = spawn_blocking(move || {
            executor.run_local_scalable(
                threads,
                &set,
                task.step_count,
                task.lower_bound(),
                task.step_width,
            )
        });

        tokio::select! {
            res = &mut handle => match res {
                Ok(sum) => Ok(sum?),
                Err(_) => Err(ExecError::Panicked(first_cpu).into()),
            },
            reason = token.cancelled() => {
                debug!(%reason, "abandoning share");
                abort.store(true, Ordering::Relaxed);
                let _ = handle.await;
                Err(Error::Cancelled(reason))
            }
        }
    }
}

/// Builds a [`Worker`] and serves rounds until a setup fault.
pub async fn run_worker(
    config: ClusterConfig,
    speed: i32,
    set: ProcessorSet,
    threads: usize,
) -> Result<(), Error> {
    let span = debug_span!("worker", speed, threads);
    Worker::new(config, speed, set, threads)
        .run()
        .instrument(span)
        .await
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::net::TcpListener;

    use crate::cluster::{
        affinity::process_affinity, executor::Integrand,
        net::cancel::CancelReason,
    };

    use super::*;

    fn one_cpu() -> ProcessorSet {
        let cpu = process_affinity()
            .ok()
            .and_then(|set| set.iter().next())
            .unwrap_or(0);
        [cpu].into_iter().collect()
    }

    fn worker(config: ClusterConfig) -> Worker {
        Worker::new(config, 3, one_cpu(), 1)
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (ours, theirs) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        (ours.unwrap(), theirs.unwrap().0)
    }

    #[tokio::test]
    async fn serves_one_share() {
        let (ours, theirs) = pair().await;
        let worker = worker(
            ClusterConfig::builder()
                .integrand(Integrand::Identity)
                .build(),
        );
        let starter = tokio::spawn(async move {
            let (rx, tx) = theirs.into_split();
            let mut reader = RecordReader::new(rx);
            let mut writer = RecordWriter::new(tx);
            let speed = reader.receive::<SpeedReport>().await.unwrap();
            // steps 100..200 of width 0.01 cover [1, 2)
            writer
                .send(&WireTask {
                    base: 0.,
                    step_width: 0.01,
                    start_step: 100,
                    step_count: 100,
                })
                .await
                .unwrap();
            let sum = reader.receive::<PartialSum>().await.unwrap();
            (speed.speed, sum.sum)
        });

        let sum = worker.serve(ours).await.unwrap();
        let (speed, received) = starter.await.unwrap();
        assert_eq!(speed, 3);
        assert_eq!(received, sum);
        // left sum of x over [1, 2) with h = 0.01
        assert!((sum - 1.495).abs() < 1e-9, "{}", sum);
    }

    #[tokio::test]
    async fn starter_hangup_cancels_compute() {
        let (ours, theirs) = pair().await;
        let worker = worker(ClusterConfig::default());
        tokio::spawn(async move {
            let (rx, tx) = theirs.into_split();
            let mut reader = RecordReader::new(rx);
            let mut writer = RecordWriter::new(tx);
            reader.receive::<SpeedReport>().await.unwrap();
            // far more work than the test could ever finish
            writer
                .send(&WireTask {
                    base: 0.,
                    step_width: 1e-12,
                    start_step: 0,
                    step_count: u64::MAX / 2,
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let serving = worker.serve(ours);
        let res = tokio::time::timeout(Duration::from_secs(30), serving)
            .await
            .unwrap();
        assert!(
            matches!(res, Err(Error::Cancelled(CancelReason::PeerClosed))),
            "{:?}",
            res
        );
    }

    #[tokio::test]
    async fn silent_starter_hits_task_timeout() {
        let (ours, _theirs) = pair().await;
        let worker = worker(
            ClusterConfig::builder()
                .task_timeout(Duration::from_millis(100))
                .build(),
        );
        let res = worker.serve(ours).await;
        assert!(
            matches!(res, Err(Error::Cancelled(CancelReason::DeadlineElapsed))),
            "{:?}",
            res
        );
        assert!(!res.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn hangup_before_task_is_connection_lost() {
        let (ours, theirs) = pair().await;
        drop(theirs);
        let res = worker(ClusterConfig::default()).serve(ours).await;
        assert!(res.is_err());
        assert!(!res.unwrap_err().is_fatal());
    }
}
