use std::{io, net::SocketAddr};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    time::{timeout, Instant},
};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::config::ClusterConfig;

use super::{
    discovery::{accept_workers, broadcast, listen},
    error::Error,
    wire::{PartialSum, RecordReader, RecordWriter, SpeedReport, WireTask},
};

/// The outcome of one distributed round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    /// Sum of every partial result that arrived.
    pub result: f64,
    /// Workers that were sent a share.
    pub workers: usize,
    /// Accept-order ids of workers whose share never came back. Their steps
    /// are missing from `result`.
    pub lost: Vec<usize>,
}

impl RoundSummary {
    pub fn is_complete(&self) -> bool {
        self.lost.is_empty()
    }
}

/// A connected worker, identified by its position in the accept order.
struct WorkerHandle {
    id: usize,
    addr: SocketAddr,
    speed: u32,
    reader: RecordReader<OwnedReadHalf>,
    writer: RecordWriter<OwnedWriteHalf>,
}

impl WorkerHandle {
    fn new(id: usize, stream: TcpStream, addr: SocketAddr) -> Self {
        let (rx, tx) = stream.into_split();
        Self {
            id,
            addr,
            speed: 0,
            reader: RecordReader::new(rx),
            writer: RecordWriter::new(tx),
        }
    }
}

/// The coordinating side of a round: advertises work, splits it by reported
/// speed and adds up what comes back.
pub struct Starter {
    config: ClusterConfig,
    listener: TcpListener,
}

impl Starter {
    /// Opens the task listener. Bind failures are setup faults.
    pub fn bind(config: ClusterConfig) -> Result<Self, Error> {
        let listener = listen(config.task_port, config.max_workers)?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Integrates `total_steps` steps of `step_width` starting at `base` over
    /// whichever workers answer the broadcast.
    pub async fn round(
        &self,
        total_steps: u64,
        base: f64,
        step_width: f64,
    ) -> Result<RoundSummary, Error> {
        let span = debug_span!("starter", total_steps);
        async move {
            let config = &self.config;
            let addr = config.broadcast_addr;
            broadcast(addr, config.discovery_port, config.magic).await?;

            let accepted = accept_workers(
                &self.listener,
                config.max_workers,
                config.accept_window,
                &config.keepalive,
            )
            .await?;
            if accepted.is_empty() {
                info!("no workers available");
                return Err(Error::NoWorkersAvailable);
            }

            let workers = accepted
                .into_iter()
                .enumerate()
                .map(|(id, (stream, addr))| {
                    WorkerHandle::new(id, stream, addr)
                })
                .collect();
            let workers = self.collect_speeds(workers).await;
            if workers.is_empty() {
                info!("no worker reported a usable speed");
                return Err(Error::NoWorkersAvailable);
            }

            let started = Instant::now();
            let workers =
                dispatch(workers, total_steps, base, step_width).await?;
            let summary = collect_results(workers).await;
            info!(
                result = summary.result,
                workers = summary.workers,
                lost = summary.lost.len(),
                elapsed = ?started.elapsed(),
                "round finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Reads every worker's speed report. Workers that hang up, stay silent
    /// for a whole accept window or report a non-positive speed are dropped.
    async fn collect_speeds(
        &self,
        mut workers: Vec<WorkerHandle>,
    ) -> Vec<WorkerHandle> {
        let window = self.config.accept_window;
        let reports = join_all(workers.iter_mut().map(|worker| async move {
            let report = worker.reader.receive::<SpeedReport>();
            match timeout(window, report).await {
                Ok(report) => report,
                Err(_) => Err(Error::ConnectionLost),
            }
        }))
        .await;

        workers
            .into_iter()
            .zip(reports)
            .filter_map(|(mut worker, report)| {
                let speed = match report {
                    Ok(SpeedReport { speed }) if speed > 0 => speed as u32,
                    Ok(SpeedReport { speed }) => {
                        let e = Error::BadSpeed {
                            worker: worker.id,
                            speed,
                        };
                        warn!("dropping worker at {}: {}", worker.addr, e);
                        return None;
                    }
                    Err(e) => {
                        warn!(
                            "dropping worker {} ({}): {}",
                            worker.id, worker.addr, e
                        );
                        return None;
                    }
                };
                debug!(
                    worker = worker.id,
                    addr = %worker.addr,
                    speed,
                    "worker speed"
                );
                worker.speed = speed;
                Some(worker)
            })
            .collect()
    }
}

/// Splits `total_steps` into one share per speed, proportional to speed.
///
/// Share `i` is `⌊T·Cᵢ/S⌋ − ⌊T·Cᵢ₋₁/S⌋` where `Cᵢ` is the running sum
/// of speeds, so every share is `⌊T·sᵢ/S⌋` or one more and the shares
/// always add up to `T`.
pub fn apportion(total_steps: u64, speeds: &[u32]) -> Vec<u64> {
    let total_speed: u128 = speeds.iter().map(|&s| s as u128).sum();
    if total_speed == 0 {
        return vec![0; speeds.len()];
    }
    let mut cumulative = 0u128;
    let mut assigned = 0u64;
    speeds
        .iter()
        .map(|&speed| {
            cumulative += speed as u128;
            let upto = (total_steps as u128 * cumulative / total_speed) as u64;
            let share = upto - assigned;
            assigned = upto;
            share
        })
        .collect()
}

/// Sends every worker its share. Any failed write fails the whole round.
async fn dispatch(
    mut workers: Vec<WorkerHandle>,
    total_steps: u64,
    base: f64,
    step_width: f64,
) -> Result<Vec<WorkerHandle>, Error> {
    let speeds: Vec<_> = workers.iter().map(|w| w.speed).collect();
    let shares = apportion(total_steps, &speeds);

    let mut start_step = 0;
    for (worker, step_count) in workers.iter_mut().zip(shares) {
        let task = WireTask {
            base,
            step_width,
            start_step,
            step_count,
        };
        debug!(
            worker = worker.id,
            start_step,
            step_count,
            from = task.lower_bound(),
            to = task.upper_bound(),
            "sending task"
        );
        worker
            .writer
            .send(&task)
            .await
            .map_err(|source| Error::Dispatch {
                worker: worker.id,
                source: Box::new(source),
            })?;
        start_step += step_count;
    }
    Ok(workers)
}

/// Waits on every worker at once and takes one result from each as soon as
/// it is ready. A worker whose connection fails is marked lost without
/// holding up the rest. Results are added in worker order so the same
/// partial sums always give the same total.
async fn collect_results(workers: Vec<WorkerHandle>) -> RoundSummary {
    let ids: Vec<_> = workers.iter().map(|w| w.id).collect();
    let mut pending: FuturesUnordered<_> = workers
        .into_iter()
        .enumerate()
        .map(|(slot, worker)| async move {
            let WorkerHandle {
                id,
                addr,
                mut reader,
                writer,
                ..
            } = worker;
            let res = reader.receive::<PartialSum>().await;
            // a half-closed socket reads as a hangup on the worker's side, so
            // both halves go only once this worker is done
            drop(writer);
            (slot, id, addr, res)
        })
        .collect();

    let mut partials = vec![None; ids.len()];
    while let Some((slot, id, addr, res)) = pending.next().await {
        match res {
            Ok(PartialSum { sum }) => {
                debug!(worker = id, %addr, sum, "received partial sum");
                partials[slot] = Some(sum);
            }
            Err(e) => warn!("lost worker {} ({}): {}", id, addr, e),
        }
    }

    let lost = ids
        .iter()
        .zip(&partials)
        .filter(|(_, partial)| partial.is_none())
        .map(|(&id, _)| id)
        .collect();
    RoundSummary {
        result: partials.iter().flatten().fold(0., |acc, sum| acc + sum),
        workers: ids.len(),
        lost,
    }
}

/// Binds, runs a single round and closes everything again.
pub async fn run_starter(
    config: ClusterConfig,
    total_steps: u64,
    base: f64,
    step_width: f64,
) -> Result<RoundSummary, Error> {
    Starter::bind(config)?
        .round(total_steps, base, step_width)
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::{super::Fault, *};

    /// Connects a peer to `listener` and wraps the accepted end as worker
    /// `id` with speed 1.
    async fn connect_worker(
        listener: &TcpListener,
        id: usize,
    ) -> (WorkerHandle, TcpStream) {
        let port = listener.local_addr().unwrap().port();
        let peer = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        let mut worker = WorkerHandle::new(id, stream, addr);
        worker.speed = 1;
        (worker, peer)
    }

    #[test]
    fn apportion_by_speed() {
        assert_eq!(apportion(100, &[1, 1]), vec![50, 50]);
        assert_eq!(apportion(100, &[1, 3]), vec![25, 75]);
        assert_eq!(apportion(10, &[1, 1, 1]), vec![3, 3, 4]);
        assert_eq!(apportion(0, &[4, 8]), vec![0, 0]);
        assert_eq!(apportion(7, &[5]), vec![7]);
        assert!(apportion(7, &[]).is_empty());
    }

    #[test]
    fn apportion_is_exact_and_fair() {
        let cases: &[(u64, &[u32])] = &[
            (1_000_003, &[1, 2, 3, 4, 5, 6, 7]),
            (17, &[13, 1, 1, 40]),
            (u64::MAX, &[3, 7, 11]),
            (2_500_000_000, &[8, 4, 16, 1]),
            (5, &[1, 1, 1, 1, 1, 1, 1, 1]),
        ];
        for &(total, speeds) in cases {
            let shares = apportion(total, speeds);
            let assigned: u128 = shares.iter().map(|&s| s as u128).sum();
            assert_eq!(assigned, total as u128);
            let sum: u128 = speeds.iter().map(|&s| s as u128).sum();
            for (&share, &speed) in shares.iter().zip(speeds) {
                let floor = (total as u128 * speed as u128 / sum) as u64;
                assert!(
                    share == floor || share == floor + 1,
                    "{} vs {}",
                    share,
                    floor
                );
            }
        }
    }

    #[tokio::test]
    async fn lost_worker_does_not_block_the_rest() {
        let listener = listen(0, 4).unwrap();
        // ids with gaps, as after workers were dropped for their speed
        let (good, good_peer) = connect_worker(&listener, 4).await;
        let (bad, bad_peer) = connect_worker(&listener, 9).await;

        let good_peer = tokio::spawn(async move {
            let (mut rx, tx) = good_peer.into_split();
            let mut writer = RecordWriter::new(tx);
            let task = RecordReader::new(&mut rx)
                .receive::<WireTask>()
                .await
                .unwrap();
            // the starter has nothing more to say, but must not hang up
            let mut byte = [0u8; 1];
            let read = rx.read(&mut byte);
            let quiet =
                timeout(Duration::from_millis(200), read).await.is_err();
            let sum = task.step_count as f64;
            writer.send(&PartialSum { sum }).await.unwrap();
            quiet
        });
        let bad_peer = tokio::spawn(async move {
            let (rx, _tx) = bad_peer.into_split();
            let mut reader = RecordReader::new(rx);
            reader.receive::<WireTask>().await.unwrap();
            // hang up without answering
        });

        let workers = dispatch(vec![good, bad], 10, 0., 1.).await.unwrap();
        let summary = collect_results(workers).await;
        assert!(good_peer.await.unwrap(), "starter closed while computing");
        bad_peer.await.unwrap();

        assert_eq!(summary.workers, 2);
        assert_eq!(summary.lost, vec![9]);
        assert_eq!(summary.result, 5.);
        assert!(!summary.is_complete());
    }

    #[tokio::test]
    async fn all_lost_sums_to_positive_zero() {
        let listener = listen(0, 4).unwrap();
        let (worker, peer) = connect_worker(&listener, 2).await;
        drop(peer);

        let summary = collect_results(vec![worker]).await;
        assert_eq!(summary.lost, vec![2]);
        assert_eq!(summary.result, 0.);
        assert!(summary.result.is_sign_positive());
    }

    #[tokio::test]
    async fn failed_send_fails_the_round() {
        let listener = listen(0, 4).unwrap();
        let (good, _good_peer) = connect_worker(&listener, 0).await;
        let (reset, reset_peer) = connect_worker(&listener, 1).await;

        // abortive close: the starter's next write hits a reset connection
        reset_peer.set_linger(Some(Duration::ZERO)).unwrap();
        drop(reset_peer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let res = dispatch(vec![good, reset], 10, 0., 1.).await;
        match res {
            Err(e @ Error::Dispatch { worker: 1, .. }) => {
                assert_eq!(e.fault(), Fault::Protocol)
            }
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("dispatch to a reset worker succeeded"),
        }
    }
}
