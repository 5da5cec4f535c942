use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as chan;
use parking_lot::Mutex;

use super::{AnalysisEvent, AnalysisJob, AnalysisProgress};
use crate::engine::{CancelToken, EngineClient, EngineFactory};
use crate::error::PoolError;
use crate::types::EvalEvent;

/// コーディネータが中断フラグを確認する間隔
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// ワーカーに渡す 1 ジョブ
struct Dispatch {
    index: usize,
    job: AnalysisJob,
    cancel: CancelToken,
}

/// ワーカーからコーディネータへの通知
enum WorkerMessage {
    Finished {
        worker: usize,
        index: usize,
        outcome: Result<EvalEvent, String>,
    },
}

/// 固定サイズの解析エンジンプール
///
/// ワーカーはそれぞれ 1 本のエンジンを持つ常駐スレッドで、ジョブはランデブーチャネルで
/// 空いたワーカーから順に受け取る（静的な分割はしない）。同時に走るバッチは 1 つだけ。
pub struct EnginePool {
    size: usize,
    job_tx: chan::Sender<Option<Dispatch>>,
    result_rx: chan::Receiver<WorkerMessage>,
    workers: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    current: Mutex<Option<CancelToken>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl EnginePool {
    /// `size` 本のエンジンを起動する。1 本でも起動できなければエラー。
    pub fn new(size: usize, factory: Arc<dyn EngineFactory>) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::EmptyPool);
        }
        let mut engines = Vec::with_capacity(size);
        for i in 0..size {
            let engine = factory
                .create(i)
                .map_err(|e| PoolError::EngineUnavailable(format!("worker {i}: {e:#}")))?;
            engines.push(engine);
        }

        let (job_tx, job_rx) = chan::bounded::<Option<Dispatch>>(0);
        let (result_tx, result_rx) = chan::bounded::<WorkerMessage>(0);
        let mut workers = Vec::with_capacity(size);
        for (i, engine) in engines.into_iter().enumerate() {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            let factory = Arc::clone(&factory);
            let handle = thread::Builder::new()
                .name(format!("analysis-worker-{i}"))
                .spawn(move || worker_main(i, engine, factory, rx, tx))
                .map_err(|e| PoolError::EngineUnavailable(format!("worker {i}: {e}")))?;
            workers.push(handle);
        }
        log::info!("analysis pool started with {size} workers");

        Ok(Self {
            size,
            job_tx,
            result_rx,
            workers,
            running: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
            coordinator: Mutex::new(None),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// バッチを開始する。結果はすべて `on_event` に流れ、最後に `Complete` が 1 回届く。
    pub fn start<F>(&self, jobs: Vec<AnalysisJob>, on_event: F) -> Result<(), PoolError>
    where
        F: FnMut(AnalysisEvent) + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PoolError::BatchRunning);
        }
        // 前のバッチのコーディネータは終了済み（`Complete` 内から呼ばれたときは自分自身）
        if let Some(prev) = self.coordinator.lock().take() {
            join_coordinator(prev);
        }

        let cancel = CancelToken::new();
        *self.current.lock() = Some(cancel.clone());

        let batch = Batch {
            jobs,
            cancel,
            job_tx: self.job_tx.clone(),
            result_rx: self.result_rx.clone(),
            running: Arc::clone(&self.running),
        };
        let handle = thread::Builder::new()
            .name("analysis-coordinator".into())
            .spawn(move || batch.run(on_event));
        match handle {
            Ok(handle) => {
                *self.coordinator.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(PoolError::Job(format!("failed to start coordinator: {e}")))
            }
        }
    }

    /// 実行中のバッチを中断する。配布済みのジョブにも中断を伝え、未配布のジョブは捨てる。
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            if !token.is_cancelled() {
                log::info!("analysis batch cancelled");
            }
            token.cancel();
        }
    }

    /// 実行中のバッチの終了を待つ
    pub fn wait(&self) {
        let handle = self.coordinator.lock().take();
        if let Some(handle) = handle {
            join_coordinator(handle);
        }
    }
}

/// コーディネータ自身のスレッドからは join しない
fn join_coordinator(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let _ = handle.join();
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
        for _ in 0..self.workers.len() {
            let _ = self.job_tx.send(None);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Batch {
    jobs: Vec<AnalysisJob>,
    cancel: CancelToken,
    job_tx: chan::Sender<Option<Dispatch>>,
    result_rx: chan::Receiver<WorkerMessage>,
    running: Arc<AtomicBool>,
}

impl Batch {
    fn run<F>(self, mut on_event: F)
    where
        F: FnMut(AnalysisEvent),
    {
        let Batch {
            jobs,
            cancel,
            job_tx,
            result_rx,
            running,
        } = self;
        let total = jobs.len();
        let mut next_index = 0usize;
        let mut in_progress: BTreeMap<usize, u32> = BTreeMap::new();
        let mut completed = 0usize;
        let mut workers_gone = false;

        loop {
            if cancel.is_cancelled() {
                next_index = total;
            }
            if next_index >= total && in_progress.is_empty() {
                break;
            }

            let message = match jobs.get(next_index) {
                Some(job) => chan::select! {
                    send(job_tx, Some(Dispatch { index: next_index, job: job.clone(), cancel: cancel.clone() })) -> res => {
                        if res.is_ok() {
                            in_progress.insert(next_index, job.ply);
                            next_index += 1;
                        } else {
                            workers_gone = true;
                        }
                        None
                    }
                    recv(result_rx) -> msg => msg.ok(),
                    default(WORKER_POLL_INTERVAL) => None,
                },
                None => chan::select! {
                    recv(result_rx) -> msg => msg.ok(),
                    default(WORKER_POLL_INTERVAL) => None,
                },
            };
            if workers_gone {
                log::error!("analysis workers are gone");
                break;
            }

            let Some(WorkerMessage::Finished {
                worker,
                index,
                outcome,
            }) = message
            else {
                continue;
            };
            in_progress.remove(&index);
            if cancel.is_cancelled() {
                log::debug!("analysis: dropping result of job {index} (worker {worker}) after cancel");
                continue;
            }
            completed += 1;
            let job = &jobs[index];
            let event = match outcome {
                Ok(event) => AnalysisEvent::Result {
                    ply: job.ply,
                    node_id: job.node_id,
                    generation: job.generation,
                    event,
                },
                Err(message) => {
                    log::warn!("analysis: job at ply {} failed on worker {worker}: {message}", job.ply);
                    AnalysisEvent::Error {
                        ply: job.ply,
                        node_id: job.node_id,
                        message,
                    }
                }
            };
            on_event(event);
            on_event(AnalysisEvent::Progress(AnalysisProgress {
                completed,
                total,
                in_progress: in_progress.values().copied().collect(),
            }));
        }

        let cancelled = cancel.is_cancelled();
        running.store(false, Ordering::SeqCst);
        on_event(AnalysisEvent::Complete {
            completed,
            total,
            cancelled,
        });
    }
}

fn worker_main(
    worker: usize,
    engine: Box<dyn EngineClient>,
    factory: Arc<dyn EngineFactory>,
    rx: chan::Receiver<Option<Dispatch>>,
    tx: chan::Sender<WorkerMessage>,
) {
    let mut engine = Some(engine);
    while let Ok(Some(dispatch)) = rx.recv() {
        let Dispatch { index, job, cancel } = dispatch;
        if engine.is_none() {
            match factory.create(worker) {
                Ok(fresh) => engine = Some(fresh),
                Err(e) => log::error!("analysis worker {worker}: failed to restart engine: {e:#}"),
            }
        }
        let searched = engine
            .as_mut()
            .map(|client| client.search(&job.request(), &cancel, &mut |_: &EvalEvent| {}));
        let outcome = match searched {
            None => Err("engine unavailable".to_string()),
            Some(Ok(result)) => result
                .last_eval
                .ok_or_else(|| format!("no evaluation for ply {}", job.ply)),
            Some(Err(e)) => {
                log::warn!("analysis worker {worker}: engine failed, recycling: {e:#}");
                engine = None;
                Err(format!("{e:#}"))
            }
        };
        if tx
            .send(WorkerMessage::Finished {
                worker,
                index,
                outcome,
            })
            .is_err()
        {
            break;
        }
    }
}
