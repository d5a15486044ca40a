//! Drives queued chunks through an inference engine, one at a time.
//!
//! Two strategies share one observable contract:
//!
//! - [`DispatchStrategy::InProcess`] runs every chunk on the calling task.
//! - [`DispatchStrategy::Delegated`] moves the engine onto a blocking worker
//!   and exchanges three messages per chunk: the dispatcher sends the chunk,
//!   the worker answers [`WorkerReply::ChunkDone`], the dispatcher asks for
//!   the result with [`WorkerRequest::GetData`] and then sends
//!   [`WorkerRequest::Cleanup`]. The next chunk is only sent after cleanup, so
//!   results reach the assembler in queue order.
//!
//! Either way the session and output tensor of a chunk are released before
//! the next chunk starts, and the first failure aborts the rest of the queue.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::assembler::OutputData;
use crate::engine::{EngineTensor, InferenceEngine, InferenceSession, OutputTensor};
use crate::error::PipelineError;
use crate::model::Model;
use crate::queue::ChunkQueue;
use crate::slicer::ChunkData;
use crate::types::{ImageData, TensorBuffer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStrategy {
    /// Engine calls run synchronously on the calling async task and block its
    /// executor thread for the length of each chunk. Use `Delegated` to keep
    /// the runtime free while chunks run.
    InProcess,
    #[default]
    Delegated,
}

/// Immutable per-run settings sent along with every chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkContext {
    pub model: Model,
    pub total_chunks: usize,
}

/// Everything a finished chunk produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub image: ImageData,
    pub tensor: TensorBuffer,
    pub dims: [usize; 4],
}

#[derive(Debug)]
pub struct ChunkRequest {
    pub chunk: ChunkData,
    pub context: Arc<ChunkContext>,
}

#[derive(Debug)]
pub enum WorkerRequest {
    Chunk(ChunkRequest),
    GetData,
    Cleanup,
}

#[derive(Debug)]
pub enum WorkerReply {
    ChunkDone { index: usize },
    Data(ChunkResult),
    GpuError { index: usize, message: String },
    Failed(PipelineError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchStats {
    pub chunks: usize,
    pub total_inference_ms: f64,
}

impl DispatchStats {
    pub fn avg_inference_ms(&self) -> f64 {
        if self.chunks == 0 {
            0.0
        } else {
            self.total_inference_ms / self.chunks as f64
        }
    }
}

/// One chunk's session and output, alive between inference and cleanup.
pub struct ChunkExecution<S: InferenceSession> {
    index: usize,
    session: S,
    output: S::Output,
    elapsed_ms: f64,
}

impl<S: InferenceSession> ChunkExecution<S> {
    /// Build the input tensor, open a session and run it.
    pub fn start<E>(engine: &mut E, chunk: ChunkData, context: &ChunkContext) -> Result<Self, PipelineError>
    where
        E: InferenceEngine<Session = S>,
    {
        let index = chunk.index;
        let model = &context.model;
        let dims = chunk.dims;
        let tensor = chunk.into_tensor(model)?;
        let input = EngineTensor::new(model.data_type, tensor, dims)
            .map_err(|e| PipelineError::from_engine(index, e))?;

        let started = Instant::now();
        let mut session = engine
            .create_session(model)
            .map_err(|e| PipelineError::from_engine(index, e))?;
        match session.run(input) {
            Ok(output) => Ok(Self {
                index,
                session,
                output,
                elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            }),
            Err(error) => {
                session.release();
                Err(PipelineError::from_engine(index, error))
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ms
    }

    /// Render the image and move the raw tensor out of the output.
    pub fn collect(&mut self) -> Result<ChunkResult, PipelineError> {
        let index = self.index;
        let image = self
            .output
            .to_image_data()
            .map_err(|e| PipelineError::from_engine(index, e))?;
        let tensor = self
            .output
            .raw_data()
            .map_err(|e| PipelineError::from_engine(index, e))?;
        Ok(ChunkResult {
            image,
            tensor,
            dims: self.output.dims(),
        })
    }

    pub fn dispose(self) {
        self.output.dispose();
        self.session.release();
    }
}

pub struct InferenceDispatcher<E: InferenceEngine> {
    engine: Option<E>,
    strategy: DispatchStrategy,
}

impl<E: InferenceEngine> InferenceDispatcher<E> {
    pub fn new(engine: E, strategy: DispatchStrategy) -> Self {
        Self {
            engine: Some(engine),
            strategy,
        }
    }

    pub fn strategy(&self) -> DispatchStrategy {
        self.strategy
    }

    /// Give the engine back, e.g. to retry on another backend.
    pub fn into_engine(self) -> Option<E> {
        self.engine
    }

    /// Run every queued chunk and feed the results into `output`.
    ///
    /// `cancel` is checked before each chunk is dispatched.
    pub async fn run(
        &mut self,
        queue: ChunkQueue,
        model: &Model,
        output: &mut OutputData,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<DispatchStats, PipelineError> {
        let context = Arc::new(ChunkContext {
            model: model.clone(),
            total_chunks: queue.total(),
        });

        debug!(
            chunks = context.total_chunks,
            strategy = ?self.strategy,
            model = %model.name,
            "Dispatching chunks"
        );

        let stats = match self.strategy {
            DispatchStrategy::InProcess => self.run_in_process(queue, &context, output, cancel)?,
            DispatchStrategy::Delegated => {
                self.run_delegated(queue, context.clone(), output, cancel)
                    .await?
            }
        };

        if stats.chunks > 0 {
            info!(
                chunks = stats.chunks,
                avg_inference_ms = format!("{:.1}", stats.avg_inference_ms()),
                total_inference_ms = format!("{:.0}", stats.total_inference_ms),
                strategy = ?self.strategy,
                "Inference summary"
            );
        }

        Ok(stats)
    }

    fn run_in_process(
        &mut self,
        mut queue: ChunkQueue,
        context: &ChunkContext,
        output: &mut OutputData,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<DispatchStats, PipelineError> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| PipelineError::Worker("inference engine was lost by a previous run".into()))?;
        let mut stats = DispatchStats::default();

        loop {
            check_cancelled(cancel, &queue)?;
            let Some(chunk) = queue.pop() else {
                break;
            };

            let mut execution = ChunkExecution::start(&mut *engine, chunk, context)?;
            let collected = execution.collect();
            let elapsed_ms = execution.elapsed_ms();
            let index = execution.index();
            execution.dispose();

            insert_result(output, collected?)?;
            record_chunk(&mut stats, index, elapsed_ms, context.total_chunks);
        }

        Ok(stats)
    }

    async fn run_delegated(
        &mut self,
        queue: ChunkQueue,
        context: Arc<ChunkContext>,
        output: &mut OutputData,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<DispatchStats, PipelineError> {
        let engine = self
            .engine
            .take()
            .ok_or_else(|| PipelineError::Worker("inference engine was lost by a previous run".into()))?;

        let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>(1);
        let (reply_tx, mut reply_rx) = mpsc::channel::<WorkerReply>(1);
        let worker = tokio::task::spawn_blocking(move || worker_loop(engine, request_rx, reply_tx));

        let result = drive_worker(&request_tx, &mut reply_rx, queue, context, output, cancel).await;

        // Closing the request channel ends the worker loop.
        drop(request_tx);
        match worker.await {
            Ok(engine) => self.engine = Some(engine),
            Err(join_error) => {
                if result.is_ok() {
                    return Err(PipelineError::Worker(format!(
                        "inference worker panicked: {join_error}"
                    )));
                }
            }
        }

        result
    }
}

async fn drive_worker(
    requests: &mpsc::Sender<WorkerRequest>,
    replies: &mut mpsc::Receiver<WorkerReply>,
    mut queue: ChunkQueue,
    context: Arc<ChunkContext>,
    output: &mut OutputData,
    cancel: Option<&watch::Receiver<bool>>,
) -> Result<DispatchStats, PipelineError> {
    let mut stats = DispatchStats::default();

    loop {
        check_cancelled(cancel, &queue)?;
        let Some(chunk) = queue.pop() else {
            break;
        };
        let index = chunk.index;
        let started = Instant::now();

        send(
            requests,
            WorkerRequest::Chunk(ChunkRequest {
                chunk,
                context: context.clone(),
            }),
        )
        .await?;

        match receive(replies).await? {
            WorkerReply::ChunkDone { index: done } if done == index => {}
            other => return Err(unexpected_reply(index, "chunk done", other)),
        }

        send(requests, WorkerRequest::GetData).await?;
        let result = match receive(replies).await? {
            WorkerReply::Data(result) => result,
            other => return Err(unexpected_reply(index, "chunk data", other)),
        };

        send(requests, WorkerRequest::Cleanup).await?;
        insert_result(output, result)?;
        record_chunk(
            &mut stats,
            index,
            started.elapsed().as_secs_f64() * 1000.0,
            context.total_chunks,
        );
    }

    Ok(stats)
}

fn worker_loop<E: InferenceEngine>(
    mut engine: E,
    mut requests: mpsc::Receiver<WorkerRequest>,
    replies: mpsc::Sender<WorkerReply>,
) -> E {
    let mut pending: Option<ChunkExecution<E::Session>> = None;

    while let Some(request) = requests.blocking_recv() {
        let reply = match request {
            WorkerRequest::Chunk(ChunkRequest { chunk, context }) => {
                if let Some(stale) = pending.take() {
                    stale.dispose();
                }
                let index = chunk.index;
                match ChunkExecution::start(&mut engine, chunk, &context) {
                    Ok(execution) => {
                        pending = Some(execution);
                        WorkerReply::ChunkDone { index }
                    }
                    Err(error) => failure_reply(error),
                }
            }
            WorkerRequest::GetData => match pending.as_mut() {
                Some(execution) => match execution.collect() {
                    Ok(result) => WorkerReply::Data(result),
                    Err(error) => failure_reply(error),
                },
                None => WorkerReply::Failed(PipelineError::Worker(
                    "get-data received before any chunk completed".into(),
                )),
            },
            WorkerRequest::Cleanup => {
                if let Some(execution) = pending.take() {
                    execution.dispose();
                }
                continue;
            }
        };

        if replies.blocking_send(reply).is_err() {
            break;
        }
    }

    if let Some(execution) = pending.take() {
        execution.dispose();
    }
    engine
}

fn failure_reply(error: PipelineError) -> WorkerReply {
    match error {
        PipelineError::Gpu { chunk, message } => WorkerReply::GpuError {
            index: chunk,
            message,
        },
        other => WorkerReply::Failed(other),
    }
}

fn unexpected_reply(index: usize, expected: &str, reply: WorkerReply) -> PipelineError {
    match reply {
        WorkerReply::GpuError { index, message } => PipelineError::Gpu {
            chunk: index,
            message,
        },
        WorkerReply::Failed(error) => error,
        other => PipelineError::Worker(format!(
            "chunk {index}: expected {expected}, got {}",
            reply_name(&other)
        )),
    }
}

fn reply_name(reply: &WorkerReply) -> &'static str {
    match reply {
        WorkerReply::ChunkDone { .. } => "chunk done",
        WorkerReply::Data(_) => "chunk data",
        WorkerReply::GpuError { .. } => "gpu error",
        WorkerReply::Failed(_) => "failure",
    }
}

async fn send(requests: &mpsc::Sender<WorkerRequest>, request: WorkerRequest) -> Result<(), PipelineError> {
    requests
        .send(request)
        .await
        .map_err(|_| PipelineError::Worker("inference worker stopped accepting requests".into()))
}

async fn receive(replies: &mut mpsc::Receiver<WorkerReply>) -> Result<WorkerReply, PipelineError> {
    replies
        .recv()
        .await
        .ok_or_else(|| PipelineError::Worker("inference worker exited without replying".into()))
}

fn check_cancelled(cancel: Option<&watch::Receiver<bool>>, queue: &ChunkQueue) -> Result<(), PipelineError> {
    let cancelled = cancel.map(|rx| *rx.borrow()).unwrap_or(false);
    if cancelled && !queue.is_empty() {
        return Err(PipelineError::Cancelled {
            completed: queue.completed(),
            total: queue.total(),
        });
    }
    Ok(())
}

fn insert_result(output: &mut OutputData, result: ChunkResult) -> Result<(), PipelineError> {
    output.insert_image_chunk(result.image)?;
    output.insert_tensor_chunk(result.tensor, result.dims)
}

fn record_chunk(stats: &mut DispatchStats, index: usize, elapsed_ms: f64, total: usize) {
    stats.chunks += 1;
    stats.total_inference_ms += elapsed_ms;
    debug!(
        chunk = index,
        total,
        elapsed_ms = format!("{elapsed_ms:.1}"),
        "Chunk done"
    );
}
