//! Request/event protocol and the worker loop that drives a [`Pipeline`]
//! from a message channel.
//!
//! The caller sends [`PipelineRequest`]s and receives [`PipelineEvent`]s.
//! Every `process` request terminates in exactly one `result` or `error`
//! event for its index; `ready` is emitted once per successful `init`, even
//! when the primary session could not be created (degraded mode).

use std::thread;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigOverrides, PipelineConfig};
use crate::image::PixelImage;
use crate::pipeline::{Notice, Pipeline};
use crate::session::{bootstrap_session, InferenceSession, ModelLocator};

/// Model locations carried by an `init` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPaths {
    /// Primary super-resolution model (path or http(s) URL).
    pub realesrgan: String,
    /// Optional face-restoration model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_restore: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineRequest {
    Init {
        #[serde(default)]
        options: ConfigOverrides,
        model_paths: ModelPaths,
    },
    Process {
        index: u64,
        image: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Log {
        message: String,
    },
    Progress {
        /// `None` for instance-level progress (model loading during init).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
        percent: u8,
        status: String,
    },
    Ready,
    Result {
        index: u64,
        image: Vec<u8>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
        message: String,
    },
}

/// Creates inference sessions for the worker; injectable so the protocol can
/// be exercised without ONNX models on disk.
pub type SessionFactory =
    Box<dyn Fn(&ModelLocator, &PipelineConfig) -> Result<Box<dyn InferenceSession>> + Send>;

/// The production factory, backed by the execution-provider fallback chain.
pub fn default_session_factory() -> SessionFactory {
    Box::new(|locator, config| {
        let session = bootstrap_session(locator, config)?;
        Ok(Box::new(session) as Box<dyn InferenceSession>)
    })
}

/// Channel ends owned by the caller of [`spawn_worker`].
pub struct WorkerHandle {
    pub requests: mpsc::Sender<PipelineRequest>,
    pub events: mpsc::Receiver<PipelineEvent>,
}

impl WorkerHandle {
    pub async fn send(&self, request: PipelineRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .context("pipeline worker is gone")
    }

    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }
}

/// Spawn the pipeline worker on a dedicated thread.
///
/// Sessions and inference run blocking; keeping them off the async runtime
/// means a long tile never stalls the caller's executor.
pub fn spawn_worker(base: PipelineConfig, factory: SessionFactory) -> WorkerHandle {
    let (request_tx, request_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(32);

    thread::Builder::new()
        .name("tilesr-worker".to_string())
        .spawn(move || worker_loop(base, factory, request_rx, event_tx))
        .expect("failed to spawn pipeline worker thread");

    WorkerHandle {
        requests: request_tx,
        events: event_rx,
    }
}

fn worker_loop(
    base: PipelineConfig,
    factory: SessionFactory,
    mut requests: mpsc::Receiver<PipelineRequest>,
    events: mpsc::Sender<PipelineEvent>,
) {
    let mut pipeline: Option<Pipeline> = None;

    while let Some(request) = requests.blocking_recv() {
        let keep_going = match request {
            PipelineRequest::Init {
                options,
                model_paths,
            } => handle_init(&base, &factory, &events, &mut pipeline, options, model_paths),
            PipelineRequest::Process { index, image } => {
                handle_process(&events, &mut pipeline, index, &image)
            }
        };
        if !keep_going {
            // receiver dropped, nothing left to report to
            return;
        }
    }
    debug!("Request channel closed, pipeline worker exiting");
}

/// Returns false when the event receiver is gone.
fn handle_init(
    base: &PipelineConfig,
    factory: &SessionFactory,
    events: &mpsc::Sender<PipelineEvent>,
    pipeline: &mut Option<Pipeline>,
    options: ConfigOverrides,
    model_paths: ModelPaths,
) -> bool {
    let mut config = base.clone();
    options.apply_to(&mut config);
    if let Err(e) = config.validate() {
        error!(error = %format!("{e:#}"), "Rejected init with invalid configuration");
        return send(
            events,
            PipelineEvent::Error {
                index: None,
                message: format!("invalid configuration: {e:#}"),
            },
        );
    }

    let mut next = match Pipeline::new(config.clone()) {
        Ok(p) => p,
        Err(e) => {
            return send(
                events,
                PipelineEvent::Error {
                    index: None,
                    message: format!("{e:#}"),
                },
            );
        }
    };

    if !send(
        events,
        PipelineEvent::Progress {
            index: None,
            percent: 2,
            status: "loading super-resolution model".to_string(),
        },
    ) {
        return false;
    }
    let primary_locator = ModelLocator::parse(&model_paths.realesrgan);
    match factory(&primary_locator, &config) {
        Ok(session) => next.set_primary(Some(session)),
        Err(e) => {
            // degraded, not fatal: tiles pass through without inference
            warn!(model = %primary_locator, error = %format!("{e:#}"), "Primary session unavailable");
            if !send(
                events,
                PipelineEvent::Log {
                    message: format!("primary model unavailable, running degraded: {e:#}"),
                },
            ) {
                return false;
            }
        }
    }

    if let Some(face_path) = &model_paths.face_restore {
        if !send(
            events,
            PipelineEvent::Progress {
                index: None,
                percent: 5,
                status: "loading face restoration model".to_string(),
            },
        ) {
            return false;
        }
        let face_locator = ModelLocator::parse(face_path);
        match factory(&face_locator, &config) {
            Ok(session) => next.set_face(Some(session)),
            Err(e) => {
                warn!(model = %face_locator, error = %format!("{e:#}"), "Face session unavailable");
                if !send(
                    events,
                    PipelineEvent::Log {
                        message: format!("face restoration disabled: {e:#}"),
                    },
                ) {
                    return false;
                }
            }
        }
    }

    info!(
        scale = config.scale,
        tile_size = config.tile_size,
        overlap = config.overlap,
        degraded = next.is_degraded(),
        "Pipeline initialized"
    );
    *pipeline = Some(next);
    send(events, PipelineEvent::Ready)
}

fn handle_process(
    events: &mpsc::Sender<PipelineEvent>,
    pipeline: &mut Option<Pipeline>,
    index: u64,
    image: &[u8],
) -> bool {
    let Some(pipeline) = pipeline.as_mut() else {
        return send(
            events,
            PipelineEvent::Error {
                index: Some(index),
                message: "pipeline is not initialized".to_string(),
            },
        );
    };

    match process_one(pipeline, index, image, events) {
        Ok(Some(encoded)) => send(
            events,
            PipelineEvent::Result {
                index,
                image: encoded,
            },
        ),
        // event receiver dropped mid-image
        Ok(None) => false,
        Err(e) => {
            error!(index, error = %format!("{e:#}"), "Image processing failed");
            send(
                events,
                PipelineEvent::Error {
                    index: Some(index),
                    message: format!("{e:#}"),
                },
            )
        }
    }
}

/// Runs one image; `Ok(None)` means the event receiver disappeared.
fn process_one(
    pipeline: &mut Pipeline,
    index: u64,
    image: &[u8],
    events: &mpsc::Sender<PipelineEvent>,
) -> Result<Option<Vec<u8>>> {
    let source = PixelImage::from_encoded(image)?;

    if events
        .blocking_send(PipelineEvent::Progress {
            index: Some(index),
            percent: 2,
            status: "loading image".to_string(),
        })
        .is_err()
    {
        return Ok(None);
    }

    let mut disconnected = false;
    let result = pipeline.process(&source, &mut |notice| {
        let event = match notice {
            Notice::Progress { percent, status } => PipelineEvent::Progress {
                index: Some(index),
                percent,
                status,
            },
            Notice::Log { message } => PipelineEvent::Log { message },
        };
        if events.blocking_send(event).is_err() {
            disconnected = true;
        }
    });
    if disconnected {
        return Ok(None);
    }

    let output = result?;
    let config = pipeline.config();
    let encoded = output.to_encoded(config.format, config.quality)?;
    Ok(Some(encoded))
}

fn send(events: &mpsc::Sender<PipelineEvent>, event: PipelineEvent) -> bool {
    events.blocking_send(event).is_ok()
}
