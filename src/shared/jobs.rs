//! Batch Jobs
//!
//! Runs one request over many page images on a background worker thread.
//! Files are processed strictly in order. Progress lives behind a single
//! mutex; pollers get snapshots and subscribers get events, both taken under
//! that lock.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pipeline::FusionOrchestrator;
use crate::request::ExtractionRequest;
use crate::shared::messages::JobEvent;
use crate::shared::state::{FileOutcome, JobProgress};

/// A batch extraction job
pub struct BatchJob {
    id: String,
    files: Vec<PathBuf>,
    request: ExtractionRequest,
    progress: Arc<Mutex<JobProgress>>,
    subscribers: Arc<Mutex<Vec<Sender<JobEvent>>>>,
    handle: Option<JoinHandle<()>>,
}

impl BatchJob {
    /// Create a pending job
    pub fn new(files: Vec<PathBuf>, request: ExtractionRequest) -> Self {
        let id = Uuid::new_v4().to_string();
        let progress = JobProgress::new(&id, files.len());
        Self {
            id,
            files,
            request,
            progress: Arc::new(Mutex::new(progress)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            handle: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive events from now on
    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Current progress
    pub fn snapshot(&self) -> JobProgress {
        self.progress.lock().clone()
    }

    /// Start the worker thread. A job only starts once.
    pub fn start(&mut self, orchestrator: Arc<FusionOrchestrator>) -> Result<()> {
        if self.handle.is_some() {
            anyhow::bail!("Batch job {} already started", self.id);
        }

        let files = std::mem::take(&mut self.files);
        let request = self.request.clone();
        let progress = self.progress.clone();
        let subscribers = self.subscribers.clone();
        let job_id = self.id.clone();

        let handle = std::thread::Builder::new()
            .name(format!("batch-{}", &job_id[..8]))
            .spawn(move || {
                info!("Batch {} starting: {} file(s)", job_id, files.len());
                {
                    let mut p = progress.lock();
                    p.mark_started();
                    broadcast(
                        &subscribers,
                        JobEvent::Started {
                            job_id: job_id.clone(),
                            total: files.len(),
                        },
                    );
                }

                for (index, path) in files.into_iter().enumerate() {
                    progress.lock().current_file = Some(path.clone());

                    let outcome = match orchestrator.run_path(&path, request.clone()) {
                        Ok(output) => FileOutcome {
                            path: path.clone(),
                            success: true,
                            error: None,
                            output: Some(output),
                        },
                        Err(e) => {
                            warn!("Batch {}: {:?} failed: {}", job_id, path, e);
                            FileOutcome {
                                path: path.clone(),
                                success: false,
                                error: Some(e.to_string()),
                                output: None,
                            }
                        }
                    };

                    let mut p = progress.lock();
                    let (success, error) = (outcome.success, outcome.error.clone());
                    p.record(outcome);
                    broadcast(
                        &subscribers,
                        JobEvent::FileFinished {
                            index,
                            path,
                            success,
                            error,
                            counts: p.counts,
                        },
                    );
                }

                let mut p = progress.lock();
                p.mark_finished();
                info!(
                    "Batch {} finished: {} ok, {} failed",
                    job_id, p.counts.succeeded, p.counts.failed
                );
                broadcast(&subscribers, JobEvent::Finished(Box::new(p.clone())));
            })
            .context("Failed to spawn batch worker")?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Block until the worker exits and return the final progress
    pub fn wait(&mut self) -> JobProgress {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Batch {} worker panicked", self.id);
            }
        }
        self.snapshot()
    }

    /// Write the current progress (with every file result) as JSON
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write batch export {}", path.display()))?;
        info!("Batch {} exported to {:?}", self.id, path);
        Ok(())
    }
}

/// Send to every live subscriber, dropping disconnected ones
fn broadcast(subscribers: &Mutex<Vec<Sender<JobEvent>>>, event: JobEvent) {
    subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::geometry::Rect;
    use crate::request::Zone;
    use crate::shared::state::JobStatus;
    use crate::vision::codes::CodeDecoder;
    use crate::vision::engines::tests::ConstRecognizer;
    use crate::vision::engines::{EngineKind, TextRecognizer};
    use crate::vision::registry::RecognizerRegistry;
    use image::GrayImage;

    fn orchestrator() -> Arc<FusionOrchestrator> {
        let registry = Arc::new(RecognizerRegistry::new());
        registry.register(
            EngineKind::Segmenting,
            Box::new(|_| Ok(Box::new(ConstRecognizer("TEXT".to_string(), 0.9)) as Box<dyn TextRecognizer>)),
        );
        Arc::new(
            FusionOrchestrator::new(EngineConfig::default(), registry)
                .with_code_decoder(CodeDecoder::new(None, None, "*")),
        )
    }

    #[test]
    fn test_batch_processes_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        GrayImage::from_pixel(120, 80, image::Luma([255])).save(&good).unwrap();
        let missing = dir.path().join("missing.png");

        let request = ExtractionRequest {
            anchors: vec![],
            zones: vec![Zone::text("all", Rect::new(0.0, 0.0, 1.0, 1.0))],
        };
        let mut job = BatchJob::new(vec![good.clone(), missing.clone()], request);
        let events = job.subscribe();
        assert_eq!(job.snapshot().status, JobStatus::Pending);

        job.start(orchestrator()).unwrap();
        assert!(job.start(orchestrator()).is_err());
        let progress = job.wait();

        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(progress.counts.total, 2);
        assert_eq!(progress.counts.succeeded, 1);
        assert_eq!(progress.counts.failed, 1);
        assert_eq!(progress.outcomes[0].path, good);
        assert_eq!(progress.outcomes[1].path, missing);
        assert_eq!(
            progress.outcomes[0].output.as_ref().unwrap().results["all"].final_text,
            "TEXT"
        );

        let received: Vec<JobEvent> = events.try_iter().collect();
        assert_eq!(received.len(), 4);
        assert!(matches!(received[0], JobEvent::Started { total: 2, .. }));
        assert!(matches!(received[2], JobEvent::FileFinished { index: 1, success: false, .. }));
        assert!(matches!(received[3], JobEvent::Finished(_)));

        let export = dir.path().join("out").join("batch.json");
        job.export_json(&export).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&export).unwrap()).unwrap();
        assert_eq!(parsed["counts"]["succeeded"], 1);
        assert_eq!(parsed["job_id"], job.id());
    }
}
