//! anchor-ocr - command line front end
//!
//! Runs extraction requests on single pages or batches, previews anchor
//! detection and cuts template patches out of reference images.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use anchor_ocr::config::{resolve_config, save_config};
use anchor_ocr::geometry::{ImageRelative, Rect};
use anchor_ocr::shared::{BatchJob, JobEvent};
use anchor_ocr::{extract_template, global_registry, storage, EngineConfig, ExtractionRequest, FusionOrchestrator};

/// anchor-ocr - anchor-calibrated document zone extraction
#[derive(Parser, Debug)]
#[command(name = "anchor-ocr")]
#[command(about = "Locate a document by its anchors and read its zones with hybrid OCR")]
struct Args {
    /// Engine config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract zones from one page image
    Run {
        /// Page image
        image: PathBuf,
        /// Request JSON (anchors + zones)
        #[arg(short, long)]
        request: PathBuf,
        /// Manual corrections JSON ({"zone_id": "text"})
        #[arg(long)]
        manual: Option<PathBuf>,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Extract zones from many page images, one after the other
    Batch {
        /// Page images
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(short, long)]
        request: PathBuf,
        /// Batch result JSON
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show where each anchor of a request is found on a page
    Anchors {
        image: PathBuf,
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Save a normalized rectangle of a reference image as a template patch
    ExtractTemplate {
        image: PathBuf,
        /// Rectangle as x_min,y_min,x_max,y_max (0-1)
        #[arg(long, value_delimiter = ',', required = true)]
        rect: Vec<f64>,
        /// Patch path (defaults to the templates directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write the default engine config
    InitConfig {
        /// Target path (defaults to the user config directory)
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Run {
            image,
            request,
            manual,
            output,
        } => {
            let orchestrator = orchestrator(args.config.as_deref())?;
            let request = load_request(&request)?;
            let mut result = orchestrator.run_path(&image, request)?;

            if let Some(manual) = manual {
                let content = std::fs::read_to_string(&manual)
                    .with_context(|| format!("Failed to read {}", manual.display()))?;
                let corrections: HashMap<String, String> = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", manual.display()))?;
                result.apply_manual_corrections(&corrections);
            }

            info!("Engine usage: {:?}", result.engine_stats());
            write_json(&result, output.as_deref())?;
        }
        Command::Batch {
            images,
            request,
            output,
        } => {
            let orchestrator = Arc::new(orchestrator(args.config.as_deref())?);
            let request = load_request(&request)?;

            let mut job = BatchJob::new(images, request);
            let events = job.subscribe();
            job.start(orchestrator)?;

            for event in events.iter() {
                match event {
                    JobEvent::Started { job_id, total } => {
                        eprintln!("Batch {} started: {} file(s)", job_id, total)
                    }
                    JobEvent::FileFinished {
                        path,
                        success,
                        error,
                        counts,
                        ..
                    } => eprintln!(
                        "[{}/{}] {} {}",
                        counts.processed,
                        counts.total,
                        path.display(),
                        if success {
                            "ok".to_string()
                        } else {
                            format!("FAILED ({})", error.unwrap_or_default())
                        }
                    ),
                    JobEvent::Finished(progress) => {
                        eprintln!(
                            "Batch finished: {} ok, {} failed",
                            progress.counts.succeeded, progress.counts.failed
                        );
                        break;
                    }
                }
            }

            job.wait();
            job.export_json(&output)?;
        }
        Command::Anchors { image, request } => {
            let orchestrator = orchestrator(args.config.as_deref())?;
            let request = load_request(&request)?;
            let page = image::open(&image)
                .with_context(|| format!("Failed to open {}", image.display()))?
                .to_luma8();
            let matches = orchestrator.preview_anchors(&page, request.anchors)?;
            write_json(&matches, None)?;
        }
        Command::ExtractTemplate {
            image,
            rect,
            output,
        } => {
            let [x_min, y_min, x_max, y_max] = <[f64; 4]>::try_from(rect)
                .map_err(|_| anyhow::anyhow!("--rect takes exactly four values"))?;
            let rect = Rect::<ImageRelative>::new(x_min, y_min, x_max, y_max);
            let output = match output {
                Some(output) => output,
                None => {
                    let stem = image
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "template".to_string());
                    storage::get_templates_dir()?.join(format!("{}_patch.png", stem))
                }
            };
            let saved = extract_template(&image, rect, &output)?;
            println!("{}", saved.display());
        }
        Command::InitConfig { path } => {
            let path = match path {
                Some(path) => path,
                None => storage::default_config_path()?,
            };
            save_config(&EngineConfig::default(), &path)?;
            println!("{}", path.display());
        }
    }

    Ok(())
}

fn orchestrator(config: Option<&Path>) -> Result<FusionOrchestrator> {
    let config = resolve_config(config)?;
    Ok(FusionOrchestrator::new(config, global_registry()))
}

fn load_request(path: &Path) -> Result<ExtractionRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request {}", path.display()))?;
    ExtractionRequest::from_json(&content)
        .with_context(|| format!("Failed to parse request {}", path.display()))
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let args = Args::try_parse_from([
            "anchor-ocr",
            "-v",
            "run",
            "card.png",
            "-r",
            "request.json",
            "--manual",
            "fixes.json",
        ])
        .unwrap();

        assert!(args.verbose);
        assert!(args.config.is_none());
        match args.command {
            Command::Run {
                image,
                request,
                manual,
                output,
            } => {
                assert_eq!(image, PathBuf::from("card.png"));
                assert_eq!(request, PathBuf::from("request.json"));
                assert_eq!(manual, Some(PathBuf::from("fixes.json")));
                assert!(output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_batch() {
        let args = Args::try_parse_from([
            "anchor-ocr",
            "batch",
            "a.png",
            "b.png",
            "--request",
            "request.json",
            "-o",
            "out.json",
            "--config",
            "engine.toml",
        ])
        .unwrap();

        assert_eq!(args.config, Some(PathBuf::from("engine.toml")));
        match args.command {
            Command::Batch { images, output, .. } => {
                assert_eq!(images, vec![PathBuf::from("a.png"), PathBuf::from("b.png")]);
                assert_eq!(output, PathBuf::from("out.json"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_batch_requires_images() {
        let result = Args::try_parse_from(["anchor-ocr", "batch", "-r", "request.json", "-o", "out.json"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_anchors() {
        let args = Args::try_parse_from(["anchor-ocr", "anchors", "page.jpg", "-r", "request.json"]).unwrap();
        match args.command {
            Command::Anchors { image, request } => {
                assert_eq!(image, PathBuf::from("page.jpg"));
                assert_eq!(request, PathBuf::from("request.json"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_extract_template_rect() {
        let args = Args::try_parse_from([
            "anchor-ocr",
            "extract-template",
            "reference.png",
            "--rect",
            "0.1,0.2,0.3,0.4",
        ])
        .unwrap();

        match args.command {
            Command::ExtractTemplate { image, rect, output } => {
                assert_eq!(image, PathBuf::from("reference.png"));
                assert_eq!(rect, vec![0.1, 0.2, 0.3, 0.4]);
                assert!(output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_extract_template_requires_numeric_rect() {
        assert!(Args::try_parse_from(["anchor-ocr", "extract-template", "reference.png"]).is_err());
        let result = Args::try_parse_from(["anchor-ocr", "extract-template", "reference.png", "--rect", "0.1,top,0.3,0.4"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_init_config() {
        let args = Args::try_parse_from(["anchor-ocr", "init-config"]).unwrap();
        assert!(matches!(args.command, Command::InitConfig { path: None }));

        let args = Args::try_parse_from(["anchor-ocr", "init-config", "engine.toml"]).unwrap();
        match args.command {
            Command::InitConfig { path } => assert_eq!(path, Some(PathBuf::from("engine.toml"))),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_request() {
        assert!(Args::try_parse_from(["anchor-ocr", "run", "card.png"]).is_err());
    }
}
