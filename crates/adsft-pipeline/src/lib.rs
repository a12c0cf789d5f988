//! ADS Full-text Pipeline
//!
//! Decides which bibliographic records need their full text (re)extracted
//! and extracts it, as a set of queue-connected stages.
//!
//! # Stages
//!
//! - **Check**: classifies each input record against its stored extraction
//!   metadata and routes records that need work to an extractor queue
//! - **Extract**: one per extractor family (standard markup/text, PDF);
//!   extracts the text, records the extraction and publishes the result
//!
//! Failures local to one record land on the error queue; the stages keep
//! going.
//!
//! # Example
//!
//! ```no_run
//! use adsft_pipeline::broker::InMemoryBroker;
//! use adsft_pipeline::config::PipelineConfig;
//! use adsft_pipeline::input::LinkList;
//! use adsft_pipeline::runner::PipelineRunner;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load()?;
//!     let links = LinkList::from_file("links.txt")?;
//!
//!     let runner = PipelineRunner::new(InMemoryBroker::default(), config);
//!     let summary = runner
//!         .run_to_completion(&links, CancellationToken::new())
//!         .await?;
//!     println!("{} results, {} errors", summary.results, summary.errors);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod classifier;
pub mod config;
pub mod extract;
pub mod input;
pub mod runner;
pub mod stages;
pub mod store;
pub mod topology;
pub mod worker;

pub use classifier::{classify, Classifier, PathNormalizer, SourceSnapshot};
pub use config::PipelineConfig;
pub use runner::{PipelineRunner, RunSummary};
pub use store::MetadataStore;
pub use topology::TaskMaster;
pub use worker::{Worker, WorkerConfig, WorkerReport};
