//! Shared fixtures for pipeline integration tests
//!
//! Every test gets its own temporary fulltext root holding the source
//! documents, with the metadata store under `live/` inside it.

#![allow(dead_code)]

use adsft_common::types::{ExtractionMetadata, SourceFormat};
use adsft_pipeline::broker::{Channel, Connector, InMemoryBroker};
use adsft_pipeline::config::PipelineConfig;
use adsft_pipeline::store::MetadataStore;
use adsft_pipeline::topology::{TaskMaster, EXCHANGE};
use chrono::{DateTime, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,adsft_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Temporary fulltext root plus a pipeline configuration pointing at it
pub struct Fixture {
    pub dir: TempDir,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = PipelineConfig {
            fulltext_root: dir.path().to_path_buf(),
            extract_path: dir.path().join("live"),
            connect_max_attempts: 3,
            connect_backoff_ms: 1,
            connect_max_backoff_ms: 5,
            poll_interval_ms: 5,
            ..Default::default()
        };
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> MetadataStore {
        self.config.store()
    }

    /// Write a source document relative to the fulltext root
    pub fn write_source(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create source dir");
        }
        std::fs::write(&path, content).expect("Failed to write source");
        path
    }

    /// Write a one-page PDF whose page shows `text`
    pub fn write_pdf(&self, relative: &str, text: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create source dir");
        }
        build_pdf(text).save(&path).expect("Failed to save PDF");
        path
    }

    /// Modification time of a source relative to the fulltext root
    pub fn mtime(&self, relative: &str) -> DateTime<Utc> {
        std::fs::metadata(self.root().join(relative))
            .and_then(|m| m.modified())
            .expect("Failed to stat source")
            .into()
    }

    /// Record a previous extraction
    pub fn store_metadata(
        &self,
        bibcode: &str,
        ft_source: &str,
        extracted_at: DateTime<Utc>,
        format: SourceFormat,
    ) {
        let metadata = ExtractionMetadata {
            bibcode: bibcode.to_string(),
            ft_source: ft_source.to_string(),
            provider: "MNRAS".to_string(),
            extracted_at,
            format,
        };
        self.store()
            .save(bibcode, &metadata)
            .expect("Failed to store metadata");
    }
}

fn build_pdf(text: &str) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 24.into()]),
            Operation::new("Td", vec![100.into(), 600.into()]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().expect("Failed to encode content"),
    ));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => resources_id,
    });
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => vec![page_id.into()],
        "Count" => 1,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

/// Broker with the pipeline topology declared
pub async fn broker() -> InMemoryBroker {
    let broker = InMemoryBroker::default();
    let channel = broker.connect().await.expect("Failed to connect");
    TaskMaster::with_default_routes(EXCHANGE)
        .initialize(&channel)
        .await
        .expect("Failed to declare topology");
    channel.close().await.expect("Failed to close channel");
    broker
}

pub async fn publish(broker: &InMemoryBroker, routing_key: &str, body: &[u8]) {
    let channel = broker.connect().await.expect("Failed to connect");
    channel
        .publish(EXCHANGE, routing_key, body)
        .await
        .expect("Failed to publish");
    channel.close().await.expect("Failed to close channel");
}

/// Take and acknowledge every message waiting on a queue, oldest first
pub async fn drain(broker: &InMemoryBroker, queue: &str) -> Vec<Vec<u8>> {
    let channel = broker.connect().await.expect("Failed to connect");
    let mut bodies = Vec::new();
    while let Some(delivery) = channel.get(queue).await.expect("Failed to get") {
        channel
            .ack(delivery.delivery_tag)
            .await
            .expect("Failed to ack");
        bodies.push(delivery.body);
    }
    channel.close().await.expect("Failed to close channel");
    bodies
}

/// Messages waiting on a queue
pub async fn depth(broker: &InMemoryBroker, queue: &str) -> usize {
    let channel = broker.connect().await.expect("Failed to connect");
    let count = channel
        .message_count(queue)
        .await
        .expect("Failed to count messages");
    channel.close().await.expect("Failed to close channel");
    count
}
