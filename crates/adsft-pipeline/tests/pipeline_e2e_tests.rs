//! End-to-end pipeline tests
//!
//! Five records, one per classification outcome:
//!
//! | bibcode | source | state                          | expected              |
//! |---------|--------|--------------------------------|-----------------------|
//! | test1   | xml    | never extracted                | NOT_EXTRACTED_BEFORE  |
//! | test2   | pdf    | stored without ft_source       | MISSING_FULL_TEXT     |
//! | test3   | ocr    | stored from another path       | DIFFERING_FULL_TEXT   |
//! | test4   | pdf    | source newer than extraction   | STALE_CONTENT         |
//! | test5   | txt    | extraction newer than source   | up to date, no output |

mod common;

use adsft_common::types::{ExtractedPayload, SourceFormat, TaskPayload};
use adsft_pipeline::broker::InMemoryBroker;
use adsft_pipeline::classifier::Classifier;
use adsft_pipeline::extract::{ExtractorFamily, ExtractorRegistry};
use adsft_pipeline::input::LinkList;
use adsft_pipeline::runner::PipelineRunner;
use adsft_pipeline::stages::{CheckStage, ExtractStage};
use adsft_pipeline::topology::{
    CHECK_QUEUE, CHECK_ROUTING_KEY, ERROR_QUEUE, PDF_QUEUE, RESULT_QUEUE, STANDARD_QUEUE,
};
use adsft_pipeline::worker::{StageHandler, Worker};
use anyhow::Result;
use chrono::{Duration, Utc};
use common::Fixture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const LINKS: &str = "\
test1 tests/te/st1/test.xml MNRAS
test2 tests/te/st2/test.pdf MNRAS
test3 tests/te/st3/test.ocr MNRAS
test4 tests/te/st4/test.pdf MNRAS
test5 tests/te/st5/test.txt MNRAS
";

const JATS: &str = r#"<article>
  <front><article-meta>
    <title-group><article-title>Test title</article-title></title-group>
    <abstract><p>Test abstract.</p></abstract>
  </article-meta></front>
  <body><sec><p>Test body.</p></sec></body>
  <back><ack><p>Test acknowledgements.</p></ack></back>
</article>"#;

const EXPECTED_STANDARD: &str = concat!(
    r#"[{"bibcode":"test1","ft_source":"tests/te/st1/test.xml","provider":"MNRAS","UPDATE":"NOT_EXTRACTED_BEFORE"},"#,
    r#"{"bibcode":"test3","ft_source":"tests/te/st3/test.ocr","provider":"MNRAS","UPDATE":"DIFFERING_FULL_TEXT"}]"#
);

const EXPECTED_PDF: &str = concat!(
    r#"[{"bibcode":"test2","ft_source":"tests/te/st2/test.pdf","provider":"MNRAS","UPDATE":"MISSING_FULL_TEXT"},"#,
    r#"{"bibcode":"test4","ft_source":"tests/te/st4/test.pdf","provider":"MNRAS","UPDATE":"STALE_CONTENT"}]"#
);

fn scenario() -> Fixture {
    let fx = Fixture::new();
    fx.write_source("tests/te/st1/test.xml", JATS);
    fx.write_pdf("tests/te/st2/test.pdf", "Missing full text");
    fx.write_source("tests/te/st3/test.ocr", "Recognised   text");
    fx.write_pdf("tests/te/st4/test.pdf", "Stale content");
    fx.write_source("tests/te/st5/test.txt", "Up to date");

    fx.store_metadata("test2", "", Utc::now(), SourceFormat::Pdf);
    fx.store_metadata("test3", "/elsewhere/test.ocr", Utc::now(), SourceFormat::Ocr);

    let stale = fx.mtime("tests/te/st4/test.pdf") - Duration::hours(1);
    fx.store_metadata("test4", "tests/te/st4/test.pdf", stale, SourceFormat::Pdf);

    let fresh = fx.mtime("tests/te/st5/test.txt") + Duration::hours(1);
    fx.store_metadata("test5", "tests/te/st5/test.txt", fresh, SourceFormat::Text);

    fx
}

#[tokio::test]
async fn test_check_stage_splits_scenario_by_route() -> Result<()> {
    common::init_tracing();
    let fx = scenario();
    let broker = common::broker().await;

    let links = LinkList::parse(LINKS)?;
    common::publish(&broker, CHECK_ROUTING_KEY, &links.make_payload()?).await;

    let stage = Arc::new(CheckStage::new(Classifier::new(
        fx.store(),
        fx.config.normalizer(),
    )));
    let config = fx
        .config
        .worker_config(stage.name(), CHECK_QUEUE)
        .with_exit_when_idle(true);
    let worker = Worker::new(config, broker.clone(), stage.clone());

    let report = worker.run(CancellationToken::new()).await?;
    assert_eq!(report.processed, 1);
    assert_eq!(report.published, 2);
    assert_eq!(report.errored, 0);

    let standard = common::drain(&broker, STANDARD_QUEUE).await;
    let pdf = common::drain(&broker, PDF_QUEUE).await;
    assert_eq!(standard.len(), 1);
    assert_eq!(pdf.len(), 1);
    assert_eq!(String::from_utf8(standard[0].clone())?, EXPECTED_STANDARD);
    assert_eq!(String::from_utf8(pdf[0].clone())?, EXPECTED_PDF);

    assert_eq!(common::depth(&broker, ERROR_QUEUE).await, 0);
    assert_eq!(common::depth(&broker, CHECK_QUEUE).await, 0);
    assert_eq!(broker.unacked_count().await, 0);

    // Aggregated per-route results match what was published
    let results = stage.results();
    let expected_pdf: Vec<TaskPayload> = serde_json::from_str(EXPECTED_PDF)?;
    let expected_standard: Vec<TaskPayload> = serde_json::from_str(EXPECTED_STANDARD)?;
    assert_eq!(results["extract.pdf"], expected_pdf);
    assert_eq!(results["extract.standard"], expected_standard);

    Ok(())
}

#[tokio::test]
async fn test_full_run_extracts_every_routed_record() -> Result<()> {
    common::init_tracing();
    let fx = scenario();
    let links = LinkList::parse(LINKS)?;

    let mut config = fx.config.clone();
    config.workers_per_stage = 2;
    config.publish_batch_size = 2;
    let broker = InMemoryBroker::default();
    let runner = PipelineRunner::new(broker.clone(), config);

    let summary = runner
        .run_to_completion(&links, CancellationToken::new())
        .await?;

    assert_eq!(summary.records, 5);
    assert_eq!(summary.published, 3);
    assert_eq!(
        summary.routed,
        BTreeMap::from([
            ("extract.pdf".to_string(), 2),
            ("extract.standard".to_string(), 2),
        ])
    );
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.check.processed, 3);
    assert_eq!(summary.extract.errored, 0);

    let mut extracted: Vec<ExtractedPayload> = Vec::new();
    for body in common::drain(&broker, RESULT_QUEUE).await {
        extracted.extend(serde_json::from_slice::<Vec<ExtractedPayload>>(&body)?);
    }
    let mut bibcodes: Vec<&str> = extracted.iter().map(|p| p.task.bibcode.as_str()).collect();
    bibcodes.sort_unstable();
    assert_eq!(bibcodes, vec!["test1", "test2", "test3", "test4"]);

    let xml = extracted
        .iter()
        .find(|p| p.task.bibcode == "test1")
        .expect("test1 was extracted");
    assert_eq!(xml.full_text, "Test body.");
    assert_eq!(
        xml.meta_path,
        fx.store().meta_path("test1").display().to_string()
    );

    let ocr = extracted
        .iter()
        .find(|p| p.task.bibcode == "test3")
        .expect("test3 was extracted");
    assert_eq!(ocr.full_text, "Recognised text");

    // Metadata now reflects the extracted sources
    let store = fx.store();
    assert_eq!(store.load("test3")?.ft_source, "tests/te/st3/test.ocr");
    assert_eq!(store.load("test4")?.format, SourceFormat::Pdf);
    assert!(store.record_dir("test1").join("acknowledgements.txt").is_file());

    Ok(())
}

#[tokio::test]
async fn test_second_run_is_a_no_op() -> Result<()> {
    common::init_tracing();
    let fx = scenario();
    let links = LinkList::parse(LINKS)?;

    let first = PipelineRunner::new(InMemoryBroker::default(), fx.config.clone())
        .run_to_completion(&links, CancellationToken::new())
        .await?;
    assert_eq!(first.errors, 0);

    let second = PipelineRunner::new(InMemoryBroker::default(), fx.config.clone())
        .run_to_completion(&links, CancellationToken::new())
        .await?;

    assert!(second.routed.is_empty());
    assert_eq!(second.results, 0);
    assert_eq!(second.errors, 0);

    Ok(())
}

#[tokio::test]
async fn test_extracted_payload_preserves_check_fields() -> Result<()> {
    let fx = scenario();
    let store = fx.store();
    let normalizer = fx.config.normalizer();

    let check = CheckStage::new(Classifier::new(store.clone(), normalizer.clone()));
    let checked = check.process(&LinkList::parse(LINKS)?.make_payload()?).await?;
    let standard_body = &checked
        .emissions
        .iter()
        .find(|e| e.routing_key == "extract.standard")
        .expect("standard route emitted")
        .body;
    let tasks: Vec<TaskPayload> = serde_json::from_slice(standard_body)?;

    let extract = ExtractStage::from_registry(
        &ExtractorRegistry::with_defaults(),
        ExtractorFamily::Standard,
        store,
        normalizer,
    )?;
    let output = extract.process(standard_body).await?;
    assert!(output.failures.is_empty());
    let extracted: Vec<ExtractedPayload> = serde_json::from_slice(&output.emissions[0].body)?;
    assert_eq!(extracted.len(), tasks.len());

    for (task, payload) in tasks.iter().zip(&extracted) {
        let task_json = serde_json::to_string(task)?;
        let payload_json = serde_json::to_string(payload)?;

        // Every check-stage field survives byte-for-byte, in order
        assert!(payload_json.starts_with(&task_json[..task_json.len() - 1]));

        let task_value: serde_json::Value = serde_json::from_str(&task_json)?;
        let payload_value: serde_json::Value = serde_json::from_str(&payload_json)?;
        let task_keys: Vec<&String> = task_value.as_object().expect("object").keys().collect();
        let mut added: Vec<&String> = payload_value
            .as_object()
            .expect("object")
            .keys()
            .filter(|k| !task_keys.contains(k))
            .collect();
        added.sort();
        assert_eq!(added, vec!["full_text", "meta_path"]);
    }

    Ok(())
}
