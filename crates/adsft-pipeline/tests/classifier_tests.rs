//! Classifier against real source files and a real metadata store

mod common;

use adsft_common::types::{InputRecord, SourceFormat, UpdateClassification};
use adsft_pipeline::classifier::Classifier;
use chrono::{Duration, Utc};
use common::Fixture;

fn classifier(fx: &Fixture) -> Classifier {
    Classifier::new(fx.store(), fx.config.normalizer())
}

fn record(bibcode: &str, path: &str) -> InputRecord {
    InputRecord::new(bibcode, path, "MNRAS")
}

#[test]
fn test_absolute_and_relative_forms_are_the_same_source() -> anyhow::Result<()> {
    let fx = Fixture::new();
    let absolute = fx.write_source("aa/bb/doc.xml", "<article/>");
    let fresh = fx.mtime("aa/bb/doc.xml") + Duration::hours(1);

    // Stored relative, incoming absolute
    fx.store_metadata("rel", "aa/bb/doc.xml", fresh, SourceFormat::Xml);
    let incoming = absolute.to_string_lossy().into_owned();
    assert_eq!(classifier(&fx).check(&record("rel", &incoming))?, None);

    // Stored absolute, incoming relative with redundant segments
    fx.store_metadata("abs", &incoming, fresh, SourceFormat::Xml);
    assert_eq!(
        classifier(&fx).check(&record("abs", "./aa//bb/doc.xml "))?,
        None
    );
    Ok(())
}

#[test]
fn test_same_file_name_in_another_directory_differs() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write_source("a/b.pdf", "%PDF");
    fx.store_metadata("test", "b.pdf", Utc::now(), SourceFormat::Pdf);

    assert_eq!(
        classifier(&fx).check(&record("test", "a/b.pdf"))?,
        Some(UpdateClassification::DifferingFullText)
    );
    Ok(())
}

#[test]
fn test_paths_compare_case_sensitively() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write_source("Data/test.txt", "text");
    fx.store_metadata("test", "data/test.txt", Utc::now(), SourceFormat::Text);

    assert_eq!(
        classifier(&fx).check(&record("test", "Data/test.txt"))?,
        Some(UpdateClassification::DifferingFullText)
    );
    Ok(())
}

#[test]
fn test_extraction_at_modification_time_is_up_to_date() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write_source("x/test.txt", "text");
    let mtime = fx.mtime("x/test.txt");
    fx.store_metadata("test", "x/test.txt", mtime, SourceFormat::Text);

    assert_eq!(classifier(&fx).check(&record("test", "x/test.txt"))?, None);
    Ok(())
}

#[test]
fn test_unreadable_source_is_not_stale() -> anyhow::Result<()> {
    let fx = Fixture::new();
    let long_ago = Utc::now() - Duration::days(3650);
    fx.store_metadata("test", "gone/test.txt", long_ago, SourceFormat::Text);

    assert_eq!(classifier(&fx).check(&record("test", "gone/test.txt"))?, None);
    Ok(())
}

#[test]
fn test_missing_full_text_wins_over_path_and_time() -> anyhow::Result<()> {
    let fx = Fixture::new();
    fx.write_source("y/test.pdf", "%PDF");
    let stale = fx.mtime("y/test.pdf") - Duration::hours(1);
    fx.store_metadata("test", "   ", stale, SourceFormat::Pdf);

    assert_eq!(
        classifier(&fx).check(&record("test", "elsewhere/test.pdf"))?,
        Some(UpdateClassification::MissingFullText)
    );
    Ok(())
}
