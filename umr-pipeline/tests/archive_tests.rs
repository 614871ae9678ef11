//! Administrative operations on archived snapshots: re-analysis, deletion,
//! rotation changes

mod helpers;

use helpers::*;
use umr_common::MeterType;
use umr_pipeline::types::Rotation;
use umr_pipeline::validator::ValidationWarning;
use umr_pipeline::PipelineError;

#[tokio::test]
async fn test_reanalyze_replaces_reading_only() {
    let provider = ScriptedProvider::new(
        "primary",
        vec![
            Script::Respond(reading_json(2217, 8, 0.017, "low")),
            Script::Respond(reading_json(2271, 8, 0.017, "high")),
        ],
    );
    let (pipeline, _sink) = TestPipeline::water(&[provider.clone()]);
    let report = pipeline.orchestrator.run("water_main").await.unwrap();
    let before = pipeline
        .orchestrator
        .archive()
        .get("water_main", &report.archive_id)
        .await
        .unwrap();
    let image_before = std::fs::read(&before.archive_path).unwrap();

    let after = pipeline
        .orchestrator
        .reanalyze("water_main", &report.archive_id)
        .await
        .unwrap();

    assert_eq!(provider.calls(), 2);
    assert_eq!(after.id, before.id);
    assert_eq!(after.archive_path, before.archive_path);
    assert_eq!(after.metadata.snapshot, before.metadata.snapshot);
    assert_eq!(after.metadata.camera, before.metadata.camera);
    assert_eq!(after.metadata.meter_reading.digital_component(), 2271);
    assert!(after.metadata.reanalyzed_at.is_some());
    assert_eq!(std::fs::read(&after.archive_path).unwrap(), image_before);

    // Persisted, and the reading log is not touched
    let reloaded = pipeline
        .orchestrator
        .archive()
        .get("water_main", &report.archive_id)
        .await
        .unwrap();
    assert_eq!(reloaded.metadata, after.metadata);
    let entries = pipeline
        .orchestrator
        .reading_log()
        .entries(MeterType::Water)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reading.digital_component(), 2217);
}

#[tokio::test]
async fn test_reanalyze_revalidates_against_earlier_readings() {
    let provider = ScriptedProvider::new(
        "primary",
        vec![
            Script::Respond(reading_json(2271, 8, 0.017, "high")),
            Script::Respond(reading_json(2217, 9, 0.0, "low")),
            Script::Respond(reading_json(2271, 9, 0.0, "high")),
            Script::Respond(reading_json(2000, 0, 0.0, "high")),
        ],
    );
    let (pipeline, _sink) = TestPipeline::water(&[provider]);
    pipeline.orchestrator.run("water_main").await.unwrap();
    let misread = pipeline.orchestrator.run("water_main").await.unwrap();
    assert_eq!(misread.validation_warning, Some(ValidationWarning::Decreased));

    // Corrected reading no longer trips the check
    let corrected = pipeline
        .orchestrator
        .reanalyze("water_main", &misread.archive_id)
        .await
        .unwrap();
    assert_eq!(corrected.metadata.validation_warning, None);

    // A worse answer gets the warning back
    let worse = pipeline
        .orchestrator
        .reanalyze("water_main", &misread.archive_id)
        .await
        .unwrap();
    assert_eq!(
        worse.metadata.validation_warning.as_deref(),
        Some("reading decreased")
    );
}

#[tokio::test]
async fn test_reanalyze_uses_rotation_recorded_at_capture() {
    let provider = ScriptedProvider::responding("primary", reading_json(10, 0, 0.0, "high"));
    let mut water = meter("water_main", MeterType::Water);
    water.rotation = 90;
    let pipeline = TestPipeline::new(
        vec![water],
        &[provider.clone()],
        StaticCapture::new(&png(4, 2)),
        RecordingSink::new(),
    );
    let report = pipeline.orchestrator.run("water_main").await.unwrap();

    // Later rotation changes only affect future captures
    pipeline.orchestrator.set_rotation("water_main", 0).await.unwrap();
    pipeline
        .orchestrator
        .reanalyze("water_main", &report.archive_id)
        .await
        .unwrap();

    let images = provider.images();
    assert_eq!(images.len(), 2);
    assert_eq!(dimensions(&images[1].0), (2, 4));
}

#[tokio::test]
async fn test_failed_reanalysis_leaves_metadata_untouched() {
    let provider = ScriptedProvider::new(
        "primary",
        vec![
            Script::Respond(reading_json(300, 1, 0.5, "high")),
            Script::Fail("service down".into()),
        ],
    );
    let (pipeline, _sink) = TestPipeline::water(&[provider]);
    let report = pipeline.orchestrator.run("water_main").await.unwrap();
    let metadata_path = pipeline
        .orchestrator
        .archive()
        .meter_dir("water_main")
        .join(format!("{}.json", report.archive_id));
    let before = std::fs::read(&metadata_path).unwrap();

    let err = pipeline
        .orchestrator
        .reanalyze("water_main", &report.archive_id)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NoProviderSucceeded { .. }));
    assert_eq!(std::fs::read(&metadata_path).unwrap(), before);
}

#[tokio::test]
async fn test_reanalyze_unknown_entry_is_not_found() {
    let provider = ScriptedProvider::responding("primary", reading_json(1, 0, 0.0, "high"));
    let (pipeline, _sink) = TestPipeline::water(&[provider.clone()]);

    let err = pipeline
        .orchestrator
        .reanalyze("water_main", "water_main_20250101_000000")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::NotFound(_)));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_delete_removes_both_files() {
    let provider = ScriptedProvider::responding("primary", reading_json(1, 0, 0.0, "high"));
    let (pipeline, _sink) = TestPipeline::water(&[provider]);
    let report = pipeline.orchestrator.run("water_main").await.unwrap();
    let meter_dir = pipeline.orchestrator.archive().meter_dir("water_main");

    pipeline
        .orchestrator
        .delete("water_main", &report.archive_id)
        .await
        .unwrap();

    assert_eq!(std::fs::read_dir(&meter_dir).unwrap().count(), 0);
    let err = pipeline
        .orchestrator
        .delete("water_main", &report.archive_id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}

#[tokio::test]
async fn test_path_traversal_ids_are_rejected() {
    let provider = ScriptedProvider::responding("primary", reading_json(1, 0, 0.0, "high"));
    let (pipeline, _sink) = TestPipeline::water(&[provider]);

    let err = pipeline
        .orchestrator
        .delete("water_main", "../../logs/water_readings")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_set_rotation_validates_and_applies_to_next_capture() {
    let provider = ScriptedProvider::responding("primary", reading_json(10, 0, 0.0, "high"));
    let pipeline = TestPipeline::new(
        vec![meter("power_main", MeterType::Electric)],
        &[provider.clone()],
        StaticCapture::new(&png(6, 3)),
        RecordingSink::new(),
    );

    let err = pipeline
        .orchestrator
        .set_rotation("power_main", 45)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert_eq!(
        pipeline.orchestrator.get_rotation("power_main").await.unwrap(),
        Rotation::None
    );

    let rotation = pipeline.orchestrator.set_rotation("power_main", 270).await.unwrap();
    assert_eq!(rotation, Rotation::Cw270);

    let report = pipeline.orchestrator.run("power_main").await.unwrap();
    assert_eq!(dimensions(&provider.images()[0].0), (3, 6));
    let archived = pipeline
        .orchestrator
        .archive()
        .get("power_main", &report.archive_id)
        .await
        .unwrap();
    assert_eq!(archived.metadata.snapshot.rotation, Rotation::Cw270);
}
