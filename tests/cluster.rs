//! Two API nodes sharing one result store and one lease backend.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anomaly_engine::job::types::{
    AnalysisConfig, DataDescription, DataFormat, Detector, Job, JobConfig, JobStatus, SchedulerConfig,
    SchedulerState,
};
use anomaly_engine::lease::{InMemoryLeaseBackend, LeaseBackend};
use anomaly_engine::results::{BucketQuery, RecordQuery, RecordSortField};
use anomaly_engine::scheduler::{DataExtractor, InMemoryExtractor, TimeField};
use anomaly_engine::snapshot::SnapshotSelector;
use anomaly_engine::store::{InMemoryResultStore, ResultStore};
use anomaly_engine::worker::{FlushParams, LocalModelFactory};
use anomaly_engine::{Engine, EngineConfig, ErrorCode};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;

struct Cluster {
    a: Engine,
    b: Engine,
}

fn config(node_id: &str) -> EngineConfig {
    EngineConfig {
        node_id: node_id.to_string(),
        ..Default::default()
    }
}

fn cluster() -> Cluster {
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
    let leases: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
    Cluster {
        a: Engine::new(config("node-a"), store.clone(), leases.clone()),
        b: Engine::new(config("node-b"), store, leases),
    }
}

fn scheduled_cluster(source: Arc<InMemoryExtractor>) -> Cluster {
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
    let leases: Arc<dyn LeaseBackend> = Arc::new(InMemoryLeaseBackend::new());
    let node = |name: &str| {
        let source: Arc<dyn DataExtractor> = source.clone();
        let factory = move |_: &Job| -> anomaly_engine::Result<Arc<dyn DataExtractor>> { Ok(source.clone()) };
        Engine::with_components(
            config(name),
            store.clone(),
            leases.clone(),
            Arc::new(LocalModelFactory),
            Arc::new(factory),
        )
    };
    Cluster {
        a: node("node-a"),
        b: node("node-b"),
    }
}

fn csv_job(id: &str) -> JobConfig {
    JobConfig {
        id: Some(id.to_string()),
        analysis_config: AnalysisConfig {
            bucket_span: 100,
            detectors: vec![Detector::new("count").with_by("host")],
            ..Default::default()
        },
        data_description: Some(DataDescription {
            field_delimiter: ',',
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mean_job(id: &str) -> JobConfig {
    JobConfig {
        id: Some(id.to_string()),
        analysis_config: AnalysisConfig {
            bucket_span: 100,
            detectors: vec![Detector::new("mean").with_field("value")],
            ..Default::default()
        },
        data_description: Some(DataDescription {
            field_delimiter: ',',
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn json_job(id: &str) -> JobConfig {
    JobConfig {
        data_description: Some(DataDescription {
            format: DataFormat::Json,
            ..Default::default()
        }),
        ..csv_job(id)
    }
}

fn series(from: i64, to: i64) -> Bytes {
    let mut body = String::from("time,value\n");
    for t in (from..to).step_by(10) {
        let value = if t == 1_550 { 400 } else { 10 + (t / 10) % 7 };
        body.push_str(&format!("{t},{value}\n"));
    }
    Bytes::from(body)
}

fn hosts(from: i64, to: i64) -> Bytes {
    let mut body = String::from("time,host\n");
    for t in (from..to).step_by(10) {
        let host = ["web-1", "web-2", "db-1"][(t / 10 % 3) as usize];
        body.push_str(&format!("{t},{host}\n"));
    }
    Bytes::from(body)
}

#[tokio::test]
async fn only_the_holder_may_touch_a_running_job() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(csv_job("farm")).await?;
    c.a.upload_bytes("farm", hosts(0, 200)).await?;
    c.a.close("farm").await?;
    c.a.upload_bytes("farm", hosts(200, 300)).await?;
    assert_eq!(c.b.get_job("farm").await?.status, JobStatus::Running);

    let upload = c.b.upload_bytes("farm", hosts(300, 400)).await.unwrap_err();
    let flush = c.b.flush("farm", FlushParams::interim()).await.unwrap_err();
    let close = c.b.close("farm").await.unwrap_err();
    let delete = c.b.delete_job("farm").await.unwrap_err();
    let revert = c
        .b
        .revert_snapshot("farm", SnapshotSelector::Time(i64::MAX), true)
        .await
        .unwrap_err();
    for err in [&upload, &flush, &close, &delete, &revert] {
        assert_eq!(err.code(), ErrorCode::NativeProcessConcurrentUse, "{err}");
        assert!(err.code().is_retryable());
    }
    let api = close.to_api_error();
    assert_eq!(api.code, ErrorCode::NativeProcessConcurrentUse);

    // The holder keeps working, and once it closes the other node may open.
    c.a.upload_bytes("farm", hosts(300, 400)).await?;
    assert!(c.a.close("farm").await?);
    c.b.upload_bytes("farm", hosts(400, 500)).await?;
    assert!(c.b.close("farm").await?);

    let job = c.a.get_job("farm").await?;
    assert_eq!(job.status, JobStatus::Closed);
    assert_eq!(job.counts.processed_record_count, 50);
    Ok(())
}

#[tokio::test]
async fn flush_on_a_job_running_nowhere_is_not_running() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(csv_job("farm")).await?;
    let err = c.b.flush("farm", FlushParams::default()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobNotRunning);
    assert!(c.b.close("farm").await?);
    let err = c.b.close("missing").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingJobError);
    Ok(())
}

#[tokio::test]
async fn interim_results_are_replaced_by_final_ones() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(csv_job("farm")).await?;
    c.a.upload_bytes("farm", hosts(0, 250)).await?;
    let ack = c.a.flush("farm", FlushParams::interim()).await?;
    assert!(ack.interim_buckets > 0);

    let finals = c.b.buckets("farm", &BucketQuery::default()).await?;
    assert!(finals.documents.iter().all(|b| !b.is_interim));
    let with_interim = BucketQuery {
        include_interim: true,
        ..Default::default()
    };
    let all = c.b.buckets("farm", &with_interim).await?;
    let interim: Vec<_> = all.documents.iter().filter(|b| b.is_interim).collect();
    assert_eq!(interim.len(), 1);
    assert_eq!(interim[0].epoch(), 200);
    assert!(all.hit_count > finals.hit_count);

    c.a.close("farm").await?;
    let after = c.b.buckets("farm", &with_interim).await?;
    assert!(after.documents.iter().all(|b| !b.is_interim));
    assert!(after.documents.iter().any(|b| b.epoch() == 200));
    Ok(())
}

#[tokio::test]
async fn every_input_record_is_accounted_for() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(csv_job("csv")).await?;
    let body = "time,host\n10,a\nnot-a-time,b\n20,\n30,c\n5,a\n40\n";
    let counts = c.a.upload_bytes("csv", Bytes::from(body)).await?;
    assert_eq!(counts.input_record_count, 6);
    assert!(counts.is_conserved(), "{counts:?}");
    assert_eq!(counts.invalid_date_count, 1);
    assert!(counts.processed_record_count >= 3);

    c.a.create_job(json_job("json")).await?;
    let body = concat!(
        "{\"time\": 10, \"host\": \"a\"}\n",
        "{\"time\": \"soon\", \"host\": \"b\"}\n",
        "{\"host\": \"c\"}\n",
        "{\"time\": 20, \"host\": [\"d\", \"e\"]}\n",
    );
    let counts = c.a.upload_bytes("json", Bytes::from(body)).await?;
    assert_eq!(counts.input_record_count, 4);
    assert!(counts.is_conserved(), "{counts:?}");
    assert_eq!(counts.processed_record_count, 2);

    c.b.create_job(csv_job("gzip")).await?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&hosts(0, 1_000))?;
    let counts = c.b.upload_bytes("gzip", Bytes::from(encoder.finish()?)).await?;
    assert_eq!(counts.input_record_count, 100);
    assert_eq!(counts.processed_record_count, 100);
    assert!(counts.is_conserved());

    // Counts accumulate across uploads and survive a close.
    c.b.upload_bytes("gzip", hosts(1_000, 1_100)).await?;
    c.b.close("gzip").await?;
    let job = c.a.get_job("gzip").await?;
    assert_eq!(job.counts.input_record_count, 110);
    assert_eq!(job.counts.processed_record_count, 110);
    Ok(())
}

#[tokio::test]
async fn revert_on_another_node_replays_identically() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(mean_job("farm")).await?;
    c.a.upload_bytes("farm", series(0, 1_000)).await?;
    c.a.close("farm").await?;
    c.a.upload_bytes("farm", series(1_000, 2_000)).await?;
    c.a.close("farm").await?;
    let everything = BucketQuery::page(0, 1_000);
    let original = c.a.buckets("farm", &everything).await?.documents;
    assert_eq!(original.len(), 20);

    let first = c.b.list_snapshots("farm").await?.remove(0);
    for _ in 0..2 {
        let reverted = c
            .b
            .revert_snapshot("farm", SnapshotSelector::Id(first.snapshot_id.clone()), true)
            .await?;
        assert_eq!(reverted.snapshot_id, first.snapshot_id);
        assert_eq!(c.a.buckets("farm", &everything).await?.hit_count, 10);
    }

    c.b.upload_bytes("farm", series(1_000, 2_000)).await?;
    c.b.close("farm").await?;
    let replayed = c.a.buckets("farm", &everything).await?.documents;
    assert_eq!(replayed.len(), original.len());
    for (x, y) in original.iter().zip(&replayed) {
        assert_eq!(x.timestamp, y.timestamp);
        assert_eq!(x.event_count, y.event_count);
        assert!((x.anomaly_score - y.anomaly_score).abs() < 1e-6);
    }
    Ok(())
}

#[tokio::test]
async fn record_pages_tile_the_result_set() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(csv_job("farm")).await?;
    c.a.upload_bytes("farm", hosts(0, 1_000)).await?;
    c.a.close("farm").await?;

    let full = c
        .b
        .records("farm", &RecordQuery::page(0, 1_000, RecordSortField::ByFieldValue, false))
        .await?;
    assert!(full.hit_count >= 10);

    let mut paged = Vec::new();
    let mut skip = 0;
    loop {
        let page = c
            .b
            .records("farm", &RecordQuery::page(skip, 7, RecordSortField::ByFieldValue, false))
            .await?;
        assert_eq!(page.hit_count, full.hit_count);
        paged.extend(page.documents);
        match page.next_page {
            Some(next) => skip = next.skip,
            None => break,
        }
    }
    assert_eq!(paged, full.documents);

    let beyond = c
        .a
        .records("farm", &RecordQuery::page(10_000, 7, RecordSortField::ByFieldValue, false))
        .await?;
    assert!(beyond.documents.is_empty());
    assert!(beyond.next_page.is_none());
    Ok(())
}

#[tokio::test]
async fn updates_apply_atomically_across_nodes() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(csv_job("farm")).await?;

    let job = c
        .b
        .update_job("farm", &json!({ "description": "north field", "resultsRetentionDays": 30 }))
        .await?;
    assert_eq!(job.description.as_deref(), Some("north field"));
    assert_eq!(c.a.get_job("farm").await?.results_retention_days, Some(30));

    let err = c
        .a
        .update_job("farm", &json!({ "description": "south field", "bogus": 1 }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidUpdateKey);
    let err = c
        .a
        .update_job("farm", &json!({ "description": "south field", "resultsRetentionDays": -1 }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidValue);
    let job = c.b.get_job("farm").await?;
    assert_eq!(job.description.as_deref(), Some("north field"));
    assert_eq!(job.results_retention_days, Some(30));

    let err = c.b.create_job(csv_job("farm")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::JobIdAlreadyExists);
    Ok(())
}

async fn wait_stopped(engine: &Engine, job_id: &str) -> anyhow::Result<()> {
    for _ in 0..200 {
        if !engine.scheduler().is_running(job_id) && engine.scheduler_status(job_id).await? == SchedulerState::Stopped {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("scheduler for {job_id} did not stop")
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_on_one_node_and_counts_each_record_once() -> anyhow::Result<()> {
    let source = Arc::new(InMemoryExtractor::new(TimeField::named("time", "epoch")));
    let docs = (0..200).map(|i| json!({ "time": 1_000 + i * 15, "host": "web-1" }));
    source.push(docs)?;
    let c = scheduled_cluster(source.clone());

    let mut scheduler = SchedulerConfig::file("/data/feed.json");
    scheduler.frequency = Some(100);
    scheduler.query_delay = Some(0);
    c.a.create_job(JobConfig {
        scheduler_config: Some(scheduler),
        ..json_job("feed")
    })
    .await?;

    assert!(c.a.start_scheduler("feed", None, Some(10_000)).await?);
    let err = c.b.start_scheduler("feed", None, Some(10_000)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NativeProcessConcurrentUse);
    let err = c.b.delete_job("feed").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::CannotDeleteJobScheduler);
    wait_stopped(&c.a, "feed").await?;

    let job = c.b.get_job("feed").await?;
    assert_eq!(job.counts.input_record_count, 200);
    assert_eq!(job.counts.processed_record_count, 200);
    assert_eq!(job.status, JobStatus::Closed);

    // The next run resumes after the newest record, even on the other node.
    source.push([json!({ "time": 5_000, "host": "web-2" })])?;
    assert!(c.b.start_scheduler("feed", None, Some(10_000)).await?);
    wait_stopped(&c.b, "feed").await?;
    let job = c.a.get_job("feed").await?;
    assert_eq!(job.counts.input_record_count, 201);
    assert_eq!(job.counts.processed_record_count, 201);

    assert!(c.a.delete_job("feed").await?);
    let err = c.b.scheduler_status("feed").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingJobError);
    Ok(())
}

#[tokio::test]
async fn five_days_of_airline_latency_flag_the_outage() -> anyhow::Result<()> {
    let c = cluster();
    c.a.create_job(JobConfig {
        id: Some("airlines".into()),
        analysis_config: AnalysisConfig {
            bucket_span: 300,
            detectors: vec![Detector::new("mean").with_field("responsetime").with_by("airline")],
            ..Default::default()
        },
        data_description: Some(DataDescription {
            field_delimiter: ',',
            ..Default::default()
        }),
        ..Default::default()
    })
    .await?;

    let mut body = String::from("time,airline,responsetime\n");
    for i in 0..1_440_i64 {
        for (n, airline) in ["aal", "jbu", "ual"].iter().enumerate() {
            let mut value = 100.0 + ((i * 7 + n as i64 * 3) % 11) as f64;
            if i == 1_000 && *airline == "aal" {
                value = 5_000.0;
            }
            body.push_str(&format!("{},{airline},{value}\n", i * 300 + 10 * n as i64));
        }
    }
    let counts = c.a.upload_bytes("airlines", Bytes::from(body)).await?;
    assert_eq!(counts.processed_record_count, 4_320);
    c.a.close("airlines").await?;

    let job = c.b.get_job("airlines").await?;
    assert_eq!(job.counts.bucket_count, 1_440);
    let page = c.b.buckets("airlines", &BucketQuery::page(0, 2_000)).await?;
    assert_eq!(page.hit_count, 1_440);
    let outage = page
        .documents
        .iter()
        .find(|b| b.epoch() == 300_000)
        .ok_or_else(|| anyhow::anyhow!("missing outage bucket"))?;
    assert!(outage.anomaly_score >= 65.0, "{}", outage.anomaly_score);

    let expanded = c.b.bucket("airlines", 300_000, true).await?;
    assert!(expanded.is_some_and(|b| b.is_consistent()));
    Ok(())
}
