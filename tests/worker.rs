use std::time::Instant;

use anyhow::{Result, bail};
use chrono::{SecondsFormat, TimeDelta, TimeZone, Utc};
use trackpipe::pipeline::PipelineFailure;
use trackpipe::worker::{ProcessEvent, ProcessHandle, Processor};
use trackpipe::{ErrorKind, ProcessState, SimplificationLevel, TrackPipeError, TrackRequest};

/// A straight track north along a meridian from the equator, with points
/// 100 m and 30 s apart.
fn gpx(points: usize) -> Vec<u8> {
    let lat_step = 0.1 / (6371.0 * std::f64::consts::PI / 180.0);
    let mut doc = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
<trk><name>Ridge</name><trkseg>
"#,
    );
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    for i in 0..points {
        let time = start + TimeDelta::seconds(30 * i as i64);
        doc.push_str(&format!(
            "<trkpt lat=\"{}\" lon=\"-122.0\"><ele>{}</ele><time>{}</time></trkpt>\n",
            lat_step * i as f64,
            100 + i % 7,
            time.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }
    doc.push_str("</trkseg></trk></gpx>\n");
    doc.into_bytes()
}

async fn drain(handle: &mut ProcessHandle) -> Vec<ProcessEvent> {
    let mut events = vec![];
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_end_in_result() -> Result<()> {
    let processor = Processor::default();
    let mut handle = processor.submit(TrackRequest::new("ridge", "ridge.gpx", gpx(100)))?;
    assert_eq!(handle.correlation_id(), "ridge");

    let events = drain(&mut handle).await;
    let Some(ProcessEvent::Finished(Ok(output))) = events.last() else {
        bail!("expected a successful final event, got {:?}", events.last());
    };
    assert_eq!(output.correlation_id, "ridge");
    assert_eq!(output.stats.point_count, 100);
    approx::assert_relative_eq!(output.stats.total_distance.0, 9.9, epsilon = 1e-6);

    let states: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::State(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ProcessState::Validating,
            ProcessState::Parsing,
            ProcessState::Analyzing,
            ProcessState::Complete,
        ]
    );

    let progress: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

    let finished = events
        .iter()
        .filter(|e| matches!(e, ProcessEvent::Finished(_)))
        .count();
    assert_eq!(finished, 1);
    Ok(())
}

#[tokio::test]
async fn test_validation_failure() -> Result<()> {
    let processor = Processor::default();
    let handle = processor.submit(TrackRequest::new("bad", "notes.gpx", b"hello".to_vec()))?;
    match handle.wait().await {
        Err(PipelineFailure::Failed(err)) => {
            assert_eq!(err.kind(), ErrorKind::MalformedContent);
            assert_eq!(err.phase(), Some(ProcessState::Validating));
        }
        other => bail!("expected a validation failure, got {:?}", other.map(|o| o.stats)),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_jobs() -> Result<()> {
    let processor = Processor::default();
    let handles = [(10, "a"), (200, "b"), (1000, "c"), (3, "d")]
        .into_iter()
        .map(|(n, id)| -> Result<_> {
            let request = TrackRequest::new(id, format!("{id}.gpx"), gpx(n))
                .with_level(SimplificationLevel::High);
            Ok((n, processor.submit(request)?))
        })
        .collect::<Result<Vec<_>>>()?;

    for (n, handle) in handles {
        let id = handle.correlation_id().to_owned();
        let output = handle.wait().await?;
        assert_eq!(output.correlation_id, id);
        assert_eq!(output.stats.point_count, n);
        assert_eq!(output.level, SimplificationLevel::High);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_events() -> Result<()> {
    let processor = Processor::default();
    let track = gpx(100_000);

    let started = Instant::now();
    processor
        .submit(TrackRequest::new("full", "full.gpx", track.clone()))?
        .wait()
        .await?;
    let full_run = started.elapsed();

    let mut handle = processor.submit(TrackRequest::new("cut", "cut.gpx", track))?;
    while let Some(event) = handle.next_event().await {
        if matches!(event, ProcessEvent::State(ProcessState::Parsing)) {
            break;
        }
    }

    let cancelled_at = Instant::now();
    handle.cancel();
    assert!(handle.is_cancelled());
    assert!(handle.next_event().await.is_none());
    assert!(matches!(handle.wait().await, Err(PipelineFailure::Cancelled)));

    // The worker stops at its next checkpoint rather than finishing the job.
    let stopping = cancelled_at.elapsed();
    assert!(
        stopping < full_run / 2,
        "took {stopping:?} to stop, against {full_run:?} for a full run"
    );
    Ok(())
}

#[tokio::test]
async fn test_submit_path() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("trackpipe-worker-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join("morning.gpx");
    tokio::fs::write(&path, gpx(20)).await?;

    let processor = Processor::default();
    let output = processor
        .submit_path(&path, "morning", SimplificationLevel::None)
        .await?
        .wait()
        .await?;
    assert_eq!(output.geojson.features[0].geometry.len(), 20);

    let missing = processor
        .submit_path(dir.join("missing.gpx"), "missing", SimplificationLevel::None)
        .await;
    assert!(matches!(missing, Err(TrackPipeError::Io(_))));

    tokio::fs::remove_dir_all(&dir).await?;
    Ok(())
}

#[test]
fn test_submit_outside_runtime() {
    let processor = Processor::default();
    let result = processor.submit(TrackRequest::new("x", "x.gpx", gpx(2)));
    let err = result.err().map(|e| e.kind());
    assert_eq!(err, Some(ErrorKind::WorkerInitError));
}
