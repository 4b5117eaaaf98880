//! End-to-end lifecycle of a pipeline driven through a fake downstream

mod common;

use common::assertions::{assert_constant_rate, wait_until};
use common::fake_downstream::{Call, FakeDownstream, Recorder};
use common::fake_transport::FakeTransport;
use common::test_frames::{INPUT, OUTPUT, rgb};
use rgb_streamer::{
    Frame, Pipeline, PipelineState, SinkKind, StreamConfig, StreamOutcome,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

fn file_config(dir: &tempfile::TempDir) -> StreamConfig {
    StreamConfig::new(
        30,
        OUTPUT.width,
        OUTPUT.height,
        SinkKind::File(dir.path().join("capture.avi")),
    )
}

#[test]
fn test_file_sink_receives_every_paced_frame() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let (downstream, acks) = FakeDownstream::new(recorder.clone()).with_acks();

    let mut pipeline = Pipeline::builder().downstream(downstream).build();
    pipeline.init().unwrap();
    pipeline.run(file_config(&dir)).unwrap();

    let frame = rgb(INPUT, 0xAA);
    for _ in 0..150 {
        pipeline.feed(INPUT.width, INPUT.height, &frame).unwrap();
        acks.recv_timeout(ACK_TIMEOUT).expect("frame was not submitted");
    }
    let report = pipeline.stop().unwrap();

    let submits = recorder.submits();
    assert_eq!(submits.len(), 150);
    assert!(submits.iter().all(|(geometry, _, _)| *geometry == INPUT));
    assert!(submits.iter().all(|(_, _, duration)| *duration >= 33_333_333));
    let pts: Vec<u64> = submits.iter().map(|(_, pts, _)| *pts).collect();
    assert_eq!(pts[0], 0);
    assert_constant_rate(&pts, 30);

    let configures = recorder.configures();
    assert_eq!(configures.len(), 1);
    assert_eq!(configures[0].input, INPUT);
    assert_eq!(configures[0].output, OUTPUT);

    assert_eq!(recorder.count(&Call::Finalize), 1);
    assert_eq!(report.frames_submitted, 150);
    assert_eq!(report.last_pts, pts.last().copied());
    assert_eq!(report.failure, None);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_open_receives_sink_and_initial_caps() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(recorder.clone()))
        .build();
    pipeline.init().unwrap();
    pipeline.run(file_config(&dir)).unwrap();
    pipeline.stop().unwrap();

    let opened = recorder.calls().into_iter().find_map(|call| match call {
        Call::Open(config) => Some(config),
        _ => None,
    });
    let opened = opened.expect("open was not called");
    assert_eq!(opened.sink, SinkKind::File(dir.path().join("capture.avi")));
    assert_eq!(opened.caps.output, OUTPUT);
    assert_eq!(opened.caps.framerate, 30);
}

#[test]
fn test_states_follow_the_lifecycle() {
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(Recorder::default()))
        .build();
    assert_eq!(pipeline.state(), PipelineState::Init);

    pipeline.init().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert!(pipeline.init().is_err());

    pipeline.run(StreamConfig::default()).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Playing);
    assert!(pipeline.run(StreamConfig::default()).is_err());

    pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_init_fails_when_element_is_missing() {
    let recorder = Recorder::default();
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(recorder.clone()).missing_element("jpegenc"))
        .build();

    let error = pipeline.init().unwrap_err();
    assert_eq!(error.category(), "initialization");
    assert_eq!(pipeline.state(), PipelineState::Init);

    // run is refused before a successful init
    let error = pipeline.run(StreamConfig::default()).unwrap_err();
    assert_eq!(error.category(), "state");
    assert_eq!(recorder.count(&Call::Finalize), 0);
}

#[cfg(not(feature = "gstreamer"))]
#[test]
fn test_init_without_downstream_fails() {
    let mut pipeline = Pipeline::builder().build();
    assert_eq!(pipeline.init().unwrap_err().category(), "initialization");
}

#[test]
fn test_error_reported_during_open_aborts_run() {
    let recorder = Recorder::default();
    let transport = Arc::new(FakeTransport::new());
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(recorder.clone()).error_event_on_open())
        .transport(Arc::clone(&transport) as _)
        .build();
    pipeline.init().unwrap();

    let error = pipeline
        .run(StreamConfig::new(30, 512, 300, SinkKind::PushLatest))
        .unwrap_err();
    assert_eq!(error.category(), "initialization");
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(recorder.count(&Call::Finalize), 1);
    assert!(transport.is_closed());
    assert_eq!(transport.binds(), 0);
    assert!(pipeline.endpoint().is_none());
    assert!(pipeline.stop().is_err());
}

#[test]
fn test_invalid_config_is_rejected_by_run() {
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(Recorder::default()))
        .build();
    pipeline.init().unwrap();

    let error = pipeline
        .run(StreamConfig::new(0, 512, 300, SinkKind::PullCallback))
        .unwrap_err();
    assert_eq!(error.category(), "config");
    assert_eq!(pipeline.state(), PipelineState::Ready);
}

#[test]
fn test_ready_fires_once_before_first_frame() {
    let recorder = Recorder::default();
    let (downstream, acks) = FakeDownstream::new(recorder.clone()).with_acks();
    let mut pipeline = Pipeline::builder()
        .downstream(downstream)
        .on_ready({
            let recorder = recorder.clone();
            move || recorder.mark("ready")
        })
        .build();
    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();
    assert_eq!(recorder.count(&Call::Mark("ready")), 1);

    pipeline.feed(INPUT.width, INPUT.height, &rgb(INPUT, 1)).unwrap();
    acks.recv_timeout(ACK_TIMEOUT).unwrap();
    pipeline.stop().unwrap();

    let calls = recorder.calls();
    let ready = calls.iter().position(|c| *c == Call::Mark("ready")).unwrap();
    let first_submit = calls
        .iter()
        .position(|c| matches!(c, Call::Submit { .. }))
        .unwrap();
    assert!(ready < first_submit);
    assert_eq!(recorder.count(&Call::Mark("ready")), 1);
}

#[test]
fn test_end_of_stream_reports_completion_once() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(Recorder::default()))
        .on_end_of_stream({
            let outcomes = Arc::clone(&outcomes);
            move |outcome| outcomes.lock().unwrap().push(outcome)
        })
        .build();
    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();
    pipeline.stop().unwrap();
    assert!(pipeline.stop().is_err());

    assert_eq!(*outcomes.lock().unwrap(), vec![StreamOutcome::Completed]);
}

#[test]
fn test_second_stop_is_rejected_without_side_effects() {
    let recorder = Recorder::default();
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(recorder.clone()))
        .build();
    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();
    pipeline.stop().unwrap();

    let error = pipeline.stop().unwrap_err();
    assert_eq!(error.category(), "state");
    assert_eq!(recorder.count(&Call::Finalize), 1);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_feed_rejected_outside_a_run() {
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(Recorder::default()))
        .build();
    let frame = rgb(INPUT, 0);
    assert_eq!(
        pipeline
            .feed(INPUT.width, INPUT.height, &frame)
            .unwrap_err()
            .category(),
        "state"
    );

    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();
    pipeline.feed(INPUT.width, INPUT.height, &frame).unwrap();
    assert_eq!(
        pipeline.feed(0, 600, &[]).unwrap_err().category(),
        "validation"
    );
    pipeline.stop().unwrap();

    assert!(pipeline.feed(INPUT.width, INPUT.height, &frame).is_err());
    assert!(pipeline.feed_frame(Frame::filled(2, 2, 0).unwrap()).is_err());
}

#[test]
fn test_submit_failure_stops_the_run() {
    let recorder = Recorder::default();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let (downstream, acks) = FakeDownstream::new(recorder.clone())
        .reject_submit_at(3)
        .with_acks();
    let mut pipeline = Pipeline::builder()
        .downstream(downstream)
        .on_end_of_stream({
            let outcomes = Arc::clone(&outcomes);
            move |outcome| outcomes.lock().unwrap().push(outcome)
        })
        .build();
    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();

    let frame = rgb(INPUT, 3);
    for _ in 0..3 {
        pipeline.feed(INPUT.width, INPUT.height, &frame).unwrap();
        acks.recv_timeout(ACK_TIMEOUT).unwrap();
    }
    pipeline.feed(INPUT.width, INPUT.height, &frame).unwrap();
    assert!(wait_until(ACK_TIMEOUT, || {
        pipeline.state() == PipelineState::Stopping
    }));
    assert!(wait_until(ACK_TIMEOUT, || recorder.count(&Call::Finalize) == 1));

    // no retry, nothing accepted after the failure
    assert!(pipeline.feed(INPUT.width, INPUT.height, &frame).is_err());
    let report = pipeline.stop().unwrap();
    assert_eq!(report.frames_submitted, 3);
    assert!(report.failure.unwrap().contains("rejected"));
    assert_eq!(recorder.submits().len(), 3);
    assert_eq!(recorder.count(&Call::Finalize), 1);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_failure());
}

#[test]
fn test_asynchronous_error_forces_stopping() {
    let recorder = Recorder::default();
    let (downstream, acks) = FakeDownstream::new(recorder.clone())
        .error_event_at(1)
        .with_acks();
    let mut pipeline = Pipeline::builder().downstream(downstream).build();
    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();

    let frame = rgb(INPUT, 9);
    for _ in 0..2 {
        pipeline.feed(INPUT.width, INPUT.height, &frame).unwrap();
        acks.recv_timeout(ACK_TIMEOUT).unwrap();
    }
    assert_eq!(pipeline.state(), PipelineState::Stopping);
    assert!(wait_until(ACK_TIMEOUT, || recorder.count(&Call::Finalize) == 1));

    let report = pipeline.stop().unwrap();
    assert_eq!(report.frames_submitted, 2);
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn test_pull_source_drives_the_pump() {
    let recorder = Recorder::default();
    let mut remaining = 5;
    let mut pipeline = Pipeline::builder()
        .downstream(FakeDownstream::new(recorder.clone()))
        .source(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            Frame::filled(INPUT.width, INPUT.height, 0x10).ok()
        })
        .build();
    pipeline.init().unwrap();

    // feeding is refused in pull mode
    assert!(pipeline.feed(1, 1, &[0; 3]).is_err());

    pipeline.run(StreamConfig::default()).unwrap();
    assert!(wait_until(ACK_TIMEOUT, || recorder.count(&Call::Finalize) == 1));
    assert_eq!(
        pipeline
            .feed(INPUT.width, INPUT.height, &rgb(INPUT, 0))
            .unwrap_err()
            .category(),
        "state"
    );

    let report = pipeline.stop().unwrap();
    assert_eq!(report.frames_submitted, 5);
    let pts: Vec<u64> = recorder.submits().iter().map(|(_, pts, _)| *pts).collect();
    assert_constant_rate(&pts, 30);
}

#[test]
fn test_feed_frame_transfers_ownership() {
    let recorder = Recorder::default();
    let (downstream, acks) = FakeDownstream::new(recorder.clone()).with_acks();
    let mut pipeline = Pipeline::builder().downstream(downstream).build();
    pipeline.init().unwrap();
    pipeline.run(StreamConfig::default()).unwrap();

    let frame = Frame::new(INPUT.width, INPUT.height, rgb(INPUT, 4)).unwrap();
    pipeline.feed_frame(frame).unwrap();
    acks.recv_timeout(ACK_TIMEOUT).unwrap();
    pipeline.stop().unwrap();

    assert_eq!(recorder.submits()[0].0, INPUT);
    assert_eq!(pipeline.mailbox_stats().taken, 1);
}
