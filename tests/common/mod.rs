//! Common test utilities and helpers for the streamer tests
//!
//! Provides a recording fake of the downstream collaborator, a fake publish
//! transport, frame builders and a few timing assertions.

#![allow(dead_code)]

/// Recording stand-in for the encode/mux collaborator
pub mod fake_downstream {
    use bytes::Bytes;
    use crossbeam_channel::{Sender, unbounded, Receiver};
    use rgb_streamer::error::{StreamerError, StreamerResult};
    use rgb_streamer::{Caps, Downstream, DownstreamConfig, DownstreamEvents, Frame, Geometry};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// One observed call, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Prepare,
        Open(DownstreamConfig),
        Configure(Caps),
        Submit {
            geometry: Geometry,
            pts_ns: u64,
            duration_ns: u64,
        },
        Finalize,
        /// Marker pushed by test hooks
        Mark(&'static str),
    }

    /// Shared call log, cloned into hooks and kept by the test
    #[derive(Debug, Clone, Default)]
    pub struct Recorder(Arc<Mutex<Vec<Call>>>);

    impl Recorder {
        pub fn push(&self, call: Call) {
            self.0.lock().unwrap().push(call);
        }

        pub fn mark(&self, label: &'static str) {
            self.push(Call::Mark(label));
        }

        pub fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }

        pub fn configures(&self) -> Vec<Caps> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Configure(caps) => Some(caps),
                    _ => None,
                })
                .collect()
        }

        pub fn submits(&self) -> Vec<(Geometry, u64, u64)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Submit {
                        geometry,
                        pts_ns,
                        duration_ns,
                    } => Some((geometry, pts_ns, duration_ns)),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, wanted: &Call) -> usize {
            self.calls().iter().filter(|call| *call == wanted).count()
        }
    }

    pub struct FakeDownstream {
        recorder: Recorder,
        missing_element: Option<&'static str>,
        reject_submit_at: Option<u64>,
        error_event_at: Option<u64>,
        error_event_on_open: bool,
        emit_chunks: bool,
        submit_delay: Duration,
        acks: Option<Sender<u64>>,
        events: Option<DownstreamEvents>,
        submitted: u64,
    }

    impl FakeDownstream {
        pub fn new(recorder: Recorder) -> Self {
            Self {
                recorder,
                missing_element: None,
                reject_submit_at: None,
                error_event_at: None,
                error_event_on_open: false,
                emit_chunks: false,
                submit_delay: Duration::ZERO,
                acks: None,
                events: None,
                submitted: 0,
            }
        }

        /// `prepare` fails as if this element factory were not installed
        pub fn missing_element(mut self, name: &'static str) -> Self {
            self.missing_element = Some(name);
            self
        }

        /// The submit with this zero-based index returns an error
        pub fn reject_submit_at(mut self, index: u64) -> Self {
            self.reject_submit_at = Some(index);
            self
        }

        /// The submit with this index raises an asynchronous error event
        pub fn error_event_at(mut self, index: u64) -> Self {
            self.error_event_at = Some(index);
            self
        }

        /// `open` succeeds but reports an asynchronous error before returning
        pub fn error_event_on_open(mut self) -> Self {
            self.error_event_on_open = true;
            self
        }

        /// Report one encoded chunk per accepted frame
        pub fn emit_chunks(mut self) -> Self {
            self.emit_chunks = true;
            self
        }

        pub fn submit_delay(mut self, delay: Duration) -> Self {
            self.submit_delay = delay;
            self
        }

        /// Channel receiving the pts of every accepted frame
        pub fn with_acks(mut self) -> (Self, Receiver<u64>) {
            let (tx, rx) = unbounded();
            self.acks = Some(tx);
            (self, rx)
        }
    }

    impl Downstream for FakeDownstream {
        fn prepare(&mut self) -> StreamerResult<()> {
            self.recorder.push(Call::Prepare);
            match self.missing_element {
                Some(name) => Err(StreamerError::initialization(
                    name,
                    "element factory not found",
                )),
                None => Ok(()),
            }
        }

        fn open(
            &mut self,
            config: &DownstreamConfig,
            events: DownstreamEvents,
        ) -> StreamerResult<()> {
            self.recorder.push(Call::Open(config.clone()));
            if self.error_event_on_open {
                events.end_of_stream(Some(StreamerError::gstreamer(
                    Some("filesink".into()),
                    "could not open resource for writing",
                )));
            }
            self.events = Some(events);
            Ok(())
        }

        fn configure(&mut self, caps: &Caps) -> StreamerResult<()> {
            self.recorder.push(Call::Configure(*caps));
            Ok(())
        }

        fn submit(&mut self, frame: Frame, pts_ns: u64, duration_ns: u64) -> StreamerResult<()> {
            let index = self.submitted;
            self.submitted += 1;
            if !self.submit_delay.is_zero() {
                std::thread::sleep(self.submit_delay);
            }
            if self.reject_submit_at == Some(index) {
                return Err(StreamerError::submit("fake downstream rejected the frame"));
            }
            self.recorder.push(Call::Submit {
                geometry: frame.geometry(),
                pts_ns,
                duration_ns,
            });
            if let Some(events) = &self.events {
                if self.error_event_at == Some(index) {
                    events.end_of_stream(Some(StreamerError::gstreamer(
                        Some("jpegenc".into()),
                        "internal data stream error",
                    )));
                }
                if self.emit_chunks {
                    events.output_chunk(Bytes::from(format!("jpeg-{}", pts_ns)));
                }
            }
            if let Some(acks) = &self.acks {
                let _ = acks.send(pts_ns);
            }
            Ok(())
        }

        fn finalize(&mut self) -> StreamerResult<()> {
            self.recorder.push(Call::Finalize);
            Ok(())
        }
    }
}

/// Publish transport double
pub mod fake_transport {
    use bytes::Bytes;
    use rgb_streamer::error::{StreamerError, StreamerResult};
    use rgb_streamer::{Endpoint, PublishTransport};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeTransport {
        /// When set, only the first send succeeds
        saturated: bool,
        state: Mutex<FakeTransportState>,
    }

    #[derive(Debug, Default)]
    pub struct FakeTransportState {
        pub binds: usize,
        pub sent: Vec<Bytes>,
        pub rejected: usize,
        pub closed: bool,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn saturated() -> Self {
            Self {
                saturated: true,
                ..Self::default()
            }
        }

        pub fn binds(&self) -> usize {
            self.state.lock().unwrap().binds
        }

        pub fn sent(&self) -> Vec<Bytes> {
            self.state.lock().unwrap().sent.clone()
        }

        pub fn rejected(&self) -> usize {
            self.state.lock().unwrap().rejected
        }

        pub fn is_closed(&self) -> bool {
            self.state.lock().unwrap().closed
        }
    }

    impl PublishTransport for FakeTransport {
        fn bind_ephemeral(&self) -> StreamerResult<Endpoint> {
            self.state.lock().unwrap().binds += 1;
            Ok(Endpoint {
                address: SocketAddr::from((Ipv4Addr::LOCALHOST, 45_999)),
            })
        }

        fn send_nonblocking_latest(&self, payload: Bytes) -> StreamerResult<()> {
            let mut state = self.state.lock().unwrap();
            if self.saturated && !state.sent.is_empty() {
                state.rejected += 1;
                return Err(StreamerError::transport_send(
                    Some("tcp://127.0.0.1:45999".into()),
                    "send queue full",
                ));
            }
            state.sent.push(payload);
            Ok(())
        }

        fn close(&self) {
            self.state.lock().unwrap().closed = true;
        }
    }
}

/// Test frame utilities and constants
pub mod test_frames {
    use rgb_streamer::Geometry;

    /// Input size used by the demo producer
    pub const INPUT: Geometry = Geometry::new(1024, 600);
    /// Half of `INPUT`
    pub const OUTPUT: Geometry = Geometry::new(512, 300);

    /// Tightly packed RGB24 buffer filled with `value`
    pub fn rgb(geometry: Geometry, value: u8) -> Vec<u8> {
        vec![value; geometry.rgb_len()]
    }
}

/// Custom assertions for streaming tests
pub mod assertions {
    use std::time::{Duration, Instant};

    /// Assert timestamps increase by one frame duration (±1ns from integer scaling)
    pub fn assert_constant_rate(pts: &[u64], framerate: u32) {
        let expected = 1_000_000_000 / u64::from(framerate);
        for (i, pair) in pts.windows(2).enumerate() {
            assert!(pair[1] > pair[0], "pts not increasing at {}: {:?}", i, pair);
            let step = pair[1] - pair[0];
            assert!(
                step == expected || step == expected + 1,
                "step {} at {} differs from {}ns",
                step,
                i,
                expected
            );
        }
    }

    /// Poll `condition` until it holds or `timeout` elapses
    pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    /// Run `f` and assert it finishes within `limit`
    pub fn assert_completes_within<T>(limit: Duration, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let value = f();
        let elapsed = started.elapsed();
        assert!(elapsed < limit, "took {:?}, limit {:?}", elapsed, limit);
        value
    }
}
