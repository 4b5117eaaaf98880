//! # GStreamer Collaborator
//!
//! [`Downstream`] implementation encoding frames to JPEG with GStreamer.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! appsrc → videoscale → capsfilter → jpegenc → avimux → filesink      (File)
//!                                            → tcpserversink          (StreamSocket)
//!                                            → appsink                (PullCallback, PushLatest)
//! ```
//!
//! - **appsrc**: raw RGB caps following the latest input geometry, blocking
//!   once two frames are queued
//! - **capsfilter**: output caps, swapped under rotation
//! - **appsink**: every JPEG is reported through
//!   [`DownstreamEvents::output_chunk`]
//!
//! A bus watcher thread turns `Error` messages into a fatal end of stream and
//! `Eos` into a normal one. On `Error` the pipeline is set to `Null` first, so
//! a `submit` waiting on a full appsrc fails with `Flushing` instead of hanging. `finalize` sends EOS, waits for it to reach the
//! sink (bounded), then tears the pipeline down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, bounded};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::caps::Caps;
use crate::downstream::{Downstream, DownstreamConfig, DownstreamEvents};
use crate::error::{StreamerError, StreamerResult};
use crate::frame::{Frame, Geometry};
use crate::sink::SinkKind;

/// Elements every chain needs, whatever the sink.
const CORE_ELEMENTS: [&str; 4] = ["appsrc", "videoscale", "capsfilter", "jpegenc"];
const BUS_POLL: Duration = Duration::from_millis(100);
const DEFAULT_EOS_TIMEOUT: Duration = Duration::from_secs(3);

/// Factories the output tail for `sink` is built from.
pub fn tail_elements(sink: &SinkKind) -> &'static [&'static str] {
    match sink {
        SinkKind::File(_) => &["avimux", "filesink"],
        SinkKind::StreamSocket { .. } => &["tcpserversink"],
        SinkKind::PullCallback | SinkKind::PushLatest => &["appsink"],
    }
}

/// `gst-launch` style description of the chain, for logs.
pub fn launch_description(config: &DownstreamConfig) -> String {
    let caps = &config.caps;
    let tail = match &config.sink {
        SinkKind::File(path) => format!("avimux ! filesink location={}", path.display()),
        SinkKind::StreamSocket { port } => format!("tcpserversink port={}", port),
        SinkKind::PullCallback | SinkKind::PushLatest => "appsink".to_string(),
    };
    format!(
        "appsrc caps=video/x-raw,format={fmt},width={iw},height={ih},framerate={fr}/1 \
         ! videoscale ! video/x-raw,format={fmt},width={ow},height={oh},framerate={fr}/1 \
         ! jpegenc ! {tail}",
        fmt = caps.format.caps_name(),
        iw = caps.input.width,
        ih = caps.input.height,
        ow = caps.output.width,
        oh = caps.output.height,
        fr = caps.framerate,
        tail = tail,
    )
}

fn raw_caps(geometry: Geometry, framerate: u32) -> StreamerResult<gst::Caps> {
    let fps = i32::try_from(framerate)
        .map_err(|_| StreamerError::config("framerate", framerate.to_string(), "too large"))?;
    let info = gst_video::VideoInfo::builder(
        gst_video::VideoFormat::Rgb,
        geometry.width,
        geometry.height,
    )
    .fps(gst::Fraction::new(fps, 1))
    .build()?;
    Ok(info.to_caps()?)
}

fn make(factory: &str, name: &str) -> StreamerResult<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|e| StreamerError::initialization(factory.to_string(), e.to_string()))
}

struct Running {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    capsfilter: gst::Element,
    framerate: u32,
    eos: Receiver<()>,
    bus_stop: Arc<AtomicBool>,
    bus_thread: Option<JoinHandle<()>>,
}

pub struct GstDownstream {
    running: Option<Running>,
    eos_timeout: Duration,
}

impl Default for GstDownstream {
    fn default() -> Self {
        Self::new()
    }
}

impl GstDownstream {
    pub fn new() -> Self {
        Self {
            running: None,
            eos_timeout: DEFAULT_EOS_TIMEOUT,
        }
    }

    /// Upper bound for waiting on EOS during `finalize`.
    pub fn with_eos_timeout(mut self, timeout: Duration) -> Self {
        self.eos_timeout = timeout;
        self
    }

    fn running(&mut self) -> StreamerResult<&mut Running> {
        self.running
            .as_mut()
            .ok_or_else(|| StreamerError::state("closed", "use pipeline", "pipeline is not open"))
    }

    fn build_tail(
        sink: &SinkKind,
        events: &DownstreamEvents,
    ) -> StreamerResult<Vec<gst::Element>> {
        match sink {
            SinkKind::File(path) => {
                let mux = make("avimux", "avi-muxer")?;
                let filesink = gst::ElementFactory::make("filesink")
                    .name("file-sink")
                    .property("location", path.to_string_lossy().to_string())
                    .build()
                    .map_err(|e| StreamerError::initialization("filesink", e.to_string()))?;
                Ok(vec![mux, filesink])
            }
            SinkKind::StreamSocket { port } => {
                let tcp = gst::ElementFactory::make("tcpserversink")
                    .name("tcp-sink")
                    .property("port", i32::from(*port))
                    .build()
                    .map_err(|e| StreamerError::initialization("tcpserversink", e.to_string()))?;
                Ok(vec![tcp])
            }
            SinkKind::PullCallback | SinkKind::PushLatest => {
                let appsink = gst_app::AppSink::builder().name("app-sink").build();
                let events = events.clone();
                appsink.set_callbacks(
                    gst_app::AppSinkCallbacks::builder()
                        .new_sample(move |sink| {
                            let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                            let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                            let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                            events.output_chunk(Bytes::copy_from_slice(map.as_slice()));
                            Ok(gst::FlowSuccess::Ok)
                        })
                        .build(),
                );
                Ok(vec![appsink.upcast()])
            }
        }
    }
}

impl Downstream for GstDownstream {
    fn prepare(&mut self) -> StreamerResult<()> {
        gst::init().map_err(|e| StreamerError::initialization("gstreamer", e.to_string()))?;
        for factory in CORE_ELEMENTS {
            if gst::ElementFactory::find(factory).is_none() {
                return Err(StreamerError::initialization(
                    factory,
                    "element factory not found",
                ));
            }
        }
        log::debug!("GStreamer {} ready", gst::version_string());
        Ok(())
    }

    fn open(&mut self, config: &DownstreamConfig, events: DownstreamEvents) -> StreamerResult<()> {
        for factory in tail_elements(&config.sink) {
            if gst::ElementFactory::find(factory).is_none() {
                return Err(StreamerError::initialization(
                    *factory,
                    "element factory not found",
                ));
            }
        }
        log::info!("Pipeline: {}", launch_description(config));

        let caps = &config.caps;
        let pipeline = gst::Pipeline::with_name("video-streamer");
        let appsrc = gst_app::AppSrc::builder()
            .name("app-src")
            .caps(&raw_caps(caps.input, caps.framerate)?)
            .format(gst::Format::Time)
            .stream_type(gst_app::AppStreamType::Stream)
            .block(true)
            .max_bytes((caps.input.rgb_len() * 2) as u64)
            .build();
        let scale = make("videoscale", "video-scale")?;
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .name("caps-filter")
            .property("caps", raw_caps(caps.output, caps.framerate)?)
            .build()
            .map_err(|e| StreamerError::initialization("capsfilter", e.to_string()))?;
        let encoder = make("jpegenc", "jpeg-converter")?;

        let mut chain: Vec<gst::Element> =
            vec![appsrc.clone().upcast(), scale, capsfilter.clone(), encoder];
        chain.extend(Self::build_tail(&config.sink, &events)?);
        pipeline
            .add_many(&chain)
            .map_err(|e| StreamerError::initialization("pipeline", e.to_string()))?;
        gst::Element::link_many(&chain)
            .map_err(|e| StreamerError::initialization("linking", e.to_string()))?;

        let bus = pipeline
            .bus()
            .ok_or_else(|| StreamerError::initialization("pipeline", "pipeline has no bus"))?;
        let (eos_tx, eos) = bounded::<()>(1);
        let bus_stop = Arc::new(AtomicBool::new(false));
        let bus_thread = {
            let bus_stop = Arc::clone(&bus_stop);
            let weak_pipeline = pipeline.downgrade();
            thread::Builder::new()
                .name("gst-bus".into())
                .spawn(move || {
                    while !bus_stop.load(Ordering::SeqCst) {
                        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(
                            BUS_POLL.as_millis() as u64,
                        )) else {
                            continue;
                        };
                        match msg.view() {
                            gst::MessageView::Eos(..) => {
                                log::debug!("End of stream reached the sink");
                                let _ = eos_tx.try_send(());
                                events.end_of_stream(None);
                            }
                            gst::MessageView::Error(err) => {
                                let element = err.src().map(|s| s.path_string().to_string());
                                let error = StreamerError::gstreamer(element, err.error().to_string())
                                    .with_context(format!("{:?}", err.debug()));
                                // appsrc stops draining after a streaming error, so a
                                // pump blocked in push_buffer only returns once flushing
                                if let Some(pipeline) = weak_pipeline.upgrade() {
                                    if let Err(e) = pipeline.set_state(gst::State::Null) {
                                        log::error!("Cannot stop pipeline after error: {}", e);
                                    }
                                }
                                let _ = eos_tx.try_send(());
                                events.end_of_stream(Some(error));
                            }
                            gst::MessageView::Warning(warning) => {
                                log::warn!("GStreamer warning: {}", warning.error());
                            }
                            _ => {}
                        }
                    }
                })
                .map_err(|e| StreamerError::io("spawn bus watcher", e))?
        };

        let mut running = Running {
            pipeline,
            appsrc,
            capsfilter,
            framerate: caps.framerate,
            eos,
            bus_stop,
            bus_thread: Some(bus_thread),
        };
        if let Err(e) = running.pipeline.set_state(gst::State::Playing) {
            shutdown(&mut running);
            return Err(StreamerError::initialization("pipeline", e.to_string()));
        }
        self.running = Some(running);
        Ok(())
    }

    fn configure(&mut self, caps: &Caps) -> StreamerResult<()> {
        let running = self.running()?;
        let input = raw_caps(caps.input, running.framerate)?;
        let output = raw_caps(caps.output, running.framerate)?;
        running.appsrc.set_caps(Some(&input));
        running.capsfilter.set_property("caps", &output);
        log::debug!("Applied caps {}", caps);
        Ok(())
    }

    fn submit(&mut self, frame: Frame, pts_ns: u64, duration_ns: u64) -> StreamerResult<()> {
        let running = self.running()?;
        let mut buffer = gst::Buffer::from_mut_slice(frame.into_bytes());
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| StreamerError::submit("new buffer is not writable"))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(pts_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(duration_ns));
        }
        running
            .appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|flow| StreamerError::submit(format!("appsrc returned {:?}", flow)))
    }

    fn finalize(&mut self) -> StreamerResult<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        if running.appsrc.end_of_stream().is_ok()
            && running.eos.recv_timeout(self.eos_timeout).is_err()
        {
            log::warn!(
                "End of stream not reached within {:?}, tearing down anyway",
                self.eos_timeout
            );
        }
        shutdown(&mut running);
        Ok(())
    }
}

impl Drop for GstDownstream {
    fn drop(&mut self) {
        if let Some(mut running) = self.running.take() {
            shutdown(&mut running);
        }
    }
}

fn shutdown(running: &mut Running) {
    if let Err(e) = running.pipeline.set_state(gst::State::Null) {
        log::error!("Cannot set pipeline to Null: {}", e);
    }
    running.bus_stop.store(true, Ordering::SeqCst);
    if let Some(thread) = running.bus_thread.take() {
        if thread.join().is_err() {
            log::error!("Bus watcher thread panicked");
        }
    }
}
