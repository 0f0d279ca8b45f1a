//! Pipeline controller (C9, spec §4.9/§5): wires the frame source, detector,
//! buffer, and writers into the two commands exposed to the binary crate —
//! `run_detect` (C1→C2→C3→C4 over files) and `run_track` (C6→C7→C8 over
//! OTDET files) — plus `run_stream`, which drives the same detect stage
//! continuously off an RTSP source and interleaves it with a streaming
//! tracker and exporter (C1→C2→C3→C4, streaming C5, streaming C9).
//!
//! Grounded on moonfire-nvr's top-level split between "read frames" and "do
//! something with each one" (`stream.rs` vs. `writer.rs`/`db`'s watch
//! senders): this module is the glue moonfire keeps inline in its
//! streamer's run loop, pulled out here because two independent consumers
//! (the per-segment OTDET writer and the continuous streaming tracker) must
//! both see every detected frame.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base::shutdown::Receiver as ShutdownReceiver;
use base::{err, Error};
use uuid::Uuid;

use crate::buffer::DetectedFrameBuffer;
use crate::config::{DetectConfig, StreamConfig, TrackConfig};
use crate::detect::{self, Detector};
use crate::export::{self, StreamTrackExporter};
use crate::idgen::TrackIdGenerator;
use crate::model::{DetectedFrameBufferEvent, FlushEvent, OtdetFileWritten, OttrkFileWritten, TrackId};
use crate::observer::SyncSubject;
use crate::otdet;
use crate::source::file::FileFrameSource;
use crate::source::stream::StreamFrameSource;
use crate::tracker::iou::IouTracker;
use crate::tracker::unfinished::UnfinishedChunksBuffer;
use crate::tracker::Tracker;

/// Runs C1→C2→C3→C4 over `paths`: decode, detect, buffer per segment, and
/// write one OTDET artifact per accepted file. Returns every artifact
/// written, in completion order. A file that fails decode, filename
/// parsing, or the overwrite check is skipped (spec §7); a detector
/// inference failure is fatal (spec §4.2).
pub fn run_detect(
    paths: &[PathBuf],
    config: &DetectConfig,
    detector: &dyn Detector,
) -> Result<Vec<OtdetFileWritten>, Error> {
    let source = FileFrameSource::new();
    let buffer = Arc::new(DetectedFrameBuffer::new());
    let written = Arc::new(Mutex::new(Vec::new()));
    let on_otdet_written: Arc<SyncSubject<OtdetFileWritten>> = Arc::new(SyncSubject::new());
    {
        let written = written.clone();
        on_otdet_written.register(Arc::new(move |e: &OtdetFileWritten| {
            written.lock().unwrap().push(e.clone());
            Ok(())
        }));
    }

    {
        let config = config.clone();
        let detector_meta = detector.metadata().clone();
        let on_otdet_written = on_otdet_written.clone();
        buffer.on_buffer_event.register(Arc::new(move |event: &DetectedFrameBufferEvent| {
            let otdet_file = otdet::build_otdet(event, &config, &detector_meta);
            let path = otdet::resolve_save_path(Path::new(&event.source_metadata.source), &config);
            otdet::write_otdet(&path, &otdet_file, config.overwrite, &on_otdet_written)
        }));
    }
    {
        let buffer = buffer.clone();
        source.on_flush.register(Arc::new(move |event: &FlushEvent| {
            buffer.on_flush(event);
            Ok(())
        }));
    }

    source.produce(paths, config, |frame| {
        let detected = detect::detect_one(detector, frame)?;
        buffer.observe(&detected);
        Ok(())
    })?;

    Ok(Arc::try_unwrap(written).expect("no observer outlives run_detect").into_inner().unwrap())
}

/// Runs C6→C7→C8 over a set of already-written OTDET files: groups them,
/// tracks each group with a fresh IOU run, closes tracks across chunk
/// boundaries, and writes one OTTRK artifact per finished chunk that has
/// any detections left after discard filtering.
pub fn run_track(paths: &[PathBuf], config: &TrackConfig) -> Result<Vec<OttrkFileWritten>, Error> {
    let output = crate::tracker::chunked::track_files(paths, config.iou, config.merge_threshold, config.overwrite)?;

    let mut buffer = UnfinishedChunksBuffer::new(config.keep_discarded);
    let mut finished_chunks = Vec::new();
    for chunk in output.chunks {
        finished_chunks.extend(buffer.push(chunk));
    }
    finished_chunks.extend(buffer.finish_remaining());

    let tracking_run_id = Uuid::new_v4();
    let subject: SyncSubject<OttrkFileWritten> = SyncSubject::new();
    let written = Arc::new(Mutex::new(Vec::new()));
    {
        let written = written.clone();
        subject.register(Arc::new(move |event: &OttrkFileWritten| {
            written.lock().unwrap().push(event.clone());
            Ok(())
        }));
    }

    for chunk in &finished_chunks {
        if chunk.frames.iter().all(|f| f.detections.is_empty()) {
            continue;
        }
        let otdet_metadata = output
            .otdet_metadata
            .get(&chunk.file)
            .ok_or_else(|| err!(TrackerInvariantViolated, msg("missing otdet metadata for {:?}", chunk.file)))?;
        let ottrk = export::build_ottrk_for_chunk(chunk, otdet_metadata, config.iou, tracking_run_id)?;
        let path = export::ottrk_path(&chunk.file);
        export::write_ottrk(&path, &ottrk, config.overwrite, &subject)?;
    }

    Ok(Arc::try_unwrap(written).expect("no observer outlives run_track").into_inner().unwrap())
}

/// Per-stream mutable tracking state shared between the frame-source
/// callback (runs inline, once per frame) and the OTDET-flush observer
/// (runs inline, once per segment): one IOU run and one id generator for
/// the whole stream, a streaming exporter accumulating tracked frames
/// until their segment's OTDET has been written, and the set of track ids
/// observed since the last flush.
struct StreamTrackState {
    tracker: IouTracker,
    idgen: TrackIdGenerator,
    exporter: StreamTrackExporter,
    segment_track_ids: HashSet<TrackId>,
}

/// Runs the stream-mode pipeline until `shutdown` fires: RTSP ingestion
/// (C1) feeds the detector (C2) and the detected-frame buffer (C3), whose
/// flushes write OTDET artifacts (C4); every detected frame is also run
/// through one continuous IOU tracker (streaming C5), and the streaming
/// exporter (C9/§4.9) drains finished segments into OTTRK artifacts as
/// their tracks close.
///
/// Enforces the spec §4.1 invariant that `t_min`/`t_miss_max` stay below
/// `flush_buffer_size` once at startup, rather than inside the frame source
/// itself, since it is a property of the whole pipeline wiring rather than
/// of RTSP ingestion alone.
pub async fn run_stream(
    stream_config: &StreamConfig,
    detect_config: &DetectConfig,
    track_config: &TrackConfig,
    detector: &dyn Detector,
    shutdown: ShutdownReceiver,
) -> Result<(), Error> {
    crate::config::validate_stream_track_invariant(stream_config, &track_config.iou)?;

    let source = StreamFrameSource::new();
    let buffer = Arc::new(DetectedFrameBuffer::new());
    let state = Arc::new(Mutex::new(StreamTrackState {
        tracker: IouTracker::new(track_config.iou),
        idgen: TrackIdGenerator::new(),
        exporter: StreamTrackExporter::new(track_config.keep_discarded, track_config.iou, Uuid::new_v4()),
        segment_track_ids: HashSet::new(),
    }));

    {
        let detect_config = detect_config.clone();
        let track_config = track_config.clone();
        let detector_meta = detector.metadata().clone();
        let state = state.clone();
        buffer.on_buffer_event.register(Arc::new(move |event: &DetectedFrameBufferEvent| {
            write_stream_segment(event, &detect_config, &track_config, &detector_meta, &state)
        }));
    }
    {
        let buffer = buffer.clone();
        source.on_flush.register(Arc::new(move |event: &FlushEvent| {
            buffer.on_flush(event);
            Ok(())
        }));
    }

    source
        .produce(stream_config, shutdown, &base::clock::RealClocks, |frame| {
            let detected = detect::detect_one(detector, frame)?;
            buffer.observe(&detected);

            let mut state = state.lock().unwrap();
            let StreamTrackState {
                tracker,
                idgen,
                exporter,
                segment_track_ids,
            } = &mut *state;
            let tracked = tracker.track_frame(detected.frame, detected.detections, idgen)?;
            segment_track_ids.extend(tracked.observed_tracks());
            exporter.on_tracked_frame(tracked);
            Ok(())
        })
        .await
}

/// Writes one segment's OTDET artifact and immediately feeds the streaming
/// exporter (C9) a ready-input built from that same write, persisting any
/// OTTRK artifact that becomes ready as a result.
///
/// OTDET artifacts in stream mode are saved alongside the segment's own
/// intended output path rather than derived from a source stem — there is
/// no meaningful file stem for an RTSP URL. Appending `.otdet` (not
/// swapping the extension) keeps `path.with_extension("")` in
/// `otdet::parse_otdet` equal to that exact output string, which is what
/// every `TrackedFrame::frame.output` in this segment is keyed on.
fn write_stream_segment(
    event: &DetectedFrameBufferEvent,
    detect_config: &DetectConfig,
    track_config: &TrackConfig,
    detector_meta: &crate::detect::ObjectDetectorMetadata,
    state: &Arc<Mutex<StreamTrackState>>,
) -> Result<(), Error> {
    let otdet_file = otdet::build_otdet(event, detect_config, detector_meta);
    let path = PathBuf::from(format!("{}.otdet", event.source_metadata.output));
    let otdet_subject: SyncSubject<OtdetFileWritten> = SyncSubject::new();
    otdet::write_otdet(&path, &otdet_file, detect_config.overwrite, &otdet_subject)?;

    let outputs = {
        let mut state = state.lock().unwrap();
        let active: HashSet<TrackId> = state.tracker.active_track_ids().into_iter().collect();
        let hint: HashSet<TrackId> = state.segment_track_ids.intersection(&active).copied().collect();
        state.segment_track_ids.clear();

        let ready = export::ready_input_from_otdet(&path, Some(hint))?;
        state.exporter.on_otdet_written(&ready)?
    };

    let ottrk_subject: SyncSubject<OttrkFileWritten> = SyncSubject::new();
    for (ottrk_path, ottrk) in outputs {
        export::write_ottrk(&ottrk_path, &ottrk, track_config.overwrite, &ottrk_subject)?;
    }
    Ok(())
}
