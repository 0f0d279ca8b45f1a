//! Chunked/grouped tracker (C6, spec §4.6): partitions OTDET files into
//! frame groups by hostname + temporal adjacency, runs the IOU tracker
//! (C5) once per group with frame numbers dense across the group, and
//! emits one [`TrackedChunk`] per file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base::{err, Error};
use jiff::{Span, Timestamp};
use tracing::warn;

use crate::config::IouParams;
use crate::export::ottrk_path;
use crate::filename;
use crate::idgen::TrackIdGenerator;
use crate::model::{
    hostnames_and_gap_mergeable, DetectedFrame, FrameGroup, FrameNo, SegmentMetadata, TrackedChunk, TrackedFrame,
};
use crate::otdet::{self, OtdetMetadata};

use super::iou::IouTracker;
use super::Tracker;

struct ParsedFile {
    path: PathBuf,
    hostname: String,
    start: Timestamp,
    end: Timestamp,
    otdet_metadata: OtdetMetadata,
    frames: Vec<DetectedFrame>,
    segment_metadata: SegmentMetadata,
}

fn parse_file(path: &Path) -> Result<ParsedFile, Error> {
    let parsed_name = filename::parse(path)?;
    let (otdet, frames, segment_metadata) = otdet::parse_otdet(path)?;
    let duration = Span::new().seconds(segment_metadata.duration_secs.round() as i64);
    let end = parsed_name
        .start
        .checked_add(duration)
        .unwrap_or(parsed_name.start);
    Ok(ParsedFile {
        path: path.to_path_buf(),
        hostname: parsed_name.hostname,
        start: parsed_name.start,
        end,
        otdet_metadata: otdet.metadata,
        frames,
        segment_metadata,
    })
}

struct GroupBuilder {
    hostname: String,
    start: Timestamp,
    end: Timestamp,
    files: Vec<ParsedFile>,
}

/// Output of running the chunked tracker over a set of OTDET files.
pub struct ChunkedTrackingOutput {
    pub groups: Vec<FrameGroup>,
    pub chunks: Vec<TrackedChunk>,
    pub otdet_metadata: HashMap<PathBuf, OtdetMetadata>,
}

/// Runs C6 end to end: parse, group, track.
pub fn track_files(
    paths: &[PathBuf],
    params: IouParams,
    merge_threshold: Span,
    overwrite: bool,
) -> Result<ChunkedTrackingOutput, Error> {
    let mut parsed = Vec::with_capacity(paths.len());
    for p in paths {
        match parse_file(p) {
            Ok(f) => parsed.push(f),
            Err(e) => {
                warn!(path = %p.display(), error = %e.chain(), "skipping unparseable otdet file");
            }
        }
    }
    parsed.sort_by_key(|f| f.start);

    let mut builders: Vec<GroupBuilder> = Vec::new();
    for file in parsed {
        let should_merge = builders
            .last()
            .map(|g| hostnames_and_gap_mergeable(&g.hostname, g.end, &file.hostname, file.start, merge_threshold))
            .unwrap_or(false);

        if should_merge {
            let g = builders.last_mut().unwrap();
            if file.end > g.end {
                g.end = file.end;
            }
            g.files.push(file);
        } else {
            builders.push(GroupBuilder {
                hostname: file.hostname.clone(),
                start: file.start,
                end: file.end,
                files: vec![file],
            });
        }
    }

    let mut groups = Vec::with_capacity(builders.len());
    let mut all_chunks = Vec::new();
    let mut all_metadata = HashMap::new();

    for (id, builder) in builders.into_iter().enumerate() {
        let id = id as u64;
        let group_outputs: Vec<PathBuf> = builder.files.iter().map(|f| ottrk_path(&f.path)).collect();
        if !overwrite && group_outputs.iter().any(|p| p.exists()) {
            warn!(group_id = id, "skipping group: at least one output already exists");
            continue;
        }

        let mut metadata_by_file = HashMap::new();
        let file_paths: Vec<PathBuf> = builder.files.iter().map(|f| f.path.clone()).collect();
        for f in &builder.files {
            metadata_by_file.insert(f.path.clone(), f.segment_metadata.clone());
            all_metadata.insert(f.path.clone(), f.otdet_metadata.clone());
        }

        let frame_group = FrameGroup {
            id,
            start: builder.start,
            end: builder.end,
            hostname: builder.hostname.clone(),
            files: file_paths,
            metadata_by_file,
        };

        let mut tracker = IouTracker::new(params);
        let idgen = TrackIdGenerator::new();
        let mut frame_offset: u64 = 0;
        let n_files = builder.files.len();

        for (file_idx, file) in builder.files.into_iter().enumerate() {
            let is_last_chunk = file_idx + 1 == n_files;
            let chunk = track_one_file(
                file,
                id,
                is_last_chunk,
                frame_offset,
                &mut tracker,
                &idgen,
            )?;
            frame_offset += chunk.frames.len() as u64;
            all_chunks.push(chunk);
        }

        groups.push(frame_group);
    }

    Ok(ChunkedTrackingOutput {
        groups,
        chunks: all_chunks,
        otdet_metadata: all_metadata,
    })
}

fn track_one_file(
    file: ParsedFile,
    frame_group_id: u64,
    is_last_chunk: bool,
    frame_offset: u64,
    tracker: &mut IouTracker,
    idgen: &TrackIdGenerator,
) -> Result<TrackedChunk, Error> {
    let mut frames = Vec::with_capacity(file.frames.len());
    let mut finished_tracks = std::collections::HashSet::new();
    let mut discarded_tracks = std::collections::HashSet::new();
    let mut last_track_frame: HashMap<_, FrameNo> = HashMap::new();

    for mut df in file.frames {
        df.frame.no += frame_offset;
        let no = df.frame.no;
        let tf: TrackedFrame = tracker.track_frame(df.frame, df.detections, idgen)?;
        for d in &tf.detections {
            last_track_frame.insert(d.track_id, no);
        }
        finished_tracks.extend(&tf.finished_tracks);
        discarded_tracks.extend(&tf.discarded_tracks);
        frames.push(tf);
    }

    if is_last_chunk {
        let remaining = tracker.active_track_ids();
        if !remaining.is_empty() {
            if let Some(last_frame) = frames.last_mut() {
                for id in &remaining {
                    last_frame.finished_tracks.insert(*id);
                }
            }
            finished_tracks.extend(remaining);
        }
    }

    let observed: std::collections::HashSet<_> =
        frames.iter().flat_map(|f| f.observed_tracks()).collect();
    let closed: std::collections::HashSet<_> = finished_tracks.union(&discarded_tracks).copied().collect();
    let unfinished_tracks: std::collections::HashSet<_> = observed.difference(&closed).copied().collect();

    if finished_tracks.intersection(&discarded_tracks).next().is_some() {
        return Err(err!(
            TrackerInvariantViolated,
            msg("track appears in both finished and discarded sets in {:?}", file.path)
        ));
    }

    Ok(TrackedChunk {
        file: file.path,
        metadata: file.segment_metadata,
        frames,
        frame_group_id,
        is_last_chunk,
        finished_tracks,
        discarded_tracks,
        unfinished_tracks,
        last_track_frame,
    })
}
