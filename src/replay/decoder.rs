//! Streaming decoder for server recording logs.
//!
//! The decoder never loads a recording into memory. Blocks are read one at
//! a time, folded into per-actor state, and a row per tracked actor is
//! emitted each time a frame boundary closes. Actors that stop sending
//! transforms keep their last known pose until a new block or a destroy
//! event arrives.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;

use crate::batch::dataset::heading_from_sim_yaw;
use crate::error::ReplayError;
use crate::replay::events::{self, RecordingEvent};

/// Upper bound on a single block body. Anything larger is a mangled
/// length field, not a real event.
const MAX_EVENT_LEN: u32 = 1 << 20;

/// One actor's state at one frame, converted back to the dataset
/// convention (right-handed, heading in radians).
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub frame: u64,
    pub sim_time: f64,
    pub actor: u32,
    pub role: Option<String>,
    pub position: [f64; 3],
    pub pitch: f64,
    pub heading: f64,
    pub roll: f64,
    pub velocity: [f64; 3],
    pub acceleration: [f64; 3],
    pub throttle: f64,
    pub brake: f64,
    pub steer: f64,
    pub collided: bool,
}

#[derive(Debug, Clone, Default)]
struct ActorTrack {
    role: Option<String>,
    position: [f32; 3],
    rotation: [f32; 3],
    velocity: [f32; 3],
    acceleration: [f32; 3],
    throttle: f32,
    brake: f32,
    steer: f32,
    has_transform: bool,
    collided: bool,
}

impl ActorTrack {
    fn to_record(&self, frame: u64, sim_time: f64, actor: u32) -> FrameRecord {
        let [x, y, z] = self.position;
        let [pitch, yaw, roll] = self.rotation;
        let [vx, vy, vz] = self.velocity;
        let [ax, ay, az] = self.acceleration;
        FrameRecord {
            frame,
            sim_time,
            actor,
            role: self.role.clone(),
            position: [f64::from(x), -f64::from(y), f64::from(z)],
            pitch: f64::from(pitch).to_radians(),
            heading: heading_from_sim_yaw(f64::from(yaw)),
            roll: f64::from(roll).to_radians(),
            velocity: [f64::from(vx), -f64::from(vy), f64::from(vz)],
            acceleration: [f64::from(ax), -f64::from(ay), f64::from(az)],
            throttle: f64::from(self.throttle).clamp(0.0, 1.0),
            brake: f64::from(self.brake).clamp(0.0, 1.0),
            steer: f64::from(self.steer).clamp(-1.0, 1.0),
            collided: self.collided,
        }
    }
}

/// Lazy frame-record iterator over a recording file.
pub struct LogDecoder {
    reader: BufReader<File>,
    tracks: BTreeMap<u32, ActorTrack>,
    current: Option<(u64, f64)>,
    queue: VecDeque<FrameRecord>,
    finished: bool,
}

impl std::fmt::Debug for LogDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogDecoder")
            .field("tracked_actors", &self.tracks.len())
            .field("current", &self.current)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl LogDecoder {
    /// Opens a recording and validates its header. Decoding errors after
    /// this point surface through the iterator.
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| ReplayError::Corrupt("missing file header".to_string()))?;
        if &magic != events::MAGIC {
            return Err(ReplayError::Corrupt("bad magic, not a recording".to_string()));
        }
        let mut version = [0u8; 2];
        reader
            .read_exact(&mut version)
            .map_err(|_| ReplayError::Corrupt("missing file header".to_string()))?;
        let version = u16::from_le_bytes(version);
        if version > events::VERSION {
            return Err(ReplayError::Corrupt(format!(
                "unsupported recording version {version}"
            )));
        }

        Ok(Self {
            reader,
            tracks: BTreeMap::new(),
            current: None,
            queue: VecDeque::new(),
            finished: false,
        })
    }

    /// Reads one block and folds it in. `Ok(false)` means clean EOF; the
    /// trailing frame has been flushed into the queue.
    fn advance(&mut self) -> Result<bool, ReplayError> {
        let mut kind = [0u8; 1];
        match self.reader.read_exact(&mut kind) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                self.flush_frame();
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        let mut len = [0u8; 4];
        self.reader
            .read_exact(&mut len)
            .map_err(|_| ReplayError::Corrupt("truncated event header".to_string()))?;
        let len = u32::from_le_bytes(len);
        if len > MAX_EVENT_LEN {
            return Err(ReplayError::Corrupt(format!(
                "implausible event length {len}"
            )));
        }

        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body).map_err(|_| {
            ReplayError::Corrupt("event length runs past end of file".to_string())
        })?;

        let event = events::parse_event(kind[0], &body)?;
        self.apply(event);
        Ok(true)
    }

    fn apply(&mut self, event: RecordingEvent) {
        match event {
            RecordingEvent::FrameStart { frame, sim_time } => {
                self.flush_frame();
                self.current = Some((frame, sim_time));
            }
            RecordingEvent::ActorCreate { actor, role } => {
                self.tracks.entry(actor).or_default().role = Some(role);
            }
            RecordingEvent::ActorDestroy { actor } => {
                self.tracks.remove(&actor);
            }
            RecordingEvent::Transform {
                actor,
                position,
                rotation,
            } => {
                let track = self.tracks.entry(actor).or_default();
                track.position = position;
                track.rotation = rotation;
                track.has_transform = true;
            }
            RecordingEvent::Kinematics {
                actor,
                velocity,
                acceleration,
            } => {
                let track = self.tracks.entry(actor).or_default();
                track.velocity = velocity;
                track.acceleration = acceleration;
            }
            RecordingEvent::Control {
                actor,
                throttle,
                brake,
                steer,
            } => {
                let track = self.tracks.entry(actor).or_default();
                track.throttle = throttle;
                track.brake = brake;
                track.steer = steer;
            }
            RecordingEvent::Collision { actor, other } => {
                if let Some(track) = self.tracks.get_mut(&actor) {
                    track.collided = true;
                }
                if let Some(track) = self.tracks.get_mut(&other) {
                    track.collided = true;
                }
            }
            RecordingEvent::Unknown { .. } => {}
        }
    }

    /// Emits one row per actor with a known pose for the frame being
    /// closed, then clears the per-frame collision flags.
    fn flush_frame(&mut self) {
        let Some((frame, sim_time)) = self.current else {
            return;
        };
        for (&actor, track) in &self.tracks {
            if track.has_transform {
                self.queue.push_back(track.to_record(frame, sim_time, actor));
            }
        }
        for track in self.tracks.values_mut() {
            track.collided = false;
        }
    }
}

impl Iterator for LogDecoder {
    type Item = Result<FrameRecord, ReplayError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.queue.pop_front() {
                return Some(Ok(record));
            }
            if self.finished {
                return None;
            }
            match self.advance() {
                Ok(true) => {}
                Ok(false) => self.finished = true,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

pub const CSV_HEADER: &str = "frame,time,actor,role,pos_x,pos_y,pos_z,pitch,heading,roll,vel_x,vel_y,vel_z,acc_x,acc_y,acc_z,throttle,brake,steer,collision";

/// Streams decoded frames as CSV rows, optionally restricted to one
/// actor. Returns the number of rows written.
pub fn write_csv<W: Write>(
    decoder: LogDecoder,
    out: &mut W,
    actor: Option<u32>,
) -> Result<u64, ReplayError> {
    writeln!(out, "{CSV_HEADER}")?;
    let mut rows = 0u64;
    for record in decoder {
        let record = record?;
        if let Some(wanted) = actor
            && record.actor != wanted
        {
            continue;
        }
        writeln!(
            out,
            "{},{:.3},{},{},{:.3},{:.3},{:.3},{:.4},{:.4},{:.4},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{}",
            record.frame,
            record.sim_time,
            record.actor,
            record.role.as_deref().unwrap_or(""),
            record.position[0],
            record.position[1],
            record.position[2],
            record.pitch,
            record.heading,
            record.roll,
            record.velocity[0],
            record.velocity[1],
            record.velocity[2],
            record.acceleration[0],
            record.acceleration[1],
            record.acceleration[2],
            record.throttle,
            record.brake,
            record.steer,
            u8::from(record.collided),
        )?;
        rows += 1;
    }
    Ok(rows)
}
