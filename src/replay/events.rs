//! Recording wire blocks.
//!
//! A recording is `SREC` + u16 LE version, then self-delimited blocks of
//! `[u8 kind][u32 LE length][body]`. Unknown kinds are skipped by their
//! declared length so newer servers can add block types without breaking
//! older decoders.

use crate::error::ReplayError;

pub const MAGIC: &[u8; 4] = b"SREC";
pub const VERSION: u16 = 1;

pub const KIND_FRAME_START: u8 = 0x01;
pub const KIND_ACTOR_CREATE: u8 = 0x02;
pub const KIND_ACTOR_DESTROY: u8 = 0x03;
pub const KIND_TRANSFORM: u8 = 0x04;
pub const KIND_KINEMATICS: u8 = 0x05;
pub const KIND_CONTROL: u8 = 0x06;
pub const KIND_COLLISION: u8 = 0x07;

/// One decoded block. `Unknown` carries only the kind; its body was
/// consumed and dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    FrameStart {
        frame: u64,
        sim_time: f64,
    },
    ActorCreate {
        actor: u32,
        role: String,
    },
    ActorDestroy {
        actor: u32,
    },
    /// Position and rotation in the simulator frame (left-handed, degrees).
    Transform {
        actor: u32,
        position: [f32; 3],
        rotation: [f32; 3],
    },
    Kinematics {
        actor: u32,
        velocity: [f32; 3],
        acceleration: [f32; 3],
    },
    Control {
        actor: u32,
        throttle: f32,
        brake: f32,
        steer: f32,
    },
    Collision {
        actor: u32,
        other: u32,
    },
    Unknown {
        kind: u8,
    },
}

struct Cursor<'a> {
    body: &'a [u8],
    offset: usize,
    kind: u8,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ReplayError> {
        let end = self.offset.checked_add(n).filter(|&e| e <= self.body.len());
        let Some(end) = end else {
            return Err(ReplayError::Corrupt(format!(
                "event 0x{:02x} body too short ({} bytes)",
                self.kind,
                self.body.len()
            )));
        };
        let slice = &self.body[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, ReplayError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ReplayError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, ReplayError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, ReplayError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn vec3(&mut self) -> Result<[f32; 3], ReplayError> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }
}

/// Parses one block body. The caller has already consumed the header and
/// read exactly `body` bytes.
pub fn parse_event(kind: u8, body: &[u8]) -> Result<RecordingEvent, ReplayError> {
    let mut cursor = Cursor {
        body,
        offset: 0,
        kind,
    };
    let event = match kind {
        KIND_FRAME_START => RecordingEvent::FrameStart {
            frame: cursor.u64()?,
            sim_time: cursor.f64()?,
        },
        KIND_ACTOR_CREATE => {
            let actor = cursor.u32()?;
            let len = u16::from_le_bytes(cursor.take(2)?.try_into().unwrap()) as usize;
            let role = String::from_utf8_lossy(cursor.take(len)?).into_owned();
            RecordingEvent::ActorCreate { actor, role }
        }
        KIND_ACTOR_DESTROY => RecordingEvent::ActorDestroy {
            actor: cursor.u32()?,
        },
        KIND_TRANSFORM => RecordingEvent::Transform {
            actor: cursor.u32()?,
            position: cursor.vec3()?,
            rotation: cursor.vec3()?,
        },
        KIND_KINEMATICS => RecordingEvent::Kinematics {
            actor: cursor.u32()?,
            velocity: cursor.vec3()?,
            acceleration: cursor.vec3()?,
        },
        KIND_CONTROL => RecordingEvent::Control {
            actor: cursor.u32()?,
            throttle: cursor.f32()?,
            brake: cursor.f32()?,
            steer: cursor.f32()?,
        },
        KIND_COLLISION => RecordingEvent::Collision {
            actor: cursor.u32()?,
            other: cursor.u32()?,
        },
        other => RecordingEvent::Unknown { kind: other },
    };
    Ok(event)
}
