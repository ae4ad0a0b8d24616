//! Builder for synthetic recording files used by decoder tests.

use crate::replay::events;

pub struct LogBuilder {
    bytes: Vec<u8>,
}

impl LogBuilder {
    pub fn new() -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(events::MAGIC);
        bytes.extend_from_slice(&events::VERSION.to_le_bytes());
        Self { bytes }
    }

    fn block(mut self, kind: u8, body: &[u8]) -> Self {
        self.bytes.push(kind);
        self.bytes
            .extend_from_slice(&u32::try_from(body.len()).unwrap().to_le_bytes());
        self.bytes.extend_from_slice(body);
        self
    }

    pub fn frame(self, frame: u64, sim_time: f64) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&frame.to_le_bytes());
        body.extend_from_slice(&sim_time.to_le_bytes());
        self.block(events::KIND_FRAME_START, &body)
    }

    pub fn actor_create(self, actor: u32, role: &str) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&actor.to_le_bytes());
        body.extend_from_slice(&u16::try_from(role.len()).unwrap().to_le_bytes());
        body.extend_from_slice(role.as_bytes());
        self.block(events::KIND_ACTOR_CREATE, &body)
    }

    pub fn actor_destroy(self, actor: u32) -> Self {
        self.block(events::KIND_ACTOR_DESTROY, &actor.to_le_bytes())
    }

    pub fn transform(self, actor: u32, position: [f32; 3], rotation: [f32; 3]) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&actor.to_le_bytes());
        for value in position.into_iter().chain(rotation) {
            body.extend_from_slice(&value.to_le_bytes());
        }
        self.block(events::KIND_TRANSFORM, &body)
    }

    pub fn kinematics(self, actor: u32, velocity: [f32; 3], acceleration: [f32; 3]) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&actor.to_le_bytes());
        for value in velocity.into_iter().chain(acceleration) {
            body.extend_from_slice(&value.to_le_bytes());
        }
        self.block(events::KIND_KINEMATICS, &body)
    }

    pub fn control(self, actor: u32, throttle: f32, brake: f32, steer: f32) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&actor.to_le_bytes());
        body.extend_from_slice(&throttle.to_le_bytes());
        body.extend_from_slice(&brake.to_le_bytes());
        body.extend_from_slice(&steer.to_le_bytes());
        self.block(events::KIND_CONTROL, &body)
    }

    pub fn collision(self, actor: u32, other: u32) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&actor.to_le_bytes());
        body.extend_from_slice(&other.to_le_bytes());
        self.block(events::KIND_COLLISION, &body)
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
