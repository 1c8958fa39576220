//! Observer streaming: the compact binary world-frame protocol and the JSON
//! agent-narration feed, multiplexed to every registered session.
//!
//! # Wire layout
//!
//! All multi-byte values are big-endian. The current frame layout is:
//!
//! ```text
//! header   (8 bytes): tick u32 | entity_count u16 | resource_count u16
//! entity  (21 bytes): id u32 | x f32 | y f32 | radius f32 | color u32 | flags u8
//! resource (8 bytes): x f32 | y f32
//! ```
//!
//! `flags` bit 0 marks predators, bit 1 marks infected entities. The legacy
//! pre-flags layout (6-byte header, 20-byte entities, no resources) is still
//! encodable and decodable; decoders branch on total length.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use genesis_bus::FeedMessage;
use genesis_core::FrameEntity;

/// Header size of the current frame layout.
pub const HEADER_SIZE: usize = 8;
/// Entity record size of the current frame layout.
pub const ENTITY_RECORD_SIZE: usize = 21;
/// Resource record size.
pub const RESOURCE_RECORD_SIZE: usize = 8;
/// Header size of the legacy (pre-flags) layout.
pub const LEGACY_HEADER_SIZE: usize = 6;
/// Entity record size of the legacy layout.
pub const LEGACY_ENTITY_RECORD_SIZE: usize = 20;

/// Entity flag bits.
pub const FLAG_PREDATOR: u8 = 0b0000_0001;
pub const FLAG_INFECTED: u8 = 0b0000_0010;

/// Frame wire layouts, newest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameLayout {
    /// 6-byte header, 20-byte entities, no resources, no flags.
    Legacy,
    /// 8-byte header, 21-byte entities with flags, 8-byte resources.
    Current,
}

/// Frame codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("frame length {found} does not match any known layout (entities={entities})")]
    Malformed { found: usize, entities: usize },
    #[error("unsupported frame layout {found:?}; this decoder supports up to {supported:?}")]
    UnsupportedLayout {
        found: FrameLayout,
        supported: FrameLayout,
    },
}

/// A decoded world frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub layout: FrameLayout,
    pub tick: u32,
    pub entities: Vec<DecodedEntity>,
    pub resources: Vec<(f32, f32)>,
}

/// One decoded entity record. `flags` is absent in legacy frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedEntity {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub color: u32,
    pub flags: Option<u8>,
}

fn entity_flags(entity: &FrameEntity) -> u8 {
    let mut flags = 0;
    if entity.predator {
        flags |= FLAG_PREDATOR;
    }
    if entity.infected {
        flags |= FLAG_INFECTED;
    }
    flags
}

/// Encode a frame in the current layout.
#[must_use]
pub fn encode_frame(tick: u64, entities: &[FrameEntity], resources: &[(f32, f32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        HEADER_SIZE + entities.len() * ENTITY_RECORD_SIZE + resources.len() * RESOURCE_RECORD_SIZE,
    );
    out.extend_from_slice(&(tick as u32).to_be_bytes());
    out.extend_from_slice(&(entities.len() as u16).to_be_bytes());
    out.extend_from_slice(&(resources.len() as u16).to_be_bytes());
    for entity in entities {
        out.extend_from_slice(&entity.handle.to_be_bytes());
        out.extend_from_slice(&entity.x.to_be_bytes());
        out.extend_from_slice(&entity.y.to_be_bytes());
        out.extend_from_slice(&entity.radius.to_be_bytes());
        out.extend_from_slice(&entity.color.to_be_bytes());
        out.push(entity_flags(entity));
    }
    for (x, y) in resources {
        out.extend_from_slice(&x.to_be_bytes());
        out.extend_from_slice(&y.to_be_bytes());
    }
    out
}

/// Encode a frame in the legacy pre-flags layout.
#[must_use]
pub fn encode_frame_legacy(tick: u64, entities: &[FrameEntity]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(LEGACY_HEADER_SIZE + entities.len() * LEGACY_ENTITY_RECORD_SIZE);
    out.extend_from_slice(&(tick as u32).to_be_bytes());
    out.extend_from_slice(&(entities.len() as u16).to_be_bytes());
    for entity in entities {
        out.extend_from_slice(&entity.handle.to_be_bytes());
        out.extend_from_slice(&entity.x.to_be_bytes());
        out.extend_from_slice(&entity.y.to_be_bytes());
        out.extend_from_slice(&entity.radius.to_be_bytes());
        out.extend_from_slice(&entity.color.to_be_bytes());
    }
    out
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Decode a frame in whichever layout it was encoded. The layout is
/// determined by total length: for a given entity count the two layouts can
/// never produce the same number of bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame, FrameError> {
    if bytes.len() < LEGACY_HEADER_SIZE {
        return Err(FrameError::TooShort(bytes.len()));
    }
    let tick = read_u32(bytes, 0);
    let entity_count = read_u16(bytes, 4) as usize;

    if bytes.len() == LEGACY_HEADER_SIZE + entity_count * LEGACY_ENTITY_RECORD_SIZE {
        let mut entities = Vec::with_capacity(entity_count);
        let mut at = LEGACY_HEADER_SIZE;
        for _ in 0..entity_count {
            entities.push(DecodedEntity {
                id: read_u32(bytes, at),
                x: read_f32(bytes, at + 4),
                y: read_f32(bytes, at + 8),
                radius: read_f32(bytes, at + 12),
                color: read_u32(bytes, at + 16),
                flags: None,
            });
            at += LEGACY_ENTITY_RECORD_SIZE;
        }
        return Ok(DecodedFrame {
            layout: FrameLayout::Legacy,
            tick,
            entities,
            resources: Vec::new(),
        });
    }

    if bytes.len() >= HEADER_SIZE {
        let resource_count = read_u16(bytes, 6) as usize;
        let expected = HEADER_SIZE
            + entity_count * ENTITY_RECORD_SIZE
            + resource_count * RESOURCE_RECORD_SIZE;
        if bytes.len() == expected {
            let mut entities = Vec::with_capacity(entity_count);
            let mut at = HEADER_SIZE;
            for _ in 0..entity_count {
                entities.push(DecodedEntity {
                    id: read_u32(bytes, at),
                    x: read_f32(bytes, at + 4),
                    y: read_f32(bytes, at + 8),
                    radius: read_f32(bytes, at + 12),
                    color: read_u32(bytes, at + 16),
                    flags: Some(bytes[at + 20]),
                });
                at += ENTITY_RECORD_SIZE;
            }
            let mut resources = Vec::with_capacity(resource_count);
            for _ in 0..resource_count {
                resources.push((read_f32(bytes, at), read_f32(bytes, at + 4)));
                at += RESOURCE_RECORD_SIZE;
            }
            return Ok(DecodedFrame {
                layout: FrameLayout::Current,
                tick,
                entities,
                resources,
            });
        }
    }

    Err(FrameError::Malformed { found: bytes.len(), entities: entity_count })
}

/// Decode for clients that only support layouts up to `supported`. A newer
/// layout yields [`FrameError::UnsupportedLayout`] instead of garbage.
pub fn decode_frame_compat(
    bytes: &[u8],
    supported: FrameLayout,
) -> Result<DecodedFrame, FrameError> {
    let frame = decode_frame(bytes)?;
    if frame.layout > supported {
        return Err(FrameError::UnsupportedLayout { found: frame.layout, supported });
    }
    Ok(frame)
}

/// Render a feed message as the narration JSON object sent to observers.
/// Object-shaped metadata is stamped with `metadata_schema_version`.
#[must_use]
pub fn narration_json(message: &FeedMessage) -> String {
    let mut metadata = message.metadata.clone();
    if let serde_json::Value::Object(ref mut map) = metadata {
        map.entry("metadata_schema_version")
            .or_insert_with(|| serde_json::Value::from(1));
    }
    let body = serde_json::json!({
        "agent": message.agent.as_str(),
        "action": message.action,
        "message": message.message,
        "timestamp": message.timestamp,
        "metadata": metadata,
    });
    body.to_string()
}

/// How long a narration send may stall before the session is evicted.
const FEED_SEND_GRACE: Duration = Duration::from_secs(1);
/// Narration queue depth per session.
const FEED_QUEUE_DEPTH: usize = 256;

struct SessionHandle {
    frames: watch::Sender<Option<Arc<Vec<u8>>>>,
    feed: mpsc::Sender<Arc<String>>,
    last_feed: Option<Arc<String>>,
}

/// An observer's receiving half, produced by [`StreamHub::register`].
pub struct StreamSession {
    pub id: u64,
    /// Latest world frame; intermediate frames coalesce away under lag.
    pub frames: watch::Receiver<Option<Arc<Vec<u8>>>>,
    /// Narration lines, in order, never dropped while the session lives.
    pub feed: mpsc::Receiver<Arc<String>>,
}

/// Fan-out hub for observer sessions.
///
/// World frames are idempotent snapshots, so each session holds only the
/// newest one: a slow reader skips intermediate frames instead of queueing
/// them. Narration is queued per session; consecutive identical payloads
/// coalesce, and a session that stalls past the grace is evicted rather than
/// silently losing lines.
#[derive(Default)]
pub struct StreamHub {
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_id: AtomicU64,
}

impl StreamHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("stream hub lock poisoned").len()
    }

    /// Register a new observer session.
    pub fn register(&self) -> StreamSession {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (frame_tx, frame_rx) = watch::channel(None);
        let (feed_tx, feed_rx) = mpsc::channel(FEED_QUEUE_DEPTH);
        self.sessions
            .lock()
            .expect("stream hub lock poisoned")
            .insert(id, SessionHandle { frames: frame_tx, feed: feed_tx, last_feed: None });
        info!(session = id, "observer session registered");
        StreamSession { id, frames: frame_rx, feed: feed_rx }
    }

    /// Remove a session; further broadcasts skip it.
    pub fn unregister(&self, id: u64) {
        if self
            .sessions
            .lock()
            .expect("stream hub lock poisoned")
            .remove(&id)
            .is_some()
        {
            info!(session = id, "observer session unregistered");
        }
    }

    /// Push a world frame to every session. Never blocks; a session that has
    /// not consumed the previous frame simply sees it replaced.
    pub fn broadcast_frame(&self, frame: Vec<u8>) {
        let frame = Arc::new(frame);
        let sessions = self.sessions.lock().expect("stream hub lock poisoned");
        for handle in sessions.values() {
            let _ = handle.frames.send_replace(Some(frame.clone()));
        }
    }

    /// Queue a narration line on every session.
    pub async fn broadcast_narration(&self, message: &FeedMessage) {
        let payload = Arc::new(narration_json(message));
        let targets: Vec<(u64, mpsc::Sender<Arc<String>>)> = {
            let mut sessions = self.sessions.lock().expect("stream hub lock poisoned");
            sessions
                .iter_mut()
                .filter_map(|(id, handle)| {
                    // Identical consecutive payloads coalesce per session.
                    if handle.last_feed.as_ref() == Some(&payload) {
                        debug!(session = *id, "identical narration coalesced");
                        return None;
                    }
                    handle.last_feed = Some(payload.clone());
                    Some((*id, handle.feed.clone()))
                })
                .collect()
        };

        let mut evict = Vec::new();
        for (id, sender) in targets {
            match sender.send_timeout(payload.clone(), FEED_SEND_GRACE).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(session = id, "narration queue stalled; evicting session");
                    evict.push(id);
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => evict.push(id),
            }
        }
        for id in evict {
            self.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_bus::Agent;

    fn entity(handle: u32) -> FrameEntity {
        FrameEntity {
            handle,
            x: handle as f32 * 1.5,
            y: handle as f32 * -2.5,
            radius: 6.0,
            color: 0x0012_34AB,
            predator: handle.is_multiple_of(2),
            infected: handle.is_multiple_of(3),
        }
    }

    #[test]
    fn frame_length_matches_the_layout_law() {
        let entities: Vec<FrameEntity> = (0..5).map(entity).collect();
        let resources = vec![(1.0, 2.0), (3.0, 4.0)];
        let frame = encode_frame(42, &entities, &resources);
        assert_eq!(
            frame.len(),
            HEADER_SIZE + 5 * ENTITY_RECORD_SIZE + 2 * RESOURCE_RECORD_SIZE
        );

        let legacy = encode_frame_legacy(42, &entities);
        assert_eq!(legacy.len(), LEGACY_HEADER_SIZE + 5 * LEGACY_ENTITY_RECORD_SIZE);
    }

    #[test]
    fn current_frame_round_trips() {
        let entities: Vec<FrameEntity> = (0..4).map(entity).collect();
        let resources = vec![(10.5, -3.25), (0.0, 2000.0)];
        let frame = encode_frame(7, &entities, &resources);
        let decoded = decode_frame(&frame).expect("decode");

        assert_eq!(decoded.layout, FrameLayout::Current);
        assert_eq!(decoded.tick, 7);
        assert_eq!(decoded.entities.len(), 4);
        assert_eq!(decoded.resources, resources);
        for (entity, decoded) in entities.iter().zip(&decoded.entities) {
            assert_eq!(decoded.id, entity.handle);
            assert_eq!(decoded.x, entity.x);
            assert_eq!(decoded.y, entity.y);
            assert_eq!(decoded.color, entity.color);
            let flags = decoded.flags.expect("flags");
            assert_eq!(flags & FLAG_PREDATOR != 0, entity.predator);
            assert_eq!(flags & FLAG_INFECTED != 0, entity.infected);
        }
    }

    #[test]
    fn legacy_frame_round_trips_without_flags() {
        let entities: Vec<FrameEntity> = (0..3).map(entity).collect();
        let frame = encode_frame_legacy(9, &entities);
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(decoded.layout, FrameLayout::Legacy);
        assert_eq!(decoded.tick, 9);
        assert!(decoded.entities.iter().all(|e| e.flags.is_none()));
        assert!(decoded.resources.is_empty());
    }

    #[test]
    fn legacy_only_decoder_refuses_current_frames() {
        let entities: Vec<FrameEntity> = (0..2).map(entity).collect();

        let legacy = encode_frame_legacy(1, &entities);
        assert!(decode_frame_compat(&legacy, FrameLayout::Legacy).is_ok());

        let current = encode_frame(1, &entities, &[]);
        let err = decode_frame_compat(&current, FrameLayout::Legacy).unwrap_err();
        assert_eq!(
            err,
            FrameError::UnsupportedLayout {
                found: FrameLayout::Current,
                supported: FrameLayout::Legacy,
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(decode_frame(&[0, 1, 2]), Err(FrameError::TooShort(3)));
        let mut frame = encode_frame(1, &[entity(1)], &[]);
        frame.push(0xFF);
        assert!(matches!(decode_frame(&frame), Err(FrameError::Malformed { .. })));
    }

    #[test]
    fn empty_frame_is_eight_bytes() {
        let frame = encode_frame(123_456, &[], &[]);
        assert_eq!(frame.len(), HEADER_SIZE);
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(decoded.tick, 123_456);
        assert!(decoded.entities.is_empty());
    }

    #[test]
    fn narration_carries_schema_version_in_object_metadata() {
        let message = FeedMessage::new(Agent::Patcher, "mutation_applied", "done")
            .with_metadata(serde_json::json!({"cycle_id": "abc"}));
        let json: serde_json::Value =
            serde_json::from_str(&narration_json(&message)).expect("json");
        assert_eq!(json["agent"], "patcher");
        assert_eq!(json["action"], "mutation_applied");
        assert_eq!(json["metadata"]["metadata_schema_version"], 1);
        assert_eq!(json["metadata"]["cycle_id"], "abc");

        let bare = FeedMessage::new(Agent::System, "note", "hi");
        let json: serde_json::Value =
            serde_json::from_str(&narration_json(&bare)).expect("json");
        assert!(json["metadata"].is_null());
    }

    #[tokio::test]
    async fn slow_sessions_see_only_the_newest_frame() {
        let hub = StreamHub::new();
        let mut session = hub.register();
        for tick in 0..5u64 {
            hub.broadcast_frame(encode_frame(tick, &[], &[]));
        }
        session.frames.changed().await.expect("changed");
        let frame = session.frames.borrow_and_update().clone().expect("frame");
        let decoded = decode_frame(&frame).expect("decode");
        assert_eq!(decoded.tick, 4);
    }

    #[tokio::test]
    async fn narration_is_queued_in_order_and_coalesces_identical() {
        let hub = StreamHub::new();
        let mut session = hub.register();
        let first = FeedMessage {
            agent: Agent::Watcher,
            action: "a".into(),
            message: "one".into(),
            timestamp: 1.0,
            metadata: serde_json::Value::Null,
        };
        let duplicate = first.clone();
        let second = FeedMessage {
            agent: Agent::Coder,
            action: "b".into(),
            message: "two".into(),
            timestamp: 2.0,
            metadata: serde_json::Value::Null,
        };
        hub.broadcast_narration(&first).await;
        hub.broadcast_narration(&duplicate).await;
        hub.broadcast_narration(&second).await;

        let one = session.feed.recv().await.expect("one");
        assert!(one.contains("one"));
        let two = session.feed.recv().await.expect("two");
        assert!(two.contains("two"));
        assert!(session.feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_sessions_stop_receiving() {
        let hub = StreamHub::new();
        let session = hub.register();
        assert_eq!(hub.session_count(), 1);
        hub.unregister(session.id);
        assert_eq!(hub.session_count(), 0);
        hub.broadcast_frame(encode_frame(1, &[], &[]));
    }
}
