//! Chunked framing for tunnel payloads.
//!
//! A data channel caps single frames at the negotiated message size, so a
//! wire message larger than the cap travels as a run of chunk frames sharing
//! a message id. Reassembly is order-insensitive and duplicate-tolerant; a
//! partial message that makes no progress for the stall timeout is dropped.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

const CHUNK_MAGIC: u8 = 0xD7;
const WHOLE_MAGIC: u8 = 0xD0;
const HEADER_LEN: usize = 1 + 16 + 4 + 4;
/// Concurrent partial messages per peer; the oldest is evicted beyond this.
const MAX_INFLIGHT_PARTIALS: usize = 1024;
/// Completed message ids remembered so late duplicates are dropped instead
/// of seeding a phantom partial.
const COMPLETED_MEMORY: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("payload exceeds the negotiated limit: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("chunk frame malformed: {0}")]
    Malformed(&'static str),
}

/// Framing limits, derived from the signaling exchange.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLimits {
    /// Largest single frame the peer accepts.
    pub max_frame_bytes: usize,
    /// Largest logical payload accepted for reassembly.
    pub max_payload_bytes: usize,
    /// Partial messages idle longer than this are discarded.
    pub stall_timeout: Duration,
}

impl ChunkLimits {
    pub fn payload_capacity(&self) -> usize {
        self.max_frame_bytes.saturating_sub(HEADER_LEN).max(1)
    }

    /// Most chunks any in-bounds payload can decompose into.
    pub fn max_chunks(&self) -> usize {
        let capacity = self.payload_capacity();
        (self.max_payload_bytes + capacity - 1) / capacity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub msg_id: u128,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

/// Encode a payload into tunnel frames: one whole-message frame when it
/// fits, a chunk run otherwise.
pub fn encode_payload(
    payload: &[u8],
    msg_id: u128,
    limits: &ChunkLimits,
) -> Result<Vec<Bytes>, ChunkError> {
    if payload.len() > limits.max_payload_bytes {
        return Err(ChunkError::PayloadTooLarge(payload.len()));
    }
    if payload.len() + 1 <= limits.max_frame_bytes {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(WHOLE_MAGIC);
        buf.extend_from_slice(payload);
        return Ok(vec![Bytes::from(buf)]);
    }

    let capacity = limits.payload_capacity();
    let chunks: Vec<&[u8]> = payload.chunks(capacity).collect();
    let total = u32::try_from(chunks.len()).map_err(|_| ChunkError::Malformed("total overflow"))?;
    let mut frames = Vec::with_capacity(chunks.len());
    for (seq, chunk) in chunks.into_iter().enumerate() {
        let mut buf = Vec::with_capacity(HEADER_LEN + chunk.len());
        buf.push(CHUNK_MAGIC);
        buf.extend_from_slice(&msg_id.to_be_bytes());
        buf.extend_from_slice(&(seq as u32).to_be_bytes());
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(chunk);
        frames.push(Bytes::from(buf));
    }
    Ok(frames)
}

#[derive(Debug)]
struct PartialMessage {
    last_progress: Instant,
    total: u32,
    received: u32,
    received_bytes: usize,
    chunks: Vec<Option<Bytes>>,
}

/// Per-peer reassembly state.
pub struct Reassembler {
    partials: HashMap<u128, PartialMessage>,
    completed: VecDeque<u128>,
    limits: ChunkLimits,
}

impl Reassembler {
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            partials: HashMap::new(),
            completed: VecDeque::new(),
            limits,
        }
    }

    /// Feed one inbound tunnel frame. Returns the full payload once the last
    /// missing chunk arrives.
    pub fn ingest(&mut self, bytes: &[u8], now: Instant) -> Result<Option<Bytes>, ChunkError> {
        match bytes.first().copied() {
            Some(WHOLE_MAGIC) => {
                let payload = &bytes[1..];
                if payload.len() > self.limits.max_payload_bytes {
                    return Err(ChunkError::PayloadTooLarge(payload.len()));
                }
                Ok(Some(Bytes::copy_from_slice(payload)))
            }
            Some(CHUNK_MAGIC) => self.ingest_chunk(decode_chunk(bytes)?, now),
            _ => Err(ChunkError::Malformed("unknown frame magic")),
        }
    }

    fn ingest_chunk(
        &mut self,
        frame: ChunkFrame,
        now: Instant,
    ) -> Result<Option<Bytes>, ChunkError> {
        // bound the allocation before trusting the claimed total
        if frame.total as usize > self.limits.max_chunks() {
            return Err(ChunkError::PayloadTooLarge(
                frame.total as usize * self.limits.payload_capacity(),
            ));
        }
        if frame.payload.len() > self.limits.payload_capacity() {
            return Err(ChunkError::PayloadTooLarge(frame.payload.len()));
        }
        // a late duplicate of a finished message must not seed a new partial
        if self.completed.contains(&frame.msg_id) {
            return Ok(None);
        }
        if !self.partials.contains_key(&frame.msg_id)
            && self.partials.len() >= MAX_INFLIGHT_PARTIALS
        {
            self.evict_oldest();
        }
        let entry = self
            .partials
            .entry(frame.msg_id)
            .or_insert_with(|| PartialMessage {
                last_progress: now,
                total: frame.total,
                received: 0,
                received_bytes: 0,
                chunks: vec![None; frame.total as usize],
            });
        if entry.total != frame.total {
            self.partials.remove(&frame.msg_id);
            return Err(ChunkError::Malformed("chunk total changed mid-message"));
        }
        let slot = frame.seq as usize;
        if entry.chunks[slot].is_none() {
            entry.received += 1;
            entry.received_bytes = entry.received_bytes.saturating_add(frame.payload.len());
            entry.chunks[slot] = Some(frame.payload);
            entry.last_progress = now;
            if entry.received_bytes > self.limits.max_payload_bytes {
                self.partials.remove(&frame.msg_id);
                return Err(ChunkError::PayloadTooLarge(0));
            }
        }
        if entry.received < entry.total {
            return Ok(None);
        }
        let entry = self
            .partials
            .remove(&frame.msg_id)
            .ok_or(ChunkError::Malformed("partial vanished"))?;
        self.completed.push_back(frame.msg_id);
        if self.completed.len() > COMPLETED_MEMORY {
            self.completed.pop_front();
        }
        let mut combined = Vec::with_capacity(entry.received_bytes);
        for chunk in &entry.chunks {
            let chunk = chunk
                .as_ref()
                .ok_or(ChunkError::Malformed("missing chunk at completion"))?;
            combined.extend_from_slice(chunk);
        }
        Ok(Some(Bytes::from(combined)))
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .partials
            .iter()
            .min_by_key(|(_, p)| p.last_progress)
            .map(|(msg_id, _)| *msg_id);
        if let Some(msg_id) = oldest {
            self.partials.remove(&msg_id);
        }
    }

    /// Drop partials that stalled. Returns how many were discarded.
    pub fn gc(&mut self, now: Instant) -> usize {
        let stall = self.limits.stall_timeout;
        let before = self.partials.len();
        self.partials
            .retain(|_, p| now.saturating_duration_since(p.last_progress) <= stall);
        before - self.partials.len()
    }

    #[cfg(test)]
    fn inflight(&self) -> usize {
        self.partials.len()
    }
}

fn decode_chunk(bytes: &[u8]) -> Result<ChunkFrame, ChunkError> {
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::Malformed("chunk frame too short"));
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[1..17]);
    let seq = u32::from_be_bytes(bytes[17..21].try_into().expect("4 bytes"));
    let total = u32::from_be_bytes(bytes[21..25].try_into().expect("4 bytes"));
    if total == 0 {
        return Err(ChunkError::Malformed("chunk total cannot be zero"));
    }
    if seq >= total {
        return Err(ChunkError::Malformed("chunk seq exceeds total"));
    }
    Ok(ChunkFrame {
        msg_id: u128::from_be_bytes(id),
        seq,
        total,
        payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::thread_rng;

    fn limits(max_frame: usize) -> ChunkLimits {
        ChunkLimits {
            max_frame_bytes: max_frame,
            max_payload_bytes: 64 * 1024,
            stall_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn small_payload_travels_whole() {
        let frames = encode_payload(b"tiny", 1, &limits(1024)).unwrap();
        assert_eq!(frames.len(), 1);
        let mut r = Reassembler::new(limits(1024));
        let out = r.ingest(&frames[0], Instant::now()).unwrap().unwrap();
        assert_eq!(out.as_ref(), b"tiny");
    }

    #[test]
    fn large_payload_chunks_and_reassembles_out_of_order() {
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let mut frames = encode_payload(&payload, 42, &limits(256)).unwrap();
        assert!(frames.len() > 2);
        frames.shuffle(&mut thread_rng());
        // duplicate one frame to exercise dedupe
        frames.push(frames[0].clone());

        let mut r = Reassembler::new(limits(256));
        let mut recovered = None;
        for frame in &frames {
            if let Some(done) = r.ingest(frame, Instant::now()).unwrap() {
                recovered = Some(done);
            }
        }
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
        assert_eq!(r.inflight(), 0);
    }

    #[test]
    fn stalled_partial_is_collected() {
        let payload = vec![9u8; 4000];
        let frames = encode_payload(&payload, 7, &limits(256)).unwrap();
        let mut r = Reassembler::new(limits(256));
        let t0 = Instant::now();
        r.ingest(&frames[0], t0).unwrap();
        assert_eq!(r.gc(t0 + Duration::from_millis(20)), 0);
        assert_eq!(r.gc(t0 + Duration::from_millis(100)), 1);
        assert_eq!(r.inflight(), 0);
    }

    fn chunk_frame(msg_id: u128, seq: u32, total: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![CHUNK_MAGIC];
        buf.extend_from_slice(&msg_id.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn absurd_claimed_total_is_rejected_before_allocating() {
        let mut r = Reassembler::new(limits(256));
        let frame = chunk_frame(99, 0, 50_000_000, b"x");
        assert!(matches!(
            r.ingest(&frame, Instant::now()),
            Err(ChunkError::PayloadTooLarge(_))
        ));
        assert_eq!(r.inflight(), 0);
    }

    #[test]
    fn duplicate_after_completion_does_not_seed_a_partial() {
        let payload = vec![3u8; 1000];
        let frames = encode_payload(&payload, 11, &limits(256)).unwrap();
        let mut r = Reassembler::new(limits(256));
        let mut done = None;
        for frame in &frames {
            if let Some(out) = r.ingest(frame, Instant::now()).unwrap() {
                done = Some(out);
            }
        }
        assert_eq!(done.as_deref(), Some(payload.as_slice()));
        assert!(r.ingest(&frames[0], Instant::now()).unwrap().is_none());
        assert_eq!(r.inflight(), 0);
    }

    #[test]
    fn inflight_partials_are_capped() {
        let payload = vec![5u8; 1000];
        let mut r = Reassembler::new(limits(256));
        for id in 0..(MAX_INFLIGHT_PARTIALS as u128 + 40) {
            let frames = encode_payload(&payload, id, &limits(256)).unwrap();
            r.ingest(&frames[0], Instant::now()).unwrap();
        }
        assert!(r.inflight() <= MAX_INFLIGHT_PARTIALS);
    }

    #[test]
    fn oversize_payload_is_refused_at_encode() {
        let payload = vec![0u8; 128 * 1024];
        assert!(matches!(
            encode_payload(&payload, 3, &limits(256)),
            Err(ChunkError::PayloadTooLarge(_))
        ));
    }
}
