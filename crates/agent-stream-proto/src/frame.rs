use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::ProtoResult;

/// Upper bound on bytes carried between chunks while waiting for a frame to
/// complete. Anything beyond this is discarded rather than held forever.
pub const MAX_PENDING_FRAME_BYTES: usize = 1024 * 1024;

/// One JSON object emitted by the agent's `fs/stream` and `fs/logs` endpoints.
///
/// `offset` is the absolute file offset immediately after `data`. An object
/// with neither data nor a file event is a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StreamFrame {
    #[serde(default)]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_event: Option<String>,
}

impl StreamFrame {
    pub fn is_heartbeat(&self) -> bool {
        self.data.as_deref().map_or(true, str::is_empty)
            && self.file_event.as_deref().map_or(true, str::is_empty)
    }

    pub fn decode_data(&self) -> ProtoResult<Vec<u8>> {
        match self.data.as_deref() {
            Some(data) if !data.is_empty() => Ok(STANDARD.decode(data)?),
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Data { offset: u64, bytes: Vec<u8> },
    FileEvent { offset: u64, event: String },
}

impl DecodedFrame {
    pub fn offset(&self) -> u64 {
        match self {
            DecodedFrame::Data { offset, .. } | DecodedFrame::FileEvent { offset, .. } => *offset,
        }
    }
}

/// Result of feeding one network chunk to a [`FrameDecoder`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub frames: Vec<DecodedFrame>,
    pub dropped: usize,
}

/// Incremental decoder for concatenated [`StreamFrame`] objects.
///
/// Frames may be split across chunks; the incomplete tail is carried into the
/// next `feed`. A malformed frame is dropped and decoding resumes at the next
/// frame boundary, even when that boundary arrives in a later chunk. A frame
/// whose `Data` is not valid base64 is skipped on its own. Output order always
/// matches input order.
#[derive(Debug)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    max_pending: usize,
    resyncing: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING_FRAME_BYTES)
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_pending,
            resyncing: false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.resyncing = false;
    }

    pub fn feed(&mut self, chunk: &[u8]) -> FrameBatch {
        self.pending.extend_from_slice(chunk);
        let mut batch = FrameBatch::default();
        loop {
            if self.resyncing {
                match next_frame_start(&self.pending) {
                    Resync::At(start) => {
                        self.pending.drain(..start);
                        self.resyncing = false;
                    }
                    Resync::Skip(skip) => {
                        self.pending.drain(..skip);
                        break;
                    }
                }
            }
            if !self.decode_pending(&mut batch) {
                break;
            }
            batch.dropped += 1;
            self.resyncing = true;
        }
        if self.pending.len() > self.max_pending {
            self.pending.clear();
            self.resyncing = true;
            batch.dropped += 1;
        }
        batch
    }

    /// Decodes and drains every complete frame in `pending`. Returns `true`
    /// when decoding stopped on a malformed frame, which is left at the front.
    fn decode_pending(&mut self, batch: &mut FrameBatch) -> bool {
        let mut consumed = 0;
        let mut malformed = false;
        {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.pending).into_iter::<StreamFrame>();
            loop {
                match stream.next() {
                    Some(Ok(frame)) => {
                        consumed = stream.byte_offset();
                        push_frame(batch, frame);
                    }
                    Some(Err(err)) if err.is_eof() => break,
                    Some(Err(_)) => {
                        malformed = true;
                        break;
                    }
                    None => {
                        consumed = self.pending.len();
                        break;
                    }
                }
            }
        }
        self.pending.drain(..consumed);
        malformed
    }
}

enum Resync {
    /// A frame starts at this index.
    At(usize),
    /// No frame start yet; this many leading bytes can never begin one.
    Skip(usize),
}

/// Finds the next `{` that directly follows a `}` (ignoring whitespace).
/// Frames are written back to back, so that pair marks a frame boundary.
/// Index 0 is never a match: the caller is sitting on a frame it rejected.
fn next_frame_start(buf: &[u8]) -> Resync {
    let mut last_close = None;
    for (i, &byte) in buf.iter().enumerate() {
        match byte {
            b'{' if last_close.is_some() => return Resync::At(i),
            b'}' => last_close = Some(i),
            b' ' | b'\n' | b'\r' | b'\t' => {}
            _ => last_close = None,
        }
    }
    Resync::Skip(last_close.unwrap_or(buf.len()))
}

fn push_frame(batch: &mut FrameBatch, frame: StreamFrame) {
    if frame.is_heartbeat() {
        return;
    }
    if let Some(event) = frame.file_event.as_deref().filter(|e| !e.is_empty()) {
        batch.frames.push(DecodedFrame::FileEvent {
            offset: frame.offset,
            event: event.to_string(),
        });
        return;
    }
    match frame.decode_data() {
        Ok(bytes) => batch.frames.push(DecodedFrame::Data {
            offset: frame.offset,
            bytes,
        }),
        Err(_) => batch.dropped += 1,
    }
}
