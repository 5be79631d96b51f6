//! Wire framing — length-delimited, self-describing, mandatory checksums.
//!
//! # Frame layout (all integers little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic        = 0x4643484E  ("FCHN", LE u32)
//!    4      1   tag          frame kind discriminant
//!    5      4   payload_len  bytes following the header (LE u32)
//!    9      N   payload      tag-specific, fixed field order
//!  9+N      4   frame_crc32  CRC32(tag ∥ payload)  ← LAST   (LE u32)
//! ```
//!
//! The schema is closed: every frame kind and every field inside it is fixed
//! here.  Nothing on the wire ever names a type, a class, or a code path —
//! a peer can only ever produce the value kinds below.  `payload_len` is
//! capped before any allocation; `frame_crc32` is mandatory and a mismatch
//! aborts the connection.
//!
//! # Block encoding
//! A block frame carries the payload fields and (for a sealed block) the
//! predecessor hash.  Both identity hashes are **recomputed by the decoder**,
//! never read off the wire — a received block therefore always satisfies the
//! hash invariants by construction.
//!
//! # Endianness
//! Every numeric field is little-endian.  This is frozen; a future variant
//! would carry a distinct magic number.

use std::io::{self, Cursor};
use std::net::SocketAddr;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::block::{Block, BlockDraft};

// ── Constants ────────────────────────────────────────────────────────────────

/// Wire magic for every frame.  LE u32.
pub const FRAME_MAGIC: u32 = 0x4643_484E; // "FCHN"

/// Fixed byte size of the frame header (magic + tag + payload_len).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Upper bound on a single payload.  Large enough for a full chain snapshot
/// of any realistic deployment, small enough that a bogus length prefix
/// cannot drive an allocation into the ground.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

// ── Tags ─────────────────────────────────────────────────────────────────────

const TAG_COMMAND:    u8 = 0x01;
const TAG_OK:         u8 = 0x02;
const TAG_ERROR:      u8 = 0x03;
const TAG_END:        u8 = 0x04;
const TAG_NULL:       u8 = 0x05;
const TAG_BOOL:       u8 = 0x06;
const TAG_BYTES:      u8 = 0x07;
const TAG_UINT:       u8 = 0x08;
const TAG_ADDR:       u8 = 0x09;
const TAG_ADDR_LIST:  u8 = 0x0A;
const TAG_DRAFT:      u8 = 0x0B;
const TAG_BLOCK:      u8 = 0x0C;
const TAG_BLOCK_LIST: u8 = 0x0D;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WireError {
    #[error("invalid frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    FrameTooLarge(usize),
    #[error("frame CRC32 mismatch: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
    #[error("malformed {0} payload")]
    BadPayload(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Command ──────────────────────────────────────────────────────────────────

/// The six protocol commands.  One per connection, sent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    InsertBlocks       = 0,
    ContainsFile       = 1,
    GetFile            = 2,
    RegisterPeer       = 3,
    GetBlock           = 4,
    NewBlocksAvailable = 5,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Command::InsertBlocks),
            1 => Some(Command::ContainsFile),
            2 => Some(Command::GetFile),
            3 => Some(Command::RegisterPeer),
            4 => Some(Command::GetBlock),
            5 => Some(Command::NewBlocksAvailable),
            _ => None,
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// One wire message.  The closed value vocabulary of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(Command),
    Ok,
    /// Error code string, e.g. `"FileBlockSplitChanged"`.  Diagnostics only —
    /// never parsed beyond equality.
    Error(String),
    /// Stream terminator sentinel.
    End,
    Null,
    Bool(bool),
    /// Raw bytes — file hashes and block hashes.
    Bytes(Vec<u8>),
    /// Unsigned integer — chain lengths.
    Uint(u64),
    Addr(SocketAddr),
    AddrList(Vec<SocketAddr>),
    /// An unlinked block, as sent by clients in `INSERT_BLOCKS`.
    Draft(BlockDraft),
    /// A sealed block with its linkage.
    Block(Block),
    /// Sealed blocks, oldest → newest.
    BlockList(Vec<Block>),
}

impl Frame {
    /// Terse frame kind name, for diagnostics only — never parsed.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Command(_)   => "command",
            Frame::Ok           => "ok",
            Frame::Error(_)     => "error",
            Frame::End          => "end",
            Frame::Null         => "null",
            Frame::Bool(_)      => "bool",
            Frame::Bytes(_)     => "bytes",
            Frame::Uint(_)      => "uint",
            Frame::Addr(_)      => "addr",
            Frame::AddrList(_)  => "addr list",
            Frame::Draft(_)     => "block draft",
            Frame::Block(_)     => "block",
            Frame::BlockList(_) => "block list",
        }
    }

    /// Serialize into a complete frame, CRC included.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let tag = match self {
            Frame::Command(cmd) => {
                payload.push(*cmd as u8);
                TAG_COMMAND
            }
            Frame::Ok => TAG_OK,
            Frame::Error(code) => {
                put_bytes(&mut payload, code.as_bytes());
                TAG_ERROR
            }
            Frame::End => TAG_END,
            Frame::Null => TAG_NULL,
            Frame::Bool(v) => {
                payload.push(u8::from(*v));
                TAG_BOOL
            }
            Frame::Bytes(bytes) => {
                put_bytes(&mut payload, bytes);
                TAG_BYTES
            }
            Frame::Uint(v) => {
                payload.extend_from_slice(&v.to_le_bytes());
                TAG_UINT
            }
            Frame::Addr(addr) => {
                put_addr(&mut payload, addr);
                TAG_ADDR
            }
            Frame::AddrList(addrs) => {
                payload.extend_from_slice(&(addrs.len() as u32).to_le_bytes());
                for addr in addrs {
                    put_addr(&mut payload, addr);
                }
                TAG_ADDR_LIST
            }
            Frame::Draft(draft) => {
                put_bytes(&mut payload, draft.file_hash());
                payload.extend_from_slice(&draft.index_all().to_le_bytes());
                payload.extend_from_slice(&draft.index().to_le_bytes());
                put_bytes(&mut payload, draft.chunk());
                TAG_DRAFT
            }
            Frame::Block(block) => {
                put_block(&mut payload, block);
                TAG_BLOCK
            }
            Frame::BlockList(blocks) => {
                payload.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
                for block in blocks {
                    put_block(&mut payload, block);
                }
                TAG_BLOCK_LIST
            }
        };

        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + 4);
        out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        out.push(tag);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);

        let mut h = crc32fast::Hasher::new();
        h.update(&[tag]);
        h.update(&payload);
        out.extend_from_slice(&h.finalize().to_le_bytes());

        out
    }

    /// Decode a payload whose header (and CRC) have already been validated.
    fn decode(tag: u8, payload: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(payload);
        let frame = match tag {
            TAG_COMMAND => {
                let raw = ReadBytesExt::read_u8(&mut cur).map_err(|_| WireError::BadPayload("command"))?;
                let cmd = Command::from_u8(raw).ok_or(WireError::BadPayload("command"))?;
                Frame::Command(cmd)
            }
            TAG_OK => Frame::Ok,
            TAG_ERROR => {
                let code = get_bytes(&mut cur, "error")?;
                let code = String::from_utf8(code).map_err(|_| WireError::BadPayload("error"))?;
                Frame::Error(code)
            }
            TAG_END => Frame::End,
            TAG_NULL => Frame::Null,
            TAG_BOOL => {
                let raw = ReadBytesExt::read_u8(&mut cur).map_err(|_| WireError::BadPayload("bool"))?;
                Frame::Bool(raw != 0)
            }
            TAG_BYTES => Frame::Bytes(get_bytes(&mut cur, "bytes")?),
            TAG_UINT => {
                let v = ReadBytesExt::read_u64::<LittleEndian>(&mut cur)
                    .map_err(|_| WireError::BadPayload("uint"))?;
                Frame::Uint(v)
            }
            TAG_ADDR => Frame::Addr(get_addr(&mut cur)?),
            TAG_ADDR_LIST => {
                let count = ReadBytesExt::read_u32::<LittleEndian>(&mut cur)
                    .map_err(|_| WireError::BadPayload("addr list"))?;
                let mut addrs = Vec::with_capacity(bounded_capacity(count));
                for _ in 0..count {
                    addrs.push(get_addr(&mut cur)?);
                }
                Frame::AddrList(addrs)
            }
            TAG_DRAFT => {
                let file_hash = get_bytes(&mut cur, "block draft")?;
                let index_all = ReadBytesExt::read_u32::<LittleEndian>(&mut cur)
                    .map_err(|_| WireError::BadPayload("block draft"))?;
                let index = ReadBytesExt::read_u32::<LittleEndian>(&mut cur)
                    .map_err(|_| WireError::BadPayload("block draft"))?;
                let chunk = get_bytes(&mut cur, "block draft")?;
                let draft = BlockDraft::new(file_hash, index_all, chunk, index)
                    .map_err(|_| WireError::BadPayload("block draft"))?;
                Frame::Draft(draft)
            }
            TAG_BLOCK => Frame::Block(get_block(&mut cur)?),
            TAG_BLOCK_LIST => {
                let count = ReadBytesExt::read_u32::<LittleEndian>(&mut cur)
                    .map_err(|_| WireError::BadPayload("block list"))?;
                let mut blocks = Vec::with_capacity(bounded_capacity(count));
                for _ in 0..count {
                    blocks.push(get_block(&mut cur)?);
                }
                Frame::BlockList(blocks)
            }
            other => return Err(WireError::UnknownTag(other)),
        };

        // A frame with trailing garbage was not produced by this codec.
        if cur.position() != payload.len() as u64 {
            return Err(WireError::BadPayload("trailing bytes"));
        }
        Ok(frame)
    }
}

// ── Async frame I/O ──────────────────────────────────────────────────────────

/// Write one frame and flush.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(&frame.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Read and validate one frame.
///
/// Validation order: magic, length cap (before the payload allocation), then
/// CRC32, then payload structure.  Any failure poisons the stream — the
/// caller MUST close the connection.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut header).await?;

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != FRAME_MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let tag = header[4];
    let payload_len = u32::from_le_bytes(header[5..9].try_into().unwrap()) as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;
    let mut crc_bytes = [0u8; 4];
    r.read_exact(&mut crc_bytes).await?;

    let mut h = crc32fast::Hasher::new();
    h.update(&[tag]);
    h.update(&payload);
    let expected = h.finalize();
    let got = u32::from_le_bytes(crc_bytes);
    if expected != got {
        return Err(WireError::CrcMismatch { expected, got });
    }

    Frame::decode(tag, &payload)
}

// ── Field helpers ────────────────────────────────────────────────────────────

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn get_bytes(cur: &mut Cursor<&[u8]>, what: &'static str) -> Result<Vec<u8>, WireError> {
    let len = ReadBytesExt::read_u32::<LittleEndian>(&mut *cur)
        .map_err(|_| WireError::BadPayload(what))? as usize;
    let remaining = cur.get_ref().len() as u64 - cur.position();
    if len as u64 > remaining {
        return Err(WireError::BadPayload(what));
    }
    let mut bytes = vec![0u8; len];
    std::io::Read::read_exact(&mut *cur, &mut bytes).map_err(|_| WireError::BadPayload(what))?;
    Ok(bytes)
}

fn put_addr(buf: &mut Vec<u8>, addr: &SocketAddr) {
    put_bytes(buf, addr.to_string().as_bytes());
}

fn get_addr(cur: &mut Cursor<&[u8]>) -> Result<SocketAddr, WireError> {
    let raw = get_bytes(cur, "address")?;
    let text = std::str::from_utf8(&raw).map_err(|_| WireError::BadPayload("address"))?;
    text.parse().map_err(|_| WireError::BadPayload("address"))
}

fn put_block(buf: &mut Vec<u8>, block: &Block) {
    put_bytes(buf, block.file_hash());
    buf.extend_from_slice(&block.index_all().to_le_bytes());
    buf.extend_from_slice(&block.index().to_le_bytes());
    put_bytes(buf, block.chunk());
    put_bytes(buf, block.previous_block_hash());
}

/// Reconstruct a sealed block.  Hashes are recomputed here, never trusted
/// from the wire.
fn get_block(cur: &mut Cursor<&[u8]>) -> Result<Block, WireError> {
    let file_hash = get_bytes(cur, "block")?;
    let index_all = ReadBytesExt::read_u32::<LittleEndian>(&mut *cur)
        .map_err(|_| WireError::BadPayload("block"))?;
    let index = ReadBytesExt::read_u32::<LittleEndian>(&mut *cur)
        .map_err(|_| WireError::BadPayload("block"))?;
    let chunk = get_bytes(cur, "block")?;
    let previous = get_bytes(cur, "block")?;

    let draft = BlockDraft::new(file_hash, index_all, chunk, index)
        .map_err(|_| WireError::BadPayload("block"))?;
    Ok(Block::seal(draft, previous))
}

/// Cap a wire-declared element count for `Vec::with_capacity` so a bogus
/// count cannot pre-allocate unbounded memory.  The actual element reads
/// still bound the real length.
fn bounded_capacity(count: u32) -> usize {
    (count as usize).min(4096)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;

    async fn round_trip(frame: Frame) -> Frame {
        let (mut tx, mut rx) = tokio::io::duplex(MAX_FRAME_LEN);
        write_frame(&mut tx, &frame).await.unwrap();
        read_frame(&mut rx).await.unwrap()
    }

    #[tokio::test]
    async fn scalar_frames_round_trip() {
        for frame in [
            Frame::Command(Command::NewBlocksAvailable),
            Frame::Ok,
            Frame::Error("FileBlockSplitChanged".into()),
            Frame::End,
            Frame::Null,
            Frame::Bool(true),
            Frame::Bool(false),
            Frame::Bytes(b"some file hash".to_vec()),
            Frame::Uint(42),
            Frame::Addr("127.0.0.1:9000".parse().unwrap()),
            Frame::AddrList(vec![
                "127.0.0.1:9000".parse().unwrap(),
                "[::1]:9001".parse().unwrap(),
            ]),
        ] {
            let decoded = round_trip(frame.clone()).await;
            assert_eq!(decoded, frame);
        }
    }

    #[tokio::test]
    async fn draft_round_trip_recomputes_content_hash() {
        let draft = BlockDraft::new(b"file".to_vec(), 3, b"chunk data".to_vec(), 1).unwrap();
        match round_trip(Frame::Draft(draft.clone())).await {
            Frame::Draft(decoded) => {
                assert_eq!(decoded, draft);
                assert_eq!(decoded.content_hash(), draft.content_hash());
            }
            other => panic!("expected draft, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sealed_block_round_trip_recomputes_block_hash() {
        let mut chain = Chain::new();
        let draft = BlockDraft::new(b"file".to_vec(), 1, b"chunk".to_vec(), 0).unwrap();
        let block = chain.insert_block(draft).unwrap().clone();

        match round_trip(Frame::Block(block.clone())).await {
            Frame::Block(decoded) => {
                assert_eq!(decoded, block);
                assert_eq!(decoded.block_hash(), block.block_hash());
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn block_list_round_trip_preserves_order() {
        let mut chain = Chain::new();
        for i in 0..4u32 {
            let draft =
                BlockDraft::new(format!("f{i}").into_bytes(), 1, vec![i as u8; 8], 0).unwrap();
            chain.insert_block(draft).unwrap();
        }
        let blocks: Vec<Block> = chain.chain_list().into_iter().cloned().collect();

        match round_trip(Frame::BlockList(blocks.clone())).await {
            Frame::BlockList(decoded) => assert_eq!(decoded, blocks),
            other => panic!("expected block list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupted_payload_fails_crc() {
        let mut encoded = Frame::Bytes(b"payload under test".to_vec()).encode();
        let idx = FRAME_HEADER_SIZE + 5;
        encoded[idx] ^= 0xFF;

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &encoded).await.unwrap();
        match read_frame(&mut rx).await {
            Err(WireError::CrcMismatch { .. }) => {}
            other => panic!("expected CRC mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_magic_rejected() {
        let mut encoded = Frame::Ok.encode();
        encoded[0] ^= 0xFF;

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &encoded).await.unwrap();
        match read_frame(&mut rx).await {
            Err(WireError::BadMagic(_)) => {}
            other => panic!("expected bad magic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_rejected_before_allocation() {
        // One byte past the cap is already too much.
        let mut header = Vec::new();
        header.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        header.push(TAG_BYTES);
        header.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &header).await.unwrap();
        match read_frame(&mut rx).await {
            Err(WireError::FrameTooLarge(len)) => assert_eq!(len, MAX_FRAME_LEN + 1),
            other => panic!("expected frame too large, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn draft_with_bad_range_rejected() {
        // Hand-assemble a draft payload with index == index_all.
        let mut payload = Vec::new();
        put_bytes(&mut payload, b"file");
        payload.extend_from_slice(&2u32.to_le_bytes()); // index_all
        payload.extend_from_slice(&2u32.to_le_bytes()); // index — out of range
        put_bytes(&mut payload, b"chunk");

        let mut encoded = Vec::new();
        encoded.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        encoded.push(TAG_DRAFT);
        encoded.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        encoded.extend_from_slice(&payload);
        let mut h = crc32fast::Hasher::new();
        h.update(&[TAG_DRAFT]);
        h.update(&payload);
        encoded.extend_from_slice(&h.finalize().to_le_bytes());

        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &encoded).await.unwrap();
        match read_frame(&mut rx).await {
            Err(WireError::BadPayload("block draft")) => {}
            other => panic!("expected bad payload, got {other:?}"),
        }
    }
}
