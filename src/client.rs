//! Client operations — chunking, send, check, get.
//!
//! The client is an external collaborator of the chain: it splits a file
//! into fixed-size chunks, derives the file hash (lowercase-hex SHA-256 of
//! the whole file, sent as ASCII bytes), and hands the chain already-built
//! block drafts.  Reassembly on `get` is a plain concatenation of the
//! returned chunks, which arrive in index order.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::block::{BlockDraft, InvalidBlock};
use crate::wire::{read_frame, write_frame, Command, Frame, WireError};

/// Nominal chunk payload size.  The chain itself imposes no limit; this is
/// the split the client applies to outgoing files.
pub const CHUNK_SIZE: usize = 500;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected {0} frame from server")]
    BadResponse(&'static str),
    #[error("file is not in the chain")]
    NotFound,
    #[error("output path already exists: {0}")]
    OutputExists(PathBuf),
    #[error("not a hex digest: {0}")]
    BadHash(String),
    #[error(transparent)]
    InvalidBlock(#[from] InvalidBlock),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Chunker ──────────────────────────────────────────────────────────────────

/// Split file contents into block drafts and derive the file hash.
///
/// An empty file yields no drafts — there is nothing to store, and the chain
/// will simply never report the file as contained.
pub fn chunk_file(data: &[u8]) -> Result<(String, Vec<BlockDraft>), ClientError> {
    let file_hash = hex::encode(Sha256::digest(data));
    let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
    let index_all = chunks.len() as u32;

    let mut drafts = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.into_iter().enumerate() {
        drafts.push(BlockDraft::new(
            file_hash.clone().into_bytes(),
            index_all,
            chunk.to_vec(),
            index as u32,
        )?);
    }
    Ok((file_hash, drafts))
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct Client {
    server: SocketAddr,
}

impl Client {
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }

    /// Open a connection and complete the command handshake.
    async fn connect(&self, cmd: Command) -> Result<TcpStream, ClientError> {
        let mut stream = TcpStream::connect(self.server).await?;
        write_frame(&mut stream, &Frame::Command(cmd)).await?;
        match read_frame(&mut stream).await? {
            Frame::Ok => Ok(stream),
            Frame::Error(code) => Err(ClientError::Rejected(code)),
            other => Err(ClientError::BadResponse(other.kind())),
        }
    }

    /// Chunk a file and insert it into the chain.  Returns the file hash to
    /// retrieve it with later.
    pub async fn send_file(&self, path: &Path) -> Result<String, ClientError> {
        let data = tokio::fs::read(path).await?;
        let (file_hash, drafts) = chunk_file(&data)?;
        debug!(%file_hash, chunks = drafts.len(), "sending file");

        let mut stream = self.connect(Command::InsertBlocks).await?;
        for draft in drafts {
            write_frame(&mut stream, &Frame::Draft(draft)).await?;
        }
        write_frame(&mut stream, &Frame::End).await?;

        match read_frame(&mut stream).await? {
            Frame::Ok => {
                info!(%file_hash, "file stored");
                Ok(file_hash)
            }
            Frame::Error(code) => Err(ClientError::Rejected(code)),
            other => Err(ClientError::BadResponse(other.kind())),
        }
    }

    /// Hash a local file and ask the server whether the chain holds it
    /// completely.  Returns the file hash alongside the verdict.
    pub async fn check_file(&self, path: &Path) -> Result<(String, bool), ClientError> {
        let data = tokio::fs::read(path).await?;
        let file_hash = hex::encode(Sha256::digest(&data));
        let contains = self.check_hash(&file_hash).await?;
        Ok((file_hash, contains))
    }

    /// Ask the server whether the chain completely holds the file with this
    /// hex digest.
    pub async fn check_hash(&self, file_hash: &str) -> Result<bool, ClientError> {
        require_hex(file_hash)?;
        let mut stream = self.connect(Command::ContainsFile).await?;
        write_frame(&mut stream, &Frame::Bytes(file_hash.as_bytes().to_vec())).await?;
        match read_frame(&mut stream).await? {
            Frame::Bool(contains) => Ok(contains),
            other => Err(ClientError::BadResponse(other.kind())),
        }
    }

    /// Fetch a file from the chain and write it to `out`.  Refuses to
    /// overwrite an existing path.  Returns the number of bytes written.
    pub async fn get_file(&self, file_hash: &str, out: &Path) -> Result<u64, ClientError> {
        require_hex(file_hash)?;
        if out.exists() {
            return Err(ClientError::OutputExists(out.to_path_buf()));
        }

        let mut stream = self.connect(Command::GetFile).await?;
        write_frame(&mut stream, &Frame::Bytes(file_hash.as_bytes().to_vec())).await?;

        let mut contents = Vec::new();
        loop {
            match read_frame(&mut stream).await? {
                Frame::Block(block) => contents.extend_from_slice(block.chunk()),
                Frame::End => break,
                Frame::Null if contents.is_empty() => return Err(ClientError::NotFound),
                other => return Err(ClientError::BadResponse(other.kind())),
            }
        }

        tokio::fs::write(out, &contents).await?;
        info!(%file_hash, bytes = contents.len(), path = %out.display(), "file received");
        Ok(contents.len() as u64)
    }
}

/// The file hash travels as its ASCII hex form; reject anything that is not
/// one before dialing out.
fn require_hex(file_hash: &str) -> Result<(), ClientError> {
    if file_hash.is_empty() || hex::decode(file_hash).is_err() {
        return Err(ClientError::BadHash(file_hash.to_string()));
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_splits_at_chunk_size() {
        let data = vec![0x5A; CHUNK_SIZE * 2 + 17];
        let (file_hash, drafts) = chunk_file(&data).unwrap();

        assert_eq!(file_hash, hex::encode(Sha256::digest(&data)));
        assert_eq!(drafts.len(), 3);
        for (i, draft) in drafts.iter().enumerate() {
            assert_eq!(draft.index(), i as u32);
            assert_eq!(draft.index_all(), 3);
            assert_eq!(draft.file_hash(), file_hash.as_bytes());
        }
        assert_eq!(drafts[0].chunk().len(), CHUNK_SIZE);
        assert_eq!(drafts[1].chunk().len(), CHUNK_SIZE);
        assert_eq!(drafts[2].chunk().len(), 17);

        let reassembled: Vec<u8> = drafts.iter().flat_map(|d| d.chunk().to_vec()).collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn chunker_handles_exact_multiple() {
        let data = vec![1u8; CHUNK_SIZE * 4];
        let (_, drafts) = chunk_file(&data).unwrap();
        assert_eq!(drafts.len(), 4);
        assert!(drafts.iter().all(|d| d.chunk().len() == CHUNK_SIZE));
    }

    #[test]
    fn chunker_yields_nothing_for_empty_input() {
        let (file_hash, drafts) = chunk_file(&[]).unwrap();
        assert_eq!(file_hash, hex::encode(Sha256::digest([])));
        assert!(drafts.is_empty());
    }

    #[test]
    fn hex_digests_are_validated() {
        assert!(require_hex("deadbeef").is_ok());
        assert!(matches!(require_hex(""), Err(ClientError::BadHash(_))));
        assert!(matches!(require_hex("not hex!"), Err(ClientError::BadHash(_))));
    }
}
