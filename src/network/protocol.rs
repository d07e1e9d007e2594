//! Wire messages and their framing.
//!
//! A frame is a 12-byte ASCII command tag padded with NUL bytes, a big-endian
//! `u32` payload length, then the bincode-encoded payload.

use crate::core::{Block, Transaction};
use crate::crypto::hash::Hash256;
use crate::{LedgerError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u32 = 1;
pub const COMMAND_LENGTH: usize = 12;
const HEADER_LENGTH: usize = COMMAND_LENGTH + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Addr,
    GetBlocks,
    Inv,
    GetData,
    Block,
    Tx,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Addr => "addr",
            Command::GetBlocks => "getblocks",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Tx => "tx",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "version" => Some(Command::Version),
            "addr" => Some(Command::Addr),
            "getblocks" => Some(Command::GetBlocks),
            "inv" => Some(Command::Inv),
            "getdata" => Some(Command::GetData),
            "block" => Some(Command::Block),
            "tx" => Some(Command::Tx),
            _ => None,
        }
    }

    pub fn to_tag(&self) -> [u8; COMMAND_LENGTH] {
        let mut tag = [0u8; COMMAND_LENGTH];
        let name = self.name().as_bytes();
        tag[..name.len()].copy_from_slice(name);
        tag
    }

    pub fn from_tag(tag: &[u8; COMMAND_LENGTH]) -> Result<Self> {
        let end = tag.iter().position(|b| *b == 0).unwrap_or(COMMAND_LENGTH);
        let name = String::from_utf8_lossy(&tag[..end]);
        Self::from_name(&name).ok_or_else(|| LedgerError::UnknownCommand(name.into_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryKind {
    Block,
    Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    /// `None` while the sender's chain is empty.
    pub best_height: Option<u64>,
    pub addr_from: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addr_from: String,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InventoryKind,
    pub items: Vec<Hash256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InventoryKind,
    pub id: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Addr(AddrPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Version(_) => Command::Version,
            Message::Addr(_) => Command::Addr,
            Message::GetBlocks(_) => Command::GetBlocks,
            Message::Inv(_) => Command::Inv,
            Message::GetData(_) => Command::GetData,
            Message::Block(_) => Command::Block,
            Message::Tx(_) => Command::Tx,
        }
    }

    /// Address the sender listens on.
    pub fn sender(&self) -> &str {
        match self {
            Message::Version(p) => &p.addr_from,
            Message::Addr(p) => &p.addr_from,
            Message::GetBlocks(p) => &p.addr_from,
            Message::Inv(p) => &p.addr_from,
            Message::GetData(p) => &p.addr_from,
            Message::Block(p) => &p.addr_from,
            Message::Tx(p) => &p.addr_from,
        }
    }

    fn payload_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Message::Version(p) => bincode::serialize(p)?,
            Message::Addr(p) => bincode::serialize(p)?,
            Message::GetBlocks(p) => bincode::serialize(p)?,
            Message::Inv(p) => bincode::serialize(p)?,
            Message::GetData(p) => bincode::serialize(p)?,
            Message::Block(p) => bincode::serialize(p)?,
            Message::Tx(p) => bincode::serialize(p)?,
        };
        Ok(bytes)
    }

    /// Full frame: tag, length, payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.payload_bytes()?;
        let length = u32::try_from(payload.len())
            .map_err(|_| LedgerError::Protocol(format!("{} payload too large", self.command().name())))?;

        let mut frame = Vec::with_capacity(HEADER_LENGTH + payload.len());
        frame.extend_from_slice(&self.command().to_tag());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(command: Command, payload: &[u8]) -> Result<Self> {
        fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
            Ok(bincode::deserialize(payload)?)
        }

        Ok(match command {
            Command::Version => Message::Version(parse(payload)?),
            Command::Addr => Message::Addr(parse(payload)?),
            Command::GetBlocks => Message::GetBlocks(parse(payload)?),
            Command::Inv => Message::Inv(parse(payload)?),
            Command::GetData => Message::GetData(parse(payload)?),
            Command::Block => Message::Block(parse(payload)?),
            Command::Tx => Message::Tx(parse(payload)?),
        })
    }
}

/// Reads one frame. `Ok(None)` is a clean EOF before the next frame.
///
/// An unknown tag or a malformed payload is reported after the whole frame has
/// been consumed, so the stream stays aligned. An oversized frame is a
/// `Protocol` error and leaves the stream unusable.
pub async fn read_message<R>(reader: &mut R, max_size: u32) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let mut tag = [0u8; COMMAND_LENGTH];
    tag.copy_from_slice(&header[..COMMAND_LENGTH]);
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(&header[COMMAND_LENGTH..]);
    let length = u32::from_be_bytes(length_bytes);

    if length > max_size {
        return Err(LedgerError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            length, max_size
        )));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    let command = Command::from_tag(&tag)?;
    Message::decode(command, &payload).map(Some)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn getblocks(from: &str) -> Message {
        Message::GetBlocks(GetBlocksPayload {
            addr_from: from.to_string(),
        })
    }

    #[test]
    fn test_tag_is_nul_padded() {
        assert_eq!(&Command::Version.to_tag(), b"version\0\0\0\0\0");
        assert_eq!(&Command::GetBlocks.to_tag(), b"getblocks\0\0\0");
        assert_eq!(Command::from_tag(&Command::Tx.to_tag()).unwrap(), Command::Tx);
        assert!(matches!(
            Command::from_tag(b"bogus\0\0\0\0\0\0\0"),
            Err(LedgerError::UnknownCommand(name)) if name == "bogus"
        ));
    }

    #[test]
    fn test_frame_layout() -> Result<()> {
        let frame = getblocks("localhost:3001").encode()?;
        let payload_len = u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]) as usize;

        assert_eq!(&frame[..COMMAND_LENGTH], &Command::GetBlocks.to_tag());
        assert_eq!(frame.len(), HEADER_LENGTH + payload_len);

        Ok(())
    }

    #[tokio::test]
    async fn test_several_frames_on_one_stream() -> Result<()> {
        let version = Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            best_height: None,
            addr_from: "localhost:3002".to_string(),
            node_id: "3002".to_string(),
        });

        let mut stream = Vec::new();
        write_message(&mut stream, &version).await?;
        write_message(&mut stream, &getblocks("localhost:3002")).await?;

        let mut reader = stream.as_slice();
        assert_eq!(read_message(&mut reader, 1024).await?, Some(version));
        assert_eq!(read_message(&mut reader, 1024).await?, Some(getblocks("localhost:3002")));
        assert_eq!(read_message(&mut reader, 1024).await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tag_is_skipped() -> Result<()> {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"ping\0\0\0\0\0\0\0\0");
        stream.extend_from_slice(&3u32.to_be_bytes());
        stream.extend_from_slice(&[1, 2, 3]);
        write_message(&mut stream, &getblocks("localhost:3001")).await?;

        let mut reader = stream.as_slice();
        assert!(matches!(
            read_message(&mut reader, 1024).await,
            Err(LedgerError::UnknownCommand(_))
        ));
        assert_eq!(read_message(&mut reader, 1024).await?, Some(getblocks("localhost:3001")));

        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_payload_keeps_stream_aligned() -> Result<()> {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Command::Inv.to_tag());
        stream.extend_from_slice(&2u32.to_be_bytes());
        stream.extend_from_slice(&[0xff, 0xff]);
        write_message(&mut stream, &getblocks("localhost:3001")).await?;

        let mut reader = stream.as_slice();
        assert!(matches!(read_message(&mut reader, 1024).await, Err(LedgerError::Encoding(_))));
        assert!(read_message(&mut reader, 1024).await?.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Command::Block.to_tag());
        stream.extend_from_slice(&4096u32.to_be_bytes());

        let mut reader = stream.as_slice();
        assert!(matches!(
            read_message(&mut reader, 1024).await,
            Err(LedgerError::Protocol(_))
        ));
    }
}
