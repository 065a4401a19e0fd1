use crate::membership::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Single byte a receiver sends once it is ready for the next step of an exchange.
pub(crate) const HANDSHAKE: u8 = b'A';

// Headers and directory replies are small; anything longer is a broken peer.
const MAX_LINE: u64 = 1024 * 1024;

/// A storage connection. Reads go through the buffer so that bytes following a header line are
/// never lost.
pub(crate) type Connection = tokio::io::BufReader<TcpStream>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Operation {
    Read,
    Write,
    Delete,
    DirectoryQuery,
    ForceRead,
    PrefixList,
    PrefixSize,
}

/// Header that opens every storage exchange, sent as one JSON line.
///
/// For block transfers `data_target` is the node that ends up holding the bytes. When a WRITE
/// reaches a node that is not its `data_target`, that node pushes its own copy of the block there.
/// Acks carry `is_ack` and name the acking replica in `data_target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TaskHeader {
    pub(crate) data_target: Option<NodeId>,
    pub(crate) ack_target: Option<NodeId>,
    pub(crate) operation: Operation,
    pub(crate) file_name: String,
    pub(crate) original_file_size: u64,
    pub(crate) block_index: u64,
    pub(crate) data_size: u64,
    pub(crate) is_ack: bool,
}

impl TaskHeader {
    pub(crate) fn new(operation: Operation, file_name: impl Into<String>) -> Self {
        TaskHeader {
            data_target: None,
            ack_target: None,
            operation,
            file_name: file_name.into(),
            original_file_size: 0,
            block_index: 0,
            data_size: 0,
            is_ack: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error("Connection closed by peer")]
    Closed,
    #[error("Unexpected handshake byte {0:#04x}")]
    BadHandshake(u8),
    #[error("Line too long")]
    LineTooLong,
    #[error("Malformed message")]
    Malformed(#[from] serde_json::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub(crate) async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_line<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    let read = (&mut *reader).take(MAX_LINE + 1).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(WireError::Closed);
    }
    if line.last() != Some(&b'\n') {
        return Err(if read as u64 > MAX_LINE {
            WireError::LineTooLong
        } else {
            WireError::Closed
        });
    }

    Ok(serde_json::from_slice(&line)?)
}

pub(crate) async fn send_handshake<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), WireError> {
    writer.write_all(&[HANDSHAKE]).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn expect_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), WireError> {
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte).await {
        Ok(_) if byte[0] == HANDSHAKE => Ok(()),
        Ok(_) => Err(WireError::BadHandshake(byte[0])),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(WireError::Closed),
        Err(e) => Err(e.into()),
    }
}
