//! Bit-exact big-endian framing shared by both binary protocols.
//!
//! Mirrors the extension-trait shape used for the native wire protocol this
//! crate's ancestor spoke: read/write helpers live on the I/O object itself,
//! so the same encode/decode routines run over a live `TcpStream` and over
//! an in-memory cursor in tests.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ClientError, Result};

/// Maximum size accepted for a single length-prefixed blob. Guards against a
/// corrupt length field causing an unbounded allocation.
pub const MAX_BLOB_SIZE: usize = 1 << 31;

#[async_trait::async_trait]
pub trait KtRead: AsyncRead + Unpin + Send {
    async fn read_u8_be(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf).await.map_err(conn_err)?;
        Ok(buf[0])
    }

    async fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf).await.map_err(conn_err)?;
        Ok(u16::from_be_bytes(buf))
    }

    async fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).await.map_err(conn_err)?;
        Ok(u32::from_be_bytes(buf))
    }

    async fn read_i32_be(&mut self) -> Result<i32> {
        Ok(self.read_u32_be().await? as i32)
    }

    async fn read_u64_be(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).await.map_err(conn_err)?;
        Ok(u64::from_be_bytes(buf))
    }

    async fn read_i64_be(&mut self) -> Result<i64> {
        Ok(self.read_u64_be().await? as i64)
    }

    /// Reads exactly `len` bytes. A short read is a fatal connection error
    /// (enforced by `AsyncReadExt::read_exact` itself, which never
    /// short-reads: it either fills the buffer or returns `UnexpectedEof`).
    async fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_BLOB_SIZE {
            return Err(ClientError::Protocol(format!(
                "blob of {len} bytes exceeds maximum of {MAX_BLOB_SIZE}"
            )));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await.map_err(conn_err)?;
        Ok(buf)
    }

    /// Reads a `u32 length ∥ bytes` length-prefixed blob.
    async fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32_be().await? as usize;
        self.read_exact_bytes(len).await
    }
}

impl<T: AsyncRead + Unpin + Send> KtRead for T {}

#[async_trait::async_trait]
pub trait KtWrite: AsyncWrite + Unpin + Send {
    async fn write_u8_be(&mut self, value: u8) -> Result<()> {
        self.write_all(&[value]).await.map_err(conn_err)
    }

    async fn write_u16_be(&mut self, value: u16) -> Result<()> {
        self.write_all(&value.to_be_bytes()).await.map_err(conn_err)
    }

    async fn write_u32_be(&mut self, value: u32) -> Result<()> {
        self.write_all(&value.to_be_bytes()).await.map_err(conn_err)
    }

    async fn write_i32_be(&mut self, value: i32) -> Result<()> {
        self.write_u32_be(value as u32).await
    }

    async fn write_u64_be(&mut self, value: u64) -> Result<()> {
        self.write_all(&value.to_be_bytes()).await.map_err(conn_err)
    }

    async fn write_i64_be(&mut self, value: i64) -> Result<()> {
        self.write_u64_be(value as u64).await
    }

    /// Writes a `u32 length ∥ bytes` length-prefixed blob.
    async fn write_blob(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_u32_be(bytes.len() as u32).await?;
        self.write_all(bytes).await.map_err(conn_err)
    }
}

impl<T: AsyncWrite + Unpin + Send> KtWrite for T {}

fn conn_err(err: std::io::Error) -> ClientError {
    ClientError::Connection(err)
}
