//! Async client for the lookup protocol

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::Path;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::codec::encode_int_key;
use crate::service::lookup::{TableDescription, TableStats};
use crate::service::protocol::{
    encode_request, read_response, write_message, Action, ProtocolError,
};
use crate::status::Status;
use crate::table::{IndexId, TableId};

/// A decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status byte
    pub status: Status,
    /// Frame payload; empty unless the status is `Ok`
    pub payload: Vec<u8>,
}

impl Response {
    /// Check if the request succeeded
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// The payload when the status is `Ok`
    pub fn into_payload(self) -> Option<Vec<u8>> {
        self.status.is_ok().then_some(self.payload)
    }

    /// Decode a JSON payload; `None` when the status is not `Ok`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, ProtocolError> {
        if !self.status.is_ok() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&self.payload)?))
    }
}

/// A connection to a lookup server
///
/// Requests are answered in order; one request is in flight at a time.
#[derive(Debug)]
pub struct Client<S> {
    stream: BufStream<S>,
}

impl Client<TcpStream> {
    /// Connect over TCP.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[cfg(unix)]
impl Client<UnixStream> {
    /// Connect over a Unix socket.
    pub async fn connect_unix(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(UnixStream::connect(path).await?))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    /// Wrap an established stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    async fn request(
        &mut self,
        action: Action,
        table: TableId,
        index: IndexId,
        key: &[u8],
    ) -> Result<Response, ProtocolError> {
        let request = encode_request(action, table, index, key)?;
        write_message(&mut self.stream, &request).await?;
        let (status, payload) = read_response(&mut self.stream).await?;
        Ok(Response { status, payload })
    }

    /// Look a raw key up.
    pub async fn fetch(
        &mut self,
        table: TableId,
        index: IndexId,
        key: &[u8],
    ) -> Result<Response, ProtocolError> {
        self.request(Action::Fetch, table, index, key).await
    }

    /// Look an integer key up.
    pub async fn fetch_int(
        &mut self,
        table: TableId,
        index: IndexId,
        key: i64,
    ) -> Result<Response, ProtocolError> {
        self.fetch(table, index, &encode_int_key(key)).await
    }

    /// Statistics of one table.
    pub async fn stats(&mut self, table: TableId) -> Result<Option<TableStats>, ProtocolError> {
        self.request(Action::Stats, table, 0, &[]).await?.json()
    }

    /// Schema of every table.
    pub async fn describe(&mut self) -> Result<Vec<TableDescription>, ProtocolError> {
        let response = self.request(Action::Describe, 0, 0, &[]).await?;
        Ok(response.json()?.unwrap_or_default())
    }

    /// Close the connection politely.
    pub async fn quit(mut self) -> Result<(), ProtocolError> {
        let request = encode_request(Action::Quit, 0, 0, &[])?;
        write_message(&mut self.stream, &request).await
    }
}
