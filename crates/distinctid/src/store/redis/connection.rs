use super::resp::{self, Value};
use crate::StoreError;
use bytes::BytesMut;
use core::fmt;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Credentials and database sent right after connecting.
#[derive(Clone, Default)]
pub(crate) struct Handshake {
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) db: u32,
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .finish()
    }
}

/// One RESP connection. Commands are strictly request/reply.
#[derive(Debug)]
pub(crate) struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    timeout: Duration,
    pub(crate) last_used: Instant,
}

impl Connection {
    /// Opens a TCP connection and runs the handshake, all within `timeout`
    /// per step.
    pub(crate) async fn connect(
        host: &str,
        port: u16,
        handshake: &Handshake,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| StoreError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(512),
            write_buf: BytesMut::with_capacity(512),
            timeout,
            last_used: Instant::now(),
        };

        if let Some(password) = &handshake.password {
            let reply = match &handshake.username {
                Some(user) => {
                    conn.call(&[b"AUTH", user.as_bytes(), password.as_bytes()])
                        .await?
                }
                None => conn.call(&[b"AUTH", password.as_bytes()]).await?,
            };
            reply.into_status()?;
        }
        if handshake.db != 0 {
            let db = handshake.db.to_string();
            conn.call(&[b"SELECT", db.as_bytes()]).await?.into_status()?;
        }
        Ok(conn)
    }

    /// Sends one command and waits for its reply.
    ///
    /// After an error the connection state is unknown and it must not be
    /// reused.
    pub(crate) async fn call(&mut self, args: &[&[u8]]) -> Result<Value, StoreError> {
        self.write_buf.clear();
        resp::encode_command(&mut self.write_buf, args);

        let reply = tokio::time::timeout(self.timeout, self.round_trip())
            .await
            .map_err(|_| StoreError::Timeout)??;

        self.last_used = Instant::now();
        Ok(reply)
    }

    async fn round_trip(&mut self) -> Result<Value, StoreError> {
        self.stream.write_all(&self.write_buf).await?;
        loop {
            if let Some(value) = resp::decode(&mut self.read_buf)? {
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(StoreError::ConnectionClosed);
            }
        }
    }

    pub(crate) async fn incr_by(&mut self, key: &str, by: u64) -> Result<u64, StoreError> {
        let by = by.to_string();
        self.call(&[b"INCRBY", key.as_bytes(), by.as_bytes()])
            .await?
            .into_counter()
    }

    pub(crate) async fn ping(&mut self) -> Result<(), StoreError> {
        match self.call(&[b"PING"]).await?.into_status()?.as_str() {
            "PONG" => Ok(()),
            other => Err(StoreError::Protocol(format!("unexpected PING reply `{other}`"))),
        }
    }

    pub(crate) async fn primary_address(
        &mut self,
        service: &str,
    ) -> Result<Option<(String, u16)>, StoreError> {
        self.call(&[b"SENTINEL", b"get-master-addr-by-name", service.as_bytes()])
            .await?
            .into_address()
    }
}
