//! Binlog Client
//!
//! Connects to MySQL as a replica and streams raw binlog events.

use std::io::Cursor;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const MAX_PACKET_LEN: usize = 0xFF_FFFF;
const UTF8MB4_GENERAL_CI: u8 = 45;

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Initial handshake (protocol v10)
#[derive(Debug, Clone)]
struct Handshake {
    server_version: String,
    capabilities: u32,
    salt: Vec<u8>,
    auth_plugin: String,
}

impl Handshake {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let protocol = ReadBytesExt::read_u8(&mut cursor)?;
        if protocol != 10 {
            return Err(Error::Network(format!("Unsupported handshake protocol {}", protocol)));
        }
        let server_version = read_null_terminated(&mut cursor)?;
        let _connection_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let mut salt = read_exact(&mut cursor, 8)?;
        let _filler = ReadBytesExt::read_u8(&mut cursor)?;
        let mut capabilities = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)? as u32;

        let mut auth_plugin = NATIVE_PASSWORD.to_string();
        if (cursor.position() as usize) < data.len() {
            let _charset = ReadBytesExt::read_u8(&mut cursor)?;
            let _status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)?;
            capabilities |= (ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)? as u32) << 16;
            let auth_data_len = ReadBytesExt::read_u8(&mut cursor)? as usize;
            let _reserved = read_exact(&mut cursor, 10)?;
            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let part2_len = auth_data_len.saturating_sub(8).max(13);
                let mut part2 = read_exact(&mut cursor, part2_len)?;
                while part2.last() == Some(&0) {
                    part2.pop();
                }
                salt.extend_from_slice(&part2);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 {
                auth_plugin = read_null_terminated(&mut cursor)?;
            }
        }

        Ok(Self {
            server_version,
            capabilities,
            salt,
            auth_plugin,
        })
    }
}

/// Binlog replication connection
pub struct BinlogClient {
    stream: BufReader<TcpStream>,
    sequence_id: u8,
    server_version: String,
}

impl BinlogClient {
    /// Connect and authenticate
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("binlog connection to {}", addr)))??;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream: BufReader::new(stream),
            sequence_id: 0,
            server_version: String::new(),
        };
        let handshake = Handshake::parse(&client.read_packet().await?)?;
        client.server_version = handshake.server_version.clone();
        tracing::debug!(
            "Binlog handshake from {} (server {}, auth {})",
            addr,
            handshake.server_version,
            handshake.auth_plugin
        );
        client.authenticate(config, &handshake).await?;
        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    async fn authenticate(&mut self, config: &DatabaseConfig, handshake: &Handshake) -> Result<()> {
        if handshake.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::Network("Server does not speak protocol 4.1".to_string()));
        }

        let mut flags = CLIENT_LONG_PASSWORD
            | CLIENT_PROTOCOL_41
            | CLIENT_TRANSACTIONS
            | CLIENT_SECURE_CONNECTION
            | CLIENT_PLUGIN_AUTH;
        if config.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        let mut plugin = handshake.auth_plugin.clone();
        let auth = scramble(&plugin, &config.password, &handshake.salt)?;

        let mut response = Vec::new();
        response.extend_from_slice(&flags.to_le_bytes());
        response.extend_from_slice(&(MAX_PACKET_LEN as u32).to_le_bytes());
        response.push(UTF8MB4_GENERAL_CI);
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(config.user.as_bytes());
        response.push(0);
        response.push(auth.len() as u8);
        response.extend_from_slice(&auth);
        if let Some(database) = &config.database {
            response.extend_from_slice(database.as_bytes());
            response.push(0);
        }
        response.extend_from_slice(plugin.as_bytes());
        response.push(0);
        self.write_packet(&response).await?;

        loop {
            let packet = self.read_packet().await?;
            match packet.first() {
                Some(0x00) => {
                    tracing::debug!("Binlog connection authenticated as {}", config.user);
                    return Ok(());
                }
                Some(0xFF) => return Err(server_error("Authentication", &packet)),
                Some(0xFE) => {
                    // Auth switch: plugin name, then a fresh salt
                    let mut cursor = Cursor::new(&packet[1..]);
                    plugin = read_null_terminated(&mut cursor)?;
                    let mut salt = packet[1 + cursor.position() as usize..].to_vec();
                    while salt.last() == Some(&0) {
                        salt.pop();
                    }
                    tracing::debug!("Binlog authentication switched to {}", plugin);
                    let auth = scramble(&plugin, &config.password, &salt)?;
                    self.write_packet(&auth).await?;
                }
                Some(0x01) => match packet.get(1) {
                    // Fast auth succeeded, the OK packet follows
                    Some(0x03) => continue,
                    Some(0x04) => {
                        return Err(Error::Network(format!(
                            "{} full authentication for {} needs a secure connection",
                            plugin, config.user
                        )))
                    }
                    other => {
                        return Err(Error::Network(format!(
                            "Unexpected auth continuation {:?}",
                            other
                        )))
                    }
                },
                other => {
                    return Err(Error::Network(format!(
                        "Unexpected authentication response {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Run a statement that returns no rows
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        self.write_packet(&payload).await?;

        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(server_error(sql, &packet)),
            other => Err(Error::Network(format!(
                "Unexpected response {:?} to `{}`",
                other, sql
            ))),
        }
    }

    /// Register as a replica with the given server id
    pub async fn register_replica(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;
        let mut payload = Vec::new();
        payload.push(COM_REGISTER_SLAVE);
        payload.extend_from_slice(&server_id.to_le_bytes());
        payload.push(0); // hostname
        payload.push(0); // user
        payload.push(0); // password
        payload.extend_from_slice(&0u16.to_le_bytes()); // port
        payload.extend_from_slice(&0u32.to_le_bytes()); // replication rank
        payload.extend_from_slice(&0u32.to_le_bytes()); // master id
        self.write_packet(&payload).await?;

        let packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => {
                tracing::debug!("Registered as replica with server_id {}", server_id);
                Ok(())
            }
            Some(0xFF) => Err(server_error("Register replica", &packet)),
            other => Err(Error::Network(format!(
                "Unexpected register replica response {:?}",
                other
            ))),
        }
    }

    /// Ask the server to stream events from `file_name:position`
    pub async fn start_dump(&mut self, server_id: u32, file_name: &str, position: u64) -> Result<()> {
        let position = u32::try_from(position).map_err(|_| {
            Error::InvalidPosition(format!("binlog offset {} does not fit 32 bits", position))
        })?;
        self.sequence_id = 0;
        let mut payload = Vec::new();
        payload.push(COM_BINLOG_DUMP);
        payload.extend_from_slice(&position.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes()); // flags
        payload.extend_from_slice(&server_id.to_le_bytes());
        payload.extend_from_slice(file_name.as_bytes());
        self.write_packet(&payload).await?;
        tracing::debug!("Sent COM_BINLOG_DUMP for {}:{}", file_name, position);
        Ok(())
    }

    /// Next raw event, or None when the server ends the stream
    pub async fn next_event(&mut self) -> Result<Option<Vec<u8>>> {
        let mut packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => {
                packet.remove(0);
                Ok(Some(packet))
            }
            Some(0xFE) if packet.len() < 9 => Ok(None),
            Some(0xFF) => Err(server_error("Binlog stream", &packet)),
            other => Err(Error::Network(format!(
                "Unexpected binlog packet {:?}",
                other
            ))),
        }
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.stream.read_exact(&mut header).await?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence_id = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;
            // A full-length packet continues in the next one
            if len < MAX_PACKET_LEN {
                return Ok(payload);
            }
        }
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut chunks = payload.chunks(MAX_PACKET_LEN).peekable();
        let mut needs_terminator = payload.is_empty();
        while let Some(chunk) = chunks.next() {
            self.write_frame(chunk).await?;
            needs_terminator = chunks.peek().is_none() && chunk.len() == MAX_PACKET_LEN;
        }
        if needs_terminator {
            self.write_frame(&[]).await?;
        }
        self.stream.get_mut().flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, chunk: &[u8]) -> Result<()> {
        let len = (chunk.len() as u32).to_le_bytes();
        let header = [len[0], len[1], len[2], self.sequence_id];
        self.sequence_id = self.sequence_id.wrapping_add(1);
        let stream = self.stream.get_mut();
        stream.write_all(&header).await?;
        stream.write_all(chunk).await?;
        Ok(())
    }
}

fn server_error(context: &str, packet: &[u8]) -> Error {
    let code = match packet.get(1..3) {
        Some(bytes) => u16::from_le_bytes([bytes[0], bytes[1]]),
        None => 0,
    };
    // Protocol 4.1 errors carry '#' and a five character SQL state
    let message_start = if packet.get(3) == Some(&b'#') { 9 } else { 3 };
    let message = packet
        .get(message_start..)
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    Error::Network(format!("{} failed: MySQL error {}: {}", context, code, message))
}

/// Auth response for `plugin` over `salt`
fn scramble(plugin: &str, password: &str, salt: &[u8]) -> Result<Vec<u8>> {
    if password.is_empty() {
        return Ok(Vec::new());
    }
    match plugin {
        NATIVE_PASSWORD => Ok(scramble_native(password, salt)),
        CACHING_SHA2_PASSWORD => Ok(scramble_caching_sha2(password, salt)),
        other => Err(Error::Network(format!("Unsupported auth plugin {}", other))),
    }
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
fn scramble_native(password: &str, salt: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA256(password) XOR SHA256(SHA256(SHA256(password)) + salt)
fn scramble_caching_sha2(password: &str, salt: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(salt);
    let stage3 = hasher.finalize();
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn read_null_terminated(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let data = cursor.get_ref();
    let start = cursor.position() as usize;
    let rest = data.get(start..).unwrap_or_default();
    let len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Network("Unterminated string in server packet".to_string()))?;
    let value = String::from_utf8_lossy(&rest[..len]).to_string();
    cursor.set_position((start + len + 1) as u64);
    Ok(value)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    let start = cursor.position() as usize;
    let bytes = cursor
        .get_ref()
        .get(start..start + len)
        .ok_or_else(|| Error::Network("Server packet truncated".to_string()))?
        .to_vec();
    cursor.set_position((start + len) as u64);
    Ok(bytes)
}
