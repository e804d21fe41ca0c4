//! Tor control-port client.
//!
//! Speaks just enough of the text control protocol to authenticate, request
//! a new identity (`SIGNAL NEWNYM`) and check which circuits are built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

use torswarm_core::circuit::SocksEndpoint;
use torswarm_core::config::secs;
use torswarm_core::error::AppError;
use torswarm_core::traits::{ControlSession, TorControl};

use crate::launcher::{self, LaunchConfig, TorProcess};

/// Where the Tor instances for each slot listen and how to authenticate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub host: String,

    /// Slot `n` uses SOCKS port `socks_port_offset + n`.
    pub socks_port_offset: u16,

    /// Slot `n` uses control port `control_port_offset + n`.
    pub control_port_offset: u16,

    pub control_password: Option<String>,

    /// Cookie file for `CookieAuthentication`. Ignored when a password is set.
    pub cookie_path: Option<PathBuf>,

    /// Time allowed to connect and authenticate to a control port.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    /// Minimum spacing between `SIGNAL NEWNYM` on one instance. Tor ignores
    /// signals that arrive sooner than 10 seconds after the previous one.
    #[serde(with = "secs")]
    pub newnym_interval: Duration,

    /// Launch one `tor` process per slot instead of using running instances.
    pub launch: Option<LaunchConfig>,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            socks_port_offset: 9250,
            control_port_offset: 9350,
            control_password: None,
            cookie_path: None,
            connect_timeout: Duration::from_secs(10),
            newnym_interval: Duration::from_secs(10),
            launch: None,
        }
    }
}

impl TorConfig {
    pub fn socks_port(&self, slot: usize) -> Result<u16, AppError> {
        offset_port(self.socks_port_offset, slot)
    }

    pub fn control_port(&self, slot: usize) -> Result<u16, AppError> {
        offset_port(self.control_port_offset, slot)
    }

    /// Authentication for `slot`, given an optional launched data directory.
    fn auth_for(&self, data_dir: Option<&Path>) -> ControlAuth {
        if let Some(password) = &self.control_password {
            return ControlAuth::Password(password.clone());
        }
        if let Some(path) = &self.cookie_path {
            return ControlAuth::Cookie(path.clone());
        }
        match data_dir {
            Some(dir) => ControlAuth::Cookie(dir.join("control_auth_cookie")),
            None => ControlAuth::Null,
        }
    }
}

fn offset_port(offset: u16, slot: usize) -> Result<u16, AppError> {
    u16::try_from(slot)
        .ok()
        .and_then(|slot| offset.checked_add(slot))
        .ok_or_else(|| AppError::ConfigError(format!("port {offset} + slot {slot} overflows")))
}

/// How to answer `AUTHENTICATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAuth {
    Null,
    Password(String),
    Cookie(PathBuf),
}

/// One reply from the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Value of `key=value` in a GETINFO reply.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// An open control connection.
pub struct ControlConnection<S = TcpStream> {
    stream: BufReader<S>,
}

impl ControlConnection<TcpStream> {
    pub async fn connect(host: &str, port: u16) -> Result<Self, AppError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| AppError::Control(format!("connect to {host}:{port}: {e}")))?;
        Ok(Self::new(stream))
    }
}

impl<S> ControlConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn authenticate(&mut self, auth: &ControlAuth) -> Result<(), AppError> {
        let command = match auth {
            ControlAuth::Null => "AUTHENTICATE".to_string(),
            ControlAuth::Password(password) => {
                format!("AUTHENTICATE {}", quote(password))
            }
            ControlAuth::Cookie(path) => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    AppError::Control(format!("read cookie {}: {e}", path.display()))
                })?;
                format!("AUTHENTICATE {}", hex(&cookie))
            }
        };
        self.command(&command).await.map(|_| ())
    }

    /// Ask Tor to use clean circuits for new streams.
    pub async fn signal_newnym(&mut self) -> Result<(), AppError> {
        self.command("SIGNAL NEWNYM").await.map(|_| ())
    }

    pub async fn getinfo(&mut self, key: &str) -> Result<String, AppError> {
        let reply = self.command(&format!("GETINFO {key}")).await?;
        reply
            .value(key)
            .map(str::to_string)
            .ok_or_else(|| AppError::Control(format!("GETINFO {key}: missing value")))
    }

    pub async fn circuit_established(&mut self) -> Result<bool, AppError> {
        Ok(self.getinfo("status/circuit-established").await? == "1")
    }

    /// Ids of general-purpose circuits in state BUILT.
    pub async fn built_circuits(&mut self) -> Result<Vec<u64>, AppError> {
        let status = self.getinfo("circuit-status").await?;
        Ok(built_circuit_ids(&status))
    }

    pub async fn quit(mut self) -> Result<(), AppError> {
        self.command("QUIT").await.map(|_| ())
    }

    /// Send one command and read its reply. Non-2xx replies are errors.
    pub async fn command(&mut self, command: &str) -> Result<Reply, AppError> {
        let stream = self.stream.get_mut();
        stream.write_all(format!("{command}\r\n").as_bytes()).await?;
        stream.flush().await?;

        let reply = self.read_reply().await?;
        if !reply.is_ok() {
            let verb = command.split_whitespace().next().unwrap_or(command);
            return Err(AppError::Control(format!(
                "{verb} rejected: {} {}",
                reply.code,
                reply.lines.join("; ")
            )));
        }
        Ok(reply)
    }

    async fn read_reply(&mut self) -> Result<Reply, AppError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let malformed = || AppError::Control(format!("malformed reply line: {line:?}"));
            let code: u16 = line
                .get(..3)
                .and_then(|code| code.parse().ok())
                .ok_or_else(malformed)?;
            let separator = line.get(3..4).ok_or_else(malformed)?;
            let text = line.get(4..).unwrap_or_default();
            match separator {
                " " => {
                    lines.push(text.to_string());
                    return Ok(Reply { code, lines });
                }
                "-" => lines.push(text.to_string()),
                "+" => {
                    // Data reply: body follows until a lone ".".
                    let mut data = text.to_string();
                    loop {
                        let body = self.read_line().await?;
                        if body == "." {
                            break;
                        }
                        data.push('\n');
                        data.push_str(body.strip_prefix('.').unwrap_or(&body));
                    }
                    lines.push(data);
                }
                _ => return Err(malformed()),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, AppError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(AppError::Control("control connection closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn built_circuit_ids(status: &str) -> Vec<u64> {
    status
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let id = fields.next()?.parse().ok()?;
            if fields.next()? != "BUILT" {
                return None;
            }
            let general = fields
                .filter_map(|field| field.strip_prefix("PURPOSE="))
                .all(|purpose| purpose == "GENERAL");
            general.then_some(id)
        })
        .collect()
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// [`TorControl`] over real Tor instances, one per slot.
#[derive(Debug, Clone)]
pub struct TorInstances {
    config: TorConfig,
}

impl TorInstances {
    pub fn new(config: TorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TorConfig {
        &self.config
    }
}

impl TorControl for TorInstances {
    type Session = TorSession;

    async fn open_session(&self, slot: usize) -> Result<TorSession, AppError> {
        let socks_port = self.config.socks_port(slot)?;
        let control_port = self.config.control_port(slot)?;

        let process = match &self.config.launch {
            Some(launch) => Some(launcher::launch(launch, slot, socks_port, control_port).await?),
            None => None,
        };
        let auth = self
            .config
            .auth_for(process.as_ref().map(TorProcess::data_directory));

        let connect = async {
            let mut connection =
                ControlConnection::connect(&self.config.host, control_port).await?;
            connection.authenticate(&auth).await?;
            Ok::<_, AppError>(connection)
        };
        let connection = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                AppError::Control(format!(
                    "control port {control_port} did not answer within {} ms",
                    self.config.connect_timeout.as_millis()
                ))
            })??;

        tracing::debug!(slot, control_port, socks_port, "Control session authenticated");
        Ok(TorSession {
            slot,
            endpoint: SocksEndpoint::new(self.config.host.clone(), socks_port),
            connection,
            process,
            newnym_interval: self.config.newnym_interval,
            last_newnym: None,
            newest_before_newnym: None,
        })
    }
}

/// Control session for one slot, owning its `tor` process if launched.
pub struct TorSession {
    slot: usize,
    endpoint: SocksEndpoint,
    connection: ControlConnection,
    process: Option<TorProcess>,
    newnym_interval: Duration,
    last_newnym: Option<Instant>,
    /// Highest BUILT circuit id seen just before the last NEWNYM.
    newest_before_newnym: Option<u64>,
}

impl TorSession {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl ControlSession for TorSession {
    fn endpoint(&self) -> &SocksEndpoint {
        &self.endpoint
    }

    async fn new_circuit(&mut self) -> Result<(), AppError> {
        if let Some(last) = self.last_newnym {
            let ready = last + self.newnym_interval;
            if ready > Instant::now() {
                tracing::debug!(
                    slot = self.slot,
                    wait_ms = (ready - Instant::now()).as_millis() as u64,
                    "Waiting out NEWNYM rate limit"
                );
                tokio::time::sleep_until(ready).await;
            }
        }

        let newest = self.connection.built_circuits().await?.into_iter().max();
        self.connection.signal_newnym().await?;
        self.last_newnym = Some(Instant::now());
        self.newest_before_newnym = Some(newest.unwrap_or(0));
        Ok(())
    }

    /// After a NEWNYM, only a circuit built since the signal counts.
    async fn circuit_usable(&mut self) -> Result<bool, AppError> {
        if !self.connection.circuit_established().await? {
            return Ok(false);
        }
        match self.newest_before_newnym {
            None => Ok(true),
            Some(before) => Ok(self
                .connection
                .built_circuits()
                .await?
                .into_iter()
                .any(|id| id > before)),
        }
    }

    async fn close(self) -> Result<(), AppError> {
        let quit = self.connection.quit().await;
        if let Some(process) = self.process {
            process.shutdown().await?;
        }
        quit
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;

    /// Connection whose peer answers every command with the next canned reply.
    fn scripted(replies: &[&str]) -> (ControlConnection<DuplexStream>, tokio::task::JoinHandle<String>) {
        let (client, mut server) = duplex(4096);
        let replies: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
        let peer = tokio::spawn(async move {
            let mut received = String::new();
            for reply in replies {
                let mut buf = [0u8; 512];
                let n = server.read(&mut buf).await.unwrap();
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
                server.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (ControlConnection::new(client), peer)
    }

    #[tokio::test]
    async fn test_password_authentication() {
        let (mut conn, peer) = scripted(&["250 OK\r\n"]);
        conn.authenticate(&ControlAuth::Password("se\"cret".into()))
            .await
            .unwrap();
        drop(conn);
        assert_eq!(peer.await.unwrap(), "AUTHENTICATE \"se\\\"cret\"\r\n");
    }

    #[tokio::test]
    async fn test_cookie_authentication_sends_hex() {
        let dir = tempfile::tempdir().unwrap();
        let cookie = dir.path().join("control_auth_cookie");
        std::fs::write(&cookie, [0x00, 0xab, 0xff]).unwrap();

        let (mut conn, peer) = scripted(&["250 OK\r\n"]);
        conn.authenticate(&ControlAuth::Cookie(cookie)).await.unwrap();
        drop(conn);
        assert_eq!(peer.await.unwrap(), "AUTHENTICATE 00abff\r\n");
    }

    #[tokio::test]
    async fn test_rejected_command_is_error() {
        let (mut conn, _peer) = scripted(&["515 Authentication failed: Wrong length\r\n"]);
        let err = conn.authenticate(&ControlAuth::Null).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("AUTHENTICATE rejected"));
        assert!(message.contains("515"));
    }

    #[tokio::test]
    async fn test_circuit_established() {
        let (mut conn, _peer) = scripted(&[
            "250-status/circuit-established=1\r\n250 OK\r\n",
            "250-status/circuit-established=0\r\n250 OK\r\n",
        ]);
        assert!(conn.circuit_established().await.unwrap());
        assert!(!conn.circuit_established().await.unwrap());
    }

    #[tokio::test]
    async fn test_data_reply_is_collected() {
        let (mut conn, _peer) = scripted(&[
            "250+circuit-status=\r\n1 BUILT $A,$B\r\n2 EXTENDED $C\r\n.\r\n250 OK\r\n",
        ]);
        let reply = conn.command("GETINFO circuit-status").await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(
            reply.value("circuit-status"),
            Some("\n1 BUILT $A,$B\n2 EXTENDED $C")
        );
    }

    #[tokio::test]
    async fn test_built_circuits_skip_other_states() {
        let (mut conn, _peer) = scripted(&[
            "250+circuit-status=\r\n\
             4 BUILT $A,$B,$C BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\r\n\
             5 EXTENDED $D\r\n\
             6 BUILT $E PURPOSE=HS_CLIENT_INTRO\r\n\
             7 BUILT $F,$G\r\n\
             .\r\n250 OK\r\n",
            "250-circuit-status=\r\n250 OK\r\n",
        ]);
        assert_eq!(conn.built_circuits().await.unwrap(), [4, 7]);
        assert!(conn.built_circuits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_connection_is_error() {
        let (client, server) = duplex(64);
        drop(server);
        let mut conn = ControlConnection::new(client);
        assert!(conn.signal_newnym().await.is_err());
    }

    #[test]
    fn test_ports_follow_slot() {
        let config = TorConfig::default();
        assert_eq!(config.socks_port(0).unwrap(), 9250);
        assert_eq!(config.control_port(3).unwrap(), 9353);
        let config = TorConfig {
            socks_port_offset: u16::MAX,
            ..Default::default()
        };
        assert!(config.socks_port(1).is_err());
    }

    #[test]
    fn test_auth_selection() {
        let config = TorConfig::default();
        assert_eq!(config.auth_for(None), ControlAuth::Null);
        assert_eq!(
            config.auth_for(Some(Path::new("tor_data/2"))),
            ControlAuth::Cookie(PathBuf::from("tor_data/2/control_auth_cookie"))
        );
        let config = TorConfig {
            control_password: Some("pw".into()),
            ..Default::default()
        };
        assert_eq!(
            config.auth_for(Some(Path::new("tor_data/2"))),
            ControlAuth::Password("pw".into())
        );
    }
}
