use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use torswarm_client::TorConfig;

pub const TEST_PASSWORD: &str = "test-control-password";

#[derive(Debug, Default)]
pub struct FakeTorState {
    pub commands: Vec<String>,
    pub circuit_established: bool,
    pub reject_newnym: bool,
    /// Whether NEWNYM is followed by a freshly built circuit.
    pub build_on_newnym: bool,
    /// Ids of BUILT circuits, oldest first.
    pub circuits: Vec<u64>,
}

impl FakeTorState {
    /// Report one more BUILT circuit, as tor does once it finishes building.
    pub fn build_circuit(&mut self) {
        let id = self.circuits.last().map_or(1, |id| id + 1);
        self.circuits.push(id);
    }

    fn circuit_status(&self) -> String {
        if self.circuits.is_empty() {
            return "250-circuit-status=\r\n250 OK\r\n".to_string();
        }
        let mut reply = "250+circuit-status=\r\n".to_string();
        for id in &self.circuits {
            reply.push_str(&format!("{id} BUILT $AAAA~exit,$BBBB~guard PURPOSE=GENERAL\r\n"));
        }
        reply.push_str(".\r\n250 OK\r\n");
        reply
    }
}

/// A control port that answers like tor with `HashedControlPassword` set.
pub struct FakeControlPort {
    pub port: u16,
    pub state: Arc<Mutex<FakeTorState>>,
    task: JoinHandle<()>,
}

impl FakeControlPort {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake control port");
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(FakeTorState {
            circuit_established: true,
            build_on_newnym: true,
            circuits: vec![1],
            ..Default::default()
        }));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self { port, state, task }
    }

    /// Tor config pointing slot 0 at this control port.
    pub fn tor_config(&self) -> TorConfig {
        TorConfig {
            socks_port_offset: 19050,
            control_port_offset: self.port,
            control_password: Some(TEST_PASSWORD.to_string()),
            connect_timeout: Duration::from_secs(2),
            newnym_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    pub fn set_circuit_established(&self, established: bool) {
        self.state.lock().unwrap().circuit_established = established;
    }

    pub fn set_reject_newnym(&self, reject: bool) {
        self.state.lock().unwrap().reject_newnym = reject;
    }

    pub fn set_build_on_newnym(&self, build: bool) {
        self.state.lock().unwrap().build_on_newnym = build;
    }
}

impl Drop for FakeControlPort {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<FakeTorState>>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut authenticated = false;

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = {
            let mut state = state.lock().unwrap();
            state.commands.push(line.clone());
            match line.as_str() {
                cmd if cmd.starts_with("AUTHENTICATE") => {
                    if cmd == format!("AUTHENTICATE \"{TEST_PASSWORD}\"") {
                        authenticated = true;
                        "250 OK\r\n".to_string()
                    } else {
                        "515 Authentication failed: Password did not match\r\n".to_string()
                    }
                }
                _ if !authenticated => {
                    "514 Authentication required.\r\n".to_string()
                }
                "SIGNAL NEWNYM" if state.reject_newnym => {
                    "552 Unrecognized signal\r\n".to_string()
                }
                "SIGNAL NEWNYM" => {
                    if state.build_on_newnym {
                        state.build_circuit();
                    }
                    "250 OK\r\n".to_string()
                }
                "GETINFO circuit-status" => state.circuit_status(),
                "GETINFO status/circuit-established" => format!(
                    "250-status/circuit-established={}\r\n250 OK\r\n",
                    u8::from(state.circuit_established)
                ),
                "QUIT" => "250 closing connection\r\n".to_string(),
                _ => "510 Unrecognized command\r\n".to_string(),
            }
        };
        if write.write_all(reply.as_bytes()).await.is_err() || line == "QUIT" {
            break;
        }
    }
}
