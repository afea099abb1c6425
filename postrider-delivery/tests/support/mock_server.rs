//! Scriptable mock SMTP server for pipeline tests.
//!
//! Speaks just enough line-based SMTP to carry a full transaction, with
//! configurable replies for the commands the scenarios care about. When
//! scripted to, it advertises STARTTLS, answers the upgrade with a `220`
//! and then slams the connection shut, which is what a broken TLS stack
//! looks like from the client's side.

#![allow(dead_code, reason = "shared between test binaries")]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    task::JoinHandle,
};

/// Replies the server gives; everything not scripted answers `250`.
#[derive(Clone)]
pub struct Script {
    /// EHLO capability lines, on top of the greeting name.
    pub capabilities: Vec<String>,
    pub mail: (u16, String),
    pub rcpt: (u16, String),
    pub data_end: (u16, String),
    /// Advertise STARTTLS, accept the command, then drop the connection
    /// instead of negotiating.
    pub starttls_then_close: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            capabilities: vec!["SIZE 35882577".to_string()],
            mail: (250, "ok".to_string()),
            rcpt: (250, "ok".to_string()),
            data_end: (250, "queued".to_string()),
            starttls_then_close: false,
        }
    }
}

impl Script {
    pub fn with_rcpt(mut self, code: u16, text: &str) -> Self {
        self.rcpt = (code, text.to_string());
        self
    }

    pub fn with_broken_starttls(mut self) -> Self {
        self.starttls_then_close = true;
        self
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    accept_loop: JoinHandle<()>,
}

impl MockSmtpServer {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let accept_loop = tokio::spawn({
            let connections = connections.clone();
            let commands = commands.clone();
            async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, script.clone(), commands.clone()));
                }
            }
        });

        Self {
            addr,
            connections,
            commands,
            accept_loop,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every command line received, in arrival order, across connections.
    /// Message bodies are collapsed into their terminating `.` line.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve(stream: TcpStream, script: Script, commands: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    if write.write_all(b"220 mock ready\r\n").await.is_err() {
        return;
    }

    let mut in_data = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if in_data {
            if line == "." {
                in_data = false;
                commands.lock().expect("commands lock").push(".".to_string());
                if reply(&mut write, script.data_end.0, &script.data_end.1)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            continue;
        }

        commands.lock().expect("commands lock").push(line.clone());
        let keyword = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();

        let result = match keyword.as_str() {
            "EHLO" => ehlo_reply(&mut write, &script).await,
            "MAIL" => reply(&mut write, script.mail.0, &script.mail.1).await,
            "RCPT" => reply(&mut write, script.rcpt.0, &script.rcpt.1).await,
            "DATA" => {
                in_data = true;
                reply(&mut write, 354, "go ahead").await
            }
            "STARTTLS" => {
                let _ = reply(&mut write, 220, "go ahead").await;
                // no negotiation follows; the client's handshake sees EOF
                return;
            }
            "QUIT" => {
                let _ = reply(&mut write, 221, "bye").await;
                return;
            }
            _ => reply(&mut write, 250, "ok").await,
        };
        if result.is_err() {
            return;
        }
    }
}

async fn ehlo_reply(write: &mut OwnedWriteHalf, script: &Script) -> std::io::Result<()> {
    let mut lines = vec!["mock.dest.tld".to_string()];
    lines.extend(script.capabilities.iter().cloned());
    if script.starttls_then_close {
        lines.push("STARTTLS".to_string());
    }

    let mut response = String::new();
    for (index, line) in lines.iter().enumerate() {
        let separator = if index + 1 == lines.len() { ' ' } else { '-' };
        response.push_str(&format!("250{separator}{line}\r\n"));
    }
    write.write_all(response.as_bytes()).await
}

async fn reply(write: &mut OwnedWriteHalf, code: u16, text: &str) -> std::io::Result<()> {
    write
        .write_all(format!("{code} {text}\r\n").as_bytes())
        .await
}
