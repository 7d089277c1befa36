// The dispatcher. It owns the well-known endpoint, peeks at the opcode of
// every arriving datagram, and hands read/write requests off to per-session
// tasks. Each session gets its own ephemeral socket, so everything after the
// initial request bypasses this loop entirely.
//
// The active-session count lives here and is touched only by two events:
// spawning a session, and draining its completion message. Shutdown is
// expressed through the same loop, so there is no shared state to lock.

use crate::srv_conn::{ServerRequestHandler, SessionConfig, SessionOutcome};
use crate::tftp::{self, OpCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the server should wind down when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop accepting requests and wait for every active session to finish.
    Graceful,

    /// As graceful, but force-cancel whatever is still running after the
    /// given duration.
    Timeout(Duration),

    /// Cancel everything and return at once.
    Immediate,
}

pub struct Server {
    /// Directory that served files are resolved against.
    root: PathBuf,

    /// The well-known request socket, solely owned by this dispatcher.
    sock: tftp::TftpSocket,

    session_config: SessionConfig,
}

impl Server {
    /// Binds the well-known endpoint. Nothing is read from it until
    /// [`Server::serve`] runs.
    pub fn bind(root: impl Into<PathBuf>, addr: SocketAddr) -> tftp::TftpResult<Server> {
        Ok(Server {
            root: root.into(),
            sock: tftp::TftpSocket::bind(addr)?,
            session_config: SessionConfig::default(),
        })
    }

    /// Overrides the timing configuration handed to every session.
    pub fn with_session_config(mut self, config: SessionConfig) -> Server {
        self.session_config = config;
        self
    }

    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Serves requests until a shutdown is requested on `shutdown_rx` (or
    /// the channel closes, which counts as a graceful request) and the
    /// resulting drain finishes.
    pub async fn serve(self, mut shutdown_rx: mpsc::Receiver<Shutdown>) -> tftp::TftpResult<()> {
        log::info!(
            "tftp: starting server; root: {:?}, addr: {}",
            self.root,
            self.local_addr()?
        );

        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel::<(SocketAddr, SessionOutcome)>(32);
        let mut active: usize = 0;
        let mut draining = false;
        let mut shutdown_open = true;

        loop {
            tokio::select! {
                received = self.sock.recv_from(), if !draining => {
                    match received {
                        Ok((raw, src)) => self.accept(raw, src, &cancel, &done_tx, &mut active).await,
                        Err(e) => log::warn!("error reading from the request socket: {e}"),
                    }
                }

                Some((peer, outcome)) = done_rx.recv() => {
                    active -= 1;
                    log::debug!("session with {peer} reported {outcome:?}; {active} still active");
                    if draining && active == 0 {
                        break;
                    }
                }

                request = shutdown_rx.recv(), if shutdown_open => {
                    match request {
                        Some(Shutdown::Graceful) | None => {
                            log::info!("shutting down gracefully; {active} sessions still active");
                        }
                        Some(Shutdown::Timeout(grace)) => {
                            log::info!(
                                "shutting down; {active} sessions get {grace:?} before being cancelled"
                            );
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(grace).await;
                                cancel.cancel();
                            });
                        }
                        Some(Shutdown::Immediate) => {
                            log::info!("shutting down immediately, dropping {active} sessions");
                            cancel.cancel();
                            return Ok(());
                        }
                    }
                    draining = true;
                    shutdown_open = request.is_some();
                    if active == 0 {
                        break;
                    }
                }
            }
        }

        log::info!("tftp: all sessions finished, server stopped");
        Ok(())
    }

    /// Routes one datagram from the well-known endpoint. Requests become
    /// sessions; anything else is answered with an error and forgotten.
    async fn accept(
        &self,
        raw: Vec<u8>,
        src: SocketAddr,
        cancel: &CancellationToken,
        done_tx: &mpsc::Sender<(SocketAddr, SessionOutcome)>,
        active: &mut usize,
    ) {
        match tftp::peek_op_code(&raw) {
            Some(OpCode::Rrq) | Some(OpCode::Wrq) => {
                log::info!("new request received from {src}");
                *active += 1;

                let root = self.root.clone();
                let config = self.session_config.clone();
                let token = cancel.child_token();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let outcome =
                        match ServerRequestHandler::new(&root, &raw, src, config).await {
                            Ok(handler) => handler.run(token).await,
                            Err(e) => SessionOutcome::Failed(e),
                        };
                    let _ = done.send((src, outcome)).await;
                });
            }
            _ => {
                log::warn!("{src} sent a packet that is not a request; answering with an error");
                let reply = tftp::Packet::Error {
                    code: tftp::ErrorCode::Illegal,
                    message: "not a read or write request".to_string(),
                };
                if let Err(e) = self.sock.send(&reply, src).await {
                    log::warn!("could not answer {src}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{ErrorCode, FileMode, Packet, TftpSocket};
    use tempdir::TempDir;
    use tokio::fs::File;
    use tokio::io::AsyncWriteExt;

    fn quick_config() -> SessionConfig {
        SessionConfig {
            retransmit_timeout: Duration::from_millis(80),
            max_retries: 2,
            dally: Duration::from_millis(80),
            progress_deadline: Duration::from_secs(5),
        }
    }

    async fn fixture(dir: &TempDir, name: &str, contents: &[u8]) {
        let mut file = File::create(dir.path().join(name)).await.unwrap();
        file.write_all(contents).await.unwrap();
        file.flush().await.unwrap();
    }

    struct Harness {
        client: TftpSocket,
        server_addr: SocketAddr,
        shutdown_tx: mpsc::Sender<Shutdown>,
        serve_task: tokio::task::JoinHandle<tftp::TftpResult<()>>,
    }

    fn start_server(root: &TempDir) -> Harness {
        let server = Server::bind(root.path(), ([127, 0, 0, 1], 0).into())
            .unwrap()
            .with_session_config(quick_config());
        let port = server.local_addr().unwrap().port();
        let server_addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let serve_task = tokio::spawn(server.serve(shutdown_rx));

        let client = TftpSocket::bind(([127, 0, 0, 1], 0).into()).unwrap();
        Harness {
            client,
            server_addr,
            shutdown_tx,
            serve_task,
        }
    }

    async fn recv_packet(sock: &TftpSocket) -> (Packet, SocketAddr) {
        let (raw, src) = sock
            .recv_with_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        (Packet::parse(&raw).unwrap(), src)
    }

    async fn stop(harness: Harness) {
        harness.shutdown_tx.send(Shutdown::Graceful).await.unwrap();
        harness.serve_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rrq_end_to_end() {
        let root = TempDir::new("served").unwrap();
        fixture(&root, "hi.txt", b"hi\n").await;
        let harness = start_server(&root);

        let request = Packet::ReadReq {
            path: "hi.txt".to_string(),
            mode: FileMode::Octet,
        };
        harness
            .client
            .send(&request, harness.server_addr)
            .await
            .unwrap();

        // The reply arrives from a fresh ephemeral port, not the
        // well-known one: that port pair is the transfer ID.
        let (data, session_addr) = recv_packet(&harness.client).await;
        assert_ne!(session_addr, harness.server_addr);
        assert_eq!(data, Packet::Data { block: 1, data: b"hi\n".to_vec() });

        harness
            .client
            .send(&Packet::Ack { block: 1 }, session_addr)
            .await
            .unwrap();

        stop(harness).await;
    }

    #[tokio::test]
    async fn test_wrq_end_to_end() {
        let root = TempDir::new("served").unwrap();
        let harness = start_server(&root);

        let request = Packet::WriteReq {
            path: "out.bin".to_string(),
            mode: FileMode::Octet,
        };
        harness
            .client
            .send(&request, harness.server_addr)
            .await
            .unwrap();

        let (ack, session_addr) = recv_packet(&harness.client).await;
        assert_eq!(ack, Packet::Ack { block: 0 });

        harness
            .client
            .send(&Packet::Data { block: 1, data: vec![0x5A; 512] }, session_addr)
            .await
            .unwrap();
        let (ack, _) = recv_packet(&harness.client).await;
        assert_eq!(ack, Packet::Ack { block: 1 });

        harness
            .client
            .send(&Packet::Data { block: 2, data: vec![0x5B] }, session_addr)
            .await
            .unwrap();
        let (ack, _) = recv_packet(&harness.client).await;
        assert_eq!(ack, Packet::Ack { block: 2 });

        // Graceful shutdown drains the dallying session, so by the time
        // serve returns the file is flushed and closed.
        stop(harness).await;

        let contents = tokio::fs::read(root.path().join("out.bin")).await.unwrap();
        assert_eq!(contents.len(), 513);
        assert_eq!(contents[512], 0x5B);
    }

    #[tokio::test]
    async fn test_rrq_for_missing_file_answers_error() {
        let root = TempDir::new("served").unwrap();
        let harness = start_server(&root);

        let request = Packet::ReadReq {
            path: "absent".to_string(),
            mode: FileMode::Octet,
        };
        harness
            .client
            .send(&request, harness.server_addr)
            .await
            .unwrap();

        let (reply, _) = recv_packet(&harness.client).await;
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "file not found".to_string()
            }
        );

        stop(harness).await;
    }

    #[tokio::test]
    async fn test_non_request_opcode_answered_from_well_known_port() {
        let root = TempDir::new("served").unwrap();
        let harness = start_server(&root);

        harness
            .client
            .send(&Packet::Ack { block: 3 }, harness.server_addr)
            .await
            .unwrap();

        let (reply, src) = recv_packet(&harness.client).await;
        assert_eq!(src, harness.server_addr);
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::Illegal,
                message: "not a read or write request".to_string()
            }
        );

        stop(harness).await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_with_no_sessions_returns() {
        let root = TempDir::new("served").unwrap();
        let harness = start_server(&root);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_timeout_shutdown_cancels_stalled_session() {
        let root = TempDir::new("served").unwrap();
        fixture(&root, "big.bin", &[0x42; 4096]).await;
        let harness = start_server(&root);

        let request = Packet::ReadReq {
            path: "big.bin".to_string(),
            mode: FileMode::Octet,
        };
        harness
            .client
            .send(&request, harness.server_addr)
            .await
            .unwrap();

        // Take the first block and then go silent, leaving the session
        // stalled on its retransmit timer.
        let (data, _) = recv_packet(&harness.client).await;
        assert_eq!(data, Packet::Data { block: 1, data: vec![0x42; 512] });

        harness
            .shutdown_tx
            .send(Shutdown::Timeout(Duration::from_millis(40)))
            .await
            .unwrap();
        harness.serve_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_immediate_shutdown_returns_at_once() {
        let root = TempDir::new("served").unwrap();
        fixture(&root, "big.bin", &[0x42; 4096]).await;
        let harness = start_server(&root);

        let request = Packet::ReadReq {
            path: "big.bin".to_string(),
            mode: FileMode::Octet,
        };
        harness
            .client
            .send(&request, harness.server_addr)
            .await
            .unwrap();
        let (data, _) = recv_packet(&harness.client).await;
        assert_eq!(data, Packet::Data { block: 1, data: vec![0x42; 512] });

        harness
            .shutdown_tx
            .send(Shutdown::Immediate)
            .await
            .unwrap();
        harness.serve_task.await.unwrap().unwrap();

        // The cancelled session still owes the client a courtesy error.
        let (reply, _) = recv_packet(&harness.client).await;
        assert_eq!(
            reply,
            Packet::Error {
                code: ErrorCode::Undefined,
                message: "server is shutting down".to_string()
            }
        );
    }
}
