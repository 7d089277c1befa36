// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler instance. The ServerRequestHandler works in
// roughly the following stages:
//
// 1. Check whether the request can be serviced by interacting with the filesystem.
// 2. If the request can be serviced, enter a phase of work and wait cycles. The work cycles
//    primarily involve reading or writing to files and sending packets, and the wait cycles
//    involve waiting for the client to respond to the output of the work cycles with packets of
//    its own.
// 3. Eventually the request enters a terminal phase where it is waiting for a final packet or
//    timeout. After timeout or receipt of this packet, the connection is closed. A write session
//    dallies after its final ack so that a retransmitted final data block can be re-acknowledged.
//
// The handler owns the session's ephemeral socket (its transfer ID) and the file stream, and it
// releases both on every exit path: one best-effort error packet first, then the file stream,
// then the socket.

use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timing knobs for a single session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for an acceptable packet before retransmitting the
    /// last one sent.
    pub retransmit_timeout: Duration,

    /// How many consecutive timeouts on the same packet are tolerated
    /// before the session is declared failed.
    pub max_retries: u32,

    /// How long a write session lingers after its final ack to answer a
    /// retransmitted final data block.
    pub dally: Duration,

    /// Hard ceiling on time without an accepted packet, across
    /// retransmissions.
    pub progress_deadline: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            retransmit_timeout: Duration::from_secs(5),
            max_retries: 5,
            dally: Duration::from_secs(5),
            progress_deadline: Duration::from_secs(60),
        }
    }
}

/// Where a session is in its lifecycle; logged when it terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingFirst,
    Transferring,
    Dallying,
    Closed,
}

/// How a session ended, reported to the dispatcher.
#[derive(Debug, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Failed(tftp::TftpError),
    Cancelled,
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The TFTP socket used to send and receive packets; its port is this
    /// end's transfer ID.
    sock: tftp::TftpSocket,

    /// The address to send packets to.
    dst: SocketAddr,

    /// The packet processor.
    processor: PacketProcessor,

    config: SessionConfig,

    phase: Phase,
}

/// Attempts to bind a UDP socket on a random high port until one succeeds.
fn bind_random_socket() -> tftp::TftpResult<tftp::TftpSocket> {
    let mut attempts = 0;
    loop {
        let port = rand::thread_rng().gen_range(1024..65535);
        match tftp::TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                attempts += 1;
                log::warn!("couldn't bind session socket on port {port}: {e}");
                if attempts >= 16 {
                    return Err(e);
                }
            }
        }
    }
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock
        .send(&tftp::Packet::Error { code, message }, dst)
        .await;
}

impl ServerRequestHandler {
    /// Parses the raw request datagram, opens the requested file, and binds
    /// this session's ephemeral socket. On any failure the mapped error
    /// packet is sent to the requester before the error is returned.
    pub async fn new(
        path_prefix: &Path,
        raw_request: &[u8],
        src: SocketAddr,
        config: SessionConfig,
    ) -> Result<ServerRequestHandler, tftp::TftpError> {
        let sock = bind_random_socket().map_err(|e| {
            tftp::TftpError::new(
                tftp::ErrorCode::Undefined,
                format!("could not bind a session socket: {e}"),
            )
        })?;

        let request = match tftp::Packet::parse(raw_request) {
            Ok(p) => p,
            Err(e) => {
                let err = tftp::TftpError::new(tftp::ErrorCode::Illegal, e.to_string());
                send_error_packet(&sock, src, err.code, err.message.clone()).await;
                return Err(err);
            }
        };

        let processor = match request {
            tftp::Packet::ReadReq { path, mode } => {
                match PacketProcessor::new_for_reading(&resolve(path_prefix, &path), mode).await {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(&sock, src, e.code, e.message.clone()).await;
                        return Err(e);
                    }
                }
            }
            tftp::Packet::WriteReq { path, mode } => {
                match PacketProcessor::new_for_writing(&resolve(path_prefix, &path), mode).await {
                    Ok(p) => p,
                    Err(e) => {
                        send_error_packet(&sock, src, e.code, e.message.clone()).await;
                        return Err(e);
                    }
                }
            }
            _ => {
                let err = tftp::TftpError::new(
                    tftp::ErrorCode::Illegal,
                    "only read and write requests can open a session",
                );
                send_error_packet(&sock, src, err.code, err.message.clone()).await;
                return Err(err);
            }
        };

        Ok(ServerRequestHandler {
            sock,
            dst: src,
            processor,
            config,
            phase: Phase::AwaitingFirst,
        })
    }

    /// The address of this session's ephemeral socket.
    pub fn local_addr(&self) -> tftp::TftpResult<SocketAddr> {
        self.sock.local_addr()
    }

    /// Drives the session to completion, then releases its resources:
    /// the file stream is closed before the socket is dropped, and at most
    /// one best-effort error packet has been sent by the time either goes.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionOutcome {
        let mut outcome = self.drive(&cancel).await;
        let terminal_phase = self.phase;
        self.phase = Phase::Closed;

        match &outcome {
            SessionOutcome::Completed => {
                log::info!("session with {} completed", self.dst);
            }
            SessionOutcome::Failed(e) => {
                log::error!(
                    "session with {} failed in phase {:?}: error code {}: {}",
                    self.dst,
                    terminal_phase,
                    e.code.code(),
                    e.message
                );
            }
            SessionOutcome::Cancelled => {
                log::info!(
                    "session with {} cancelled in phase {:?}",
                    self.dst,
                    terminal_phase
                );
            }
        }

        let ServerRequestHandler { sock, dst, processor, .. } = self;
        if let Err(e) = processor.close().await {
            log::warn!("failed to close file stream for session with {dst}: {e}");
            if outcome == SessionOutcome::Completed {
                // A flush failure on a write session loses data; the
                // transfer cannot be called complete.
                outcome = SessionOutcome::Failed(e);
            }
        }
        drop(sock);
        outcome
    }

    /// Does the work of sending and receiving data over the connection until the connection
    /// closes. Resource release happens in `run`, not here.
    async fn drive(&mut self, cancel: &CancellationToken) -> SessionOutcome {
        let mut out_bytes = match self.processor.first_packet().await {
            ResultAction::SendAndAwait(p) => p.to_bytes(),
            ResultAction::TerminateWithPacket(p) => {
                log::warn!("terminating request from {} with packet {:?}", self.dst, p);
                let _ = self.sock.send(&p, self.dst).await;
                return SessionOutcome::Failed(error_from_packet(&p));
            }
            action => {
                log::error!(
                    "packet processor produced {:?} before the first packet was sent; this should never happen",
                    action
                );
                return self
                    .fail(tftp::ErrorCode::Undefined, "internal error, please retry")
                    .await;
            }
        };
        self.phase = Phase::Transferring;

        let mut retries = 0_u32;
        let mut last_progress = Instant::now();

        // This loop is used for message sending as well as retransmission,
        // depending on whether |out_bytes| has been overwritten.
        loop {
            if let Err(e) = self.sock.send_raw(&out_bytes, self.dst).await {
                log::warn!("unable to send packet to {}: {e}", self.dst);
                return SessionOutcome::Failed(tftp::TftpError::new(
                    tftp::ErrorCode::Undefined,
                    format!("send failed: {e}"),
                ));
            }

            loop {
                if last_progress.elapsed() >= self.config.progress_deadline {
                    return self
                        .fail(tftp::ErrorCode::Undefined, "no progress, giving up")
                        .await;
                }

                let received = tokio::select! {
                    _ = cancel.cancelled() => {
                        send_error_packet(
                            &self.sock,
                            self.dst,
                            tftp::ErrorCode::Undefined,
                            "server is shutting down".to_string(),
                        )
                        .await;
                        return SessionOutcome::Cancelled;
                    }
                    r = self.sock.recv_with_timeout(self.config.retransmit_timeout) => r,
                };

                match received {
                    Ok((raw, src)) => {
                        // First, check whether the data came from the src we were expecting.
                        // Everything else, parseable or not, only earns the stranger an error.
                        if src != self.dst {
                            send_error_packet(
                                &self.sock,
                                src,
                                tftp::ErrorCode::UnknownTid,
                                "unknown transfer ID".to_string(),
                            )
                            .await;
                            // Continue waiting for a good packet from the expected peer.
                            continue;
                        }

                        let packet = match tftp::Packet::parse(&raw) {
                            Ok(p) => p,
                            Err(e) => {
                                return self
                                    .fail(
                                        tftp::ErrorCode::Illegal,
                                        format!("error parsing incoming packet: {e}"),
                                    )
                                    .await;
                            }
                        };
                        log::debug!("got packet from {src}: {packet:?}");

                        // Next, figure out how to respond.
                        match self.processor.process_packet(&packet).await {
                            ResultAction::SendAndAwait(p) => {
                                retries = 0;
                                last_progress = Instant::now();
                                out_bytes = p.to_bytes();
                                break;
                            }
                            ResultAction::SendAndDally(p) => {
                                let ack_bytes = p.to_bytes();
                                let final_block = match p {
                                    tftp::Packet::Ack { block } => block,
                                    _ => 0,
                                };
                                if let Err(e) = self.sock.send_raw(&ack_bytes, self.dst).await {
                                    log::warn!("unable to send final ack to {}: {e}", self.dst);
                                }
                                return self.dally(ack_bytes, final_block, cancel).await;
                            }
                            ResultAction::CloseConnection(maybe_warn) => {
                                log::info!("closing connection with {src}");
                                return match maybe_warn {
                                    None => SessionOutcome::Completed,
                                    Some(msg) => {
                                        log::warn!("{msg}");
                                        SessionOutcome::Failed(tftp::TftpError::new(
                                            tftp::ErrorCode::Undefined,
                                            msg,
                                        ))
                                    }
                                };
                            }
                            ResultAction::RetryRecv => {
                                continue;
                            }
                            ResultAction::TerminateWithPacket(p) => {
                                let _ = self.sock.send(&p, src).await;
                                log::info!("closing connection with {src}");
                                return SessionOutcome::Failed(error_from_packet(&p));
                            }
                        }
                    }
                    // If we timed out, rebroadcast the last sent packet, unless only the final
                    // ack of a read session is outstanding; then the dally window has passed
                    // and the transfer counts as done.
                    Err(tftp::SocketError::Timeout(_)) => {
                        if self.processor.awaiting_final_ack() {
                            self.phase = Phase::Dallying;
                            log::info!(
                                "final ack from {} never arrived; closing after dally",
                                self.dst
                            );
                            return SessionOutcome::Completed;
                        }
                        retries += 1;
                        if retries >= self.config.max_retries {
                            return self
                                .fail(tftp::ErrorCode::Undefined, "transfer timed out")
                                .await;
                        }
                        log::info!("timed out waiting for {}, retransmitting", self.dst);
                        break;
                    }
                    // A socket failure means we can no longer be reached; send an error and
                    // kill the connection.
                    Err(e) => {
                        return self
                            .fail(tftp::ErrorCode::Undefined, format!("I/O error: {e}"))
                            .await;
                    }
                }
            }
        }
    }

    /// Lingers after the final ack of a write session, re-acknowledging
    /// retransmissions of the final data block until the dally window
    /// closes. Cancellation just closes the window early.
    async fn dally(
        &mut self,
        last_ack: Vec<u8>,
        final_block: u16,
        cancel: &CancellationToken,
    ) -> SessionOutcome {
        self.phase = Phase::Dallying;
        let deadline = Instant::now() + self.config.dally;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return SessionOutcome::Completed;
            }

            let received = tokio::select! {
                _ = cancel.cancelled() => return SessionOutcome::Completed,
                r = self.sock.recv_with_timeout(remaining) => r,
            };

            match received {
                Ok((raw, src)) => {
                    if src != self.dst {
                        send_error_packet(
                            &self.sock,
                            src,
                            tftp::ErrorCode::UnknownTid,
                            "unknown transfer ID".to_string(),
                        )
                        .await;
                        continue;
                    }
                    // The only packet worth answering is a retransmission of
                    // the final data block, meaning our last ack was lost.
                    if let Ok(tftp::Packet::Data { block, .. }) = tftp::Packet::parse(&raw) {
                        if block == final_block {
                            let _ = self.sock.send_raw(&last_ack, self.dst).await;
                        }
                    }
                }
                Err(tftp::SocketError::Timeout(_)) => return SessionOutcome::Completed,
                Err(e) => {
                    log::warn!("socket error while dallying with {}: {e}", self.dst);
                    return SessionOutcome::Completed;
                }
            }
        }
    }

    async fn fail(
        &mut self,
        code: tftp::ErrorCode,
        message: impl Into<String>,
    ) -> SessionOutcome {
        let err = tftp::TftpError::new(code, message);
        send_error_packet(&self.sock, self.dst, err.code, err.message.clone()).await;
        SessionOutcome::Failed(err)
    }
}

fn error_from_packet(packet: &tftp::Packet) -> tftp::TftpError {
    match packet {
        tftp::Packet::Error { code, message } => tftp::TftpError::new(*code, message.clone()),
        _ => tftp::TftpError::new(tftp::ErrorCode::Undefined, "session terminated"),
    }
}

fn resolve(prefix: &Path, path: &str) -> std::path::PathBuf {
    let relative = path.strip_prefix('/').unwrap_or(path);
    prefix.join(relative)
}
