// Per-packet protocol logic for one transfer. The processor consumes parsed
// packets and tells its caller what to do next; it never touches the socket
// or any timer itself. There is one processor per session, discriminated at
// creation into the read-request or write-request variant.

use crate::file_stream::{FileStream, OpenMode};
use crate::tftp::{self, BLOCK_SIZE};
use std::path::Path;

#[derive(Debug)]
pub enum PacketProcessor {
    Read(ReadProcessor),
    Write(WriteProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    pub async fn new_for_reading(
        path: &Path,
        encoding: tftp::FileMode,
    ) -> Result<PacketProcessor, tftp::TftpError> {
        let stream = FileStream::open(path, OpenMode::Read, encoding).await?;
        Ok(PacketProcessor::Read(ReadProcessor::new(stream)))
    }

    pub async fn new_for_writing(
        path: &Path,
        encoding: tftp::FileMode,
    ) -> Result<PacketProcessor, tftp::TftpError> {
        log::info!("Writing to {:?}", path);
        let stream = FileStream::open(path, OpenMode::Write, encoding).await?;
        Ok(PacketProcessor::Write(WriteProcessor::new(stream)))
    }

    /// Produces the packet that opens the transfer: DATA block 1 for a read
    /// request, ACK of block 0 for a write request.
    pub async fn first_packet(&mut self) -> ResultAction {
        match self {
            // Feeding the reader a synthetic ack of block 0 makes it
            // produce DATA(1) through the same path as every later block.
            PacketProcessor::Read(p) => p.process_ack(&tftp::Packet::Ack { block: 0 }).await,
            PacketProcessor::Write(_) => {
                ResultAction::SendAndAwait(tftp::Packet::Ack { block: 0 })
            }
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Read(p) => p.process_ack(packet).await,
            PacketProcessor::Write(p) => p.process_data(packet).await,
        }
    }

    /// True once the reader has sent its final short DATA packet and only
    /// the matching ack remains outstanding.
    pub fn awaiting_final_ack(&self) -> bool {
        match self {
            PacketProcessor::Read(p) => p.awaiting_final_ack,
            PacketProcessor::Write(_) => false,
        }
    }

    /// Releases the underlying file stream. Every session exit path ends
    /// up here exactly once.
    pub async fn close(self) -> Result<(), tftp::TftpError> {
        let stream = match self {
            PacketProcessor::Read(p) => p.stream,
            PacketProcessor::Write(p) => p.stream,
        };
        stream.close().await
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendAndAwait(tftp::Packet),

    /// Caller should send the packet (the final ack of a write session),
    /// then linger to answer retransmissions of the final data block.
    SendAndDally(tftp::Packet),

    /// Caller should close the connection without sending a message, optionally logging a string.
    CloseConnection(Option<String>),

    /// Caller should try receiving the last packet again.
    RetryRecv,

    /// Caller should terminate the connection by sending the packet.
    TerminateWithPacket(tftp::Packet),
}

#[derive(Debug)]
pub struct ReadProcessor {
    stream: FileStream,
    curr_block: u16,
    awaiting_final_ack: bool,
}

impl ReadProcessor {
    fn new(stream: FileStream) -> ReadProcessor {
        ReadProcessor {
            stream,
            curr_block: 0,
            awaiting_final_ack: false,
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            &tftp::Packet::Ack { block } => {
                if block == self.curr_block {
                    if self.awaiting_final_ack {
                        return ResultAction::CloseConnection(None);
                    }

                    match self.stream.read(BLOCK_SIZE).await {
                        Ok(data) => {
                            self.curr_block = self.curr_block.wrapping_add(1);
                            if data.len() < BLOCK_SIZE {
                                self.awaiting_final_ack = true;
                            }
                            ResultAction::SendAndAwait(tftp::Packet::Data {
                                block: self.curr_block,
                                data,
                            })
                        }
                        Err(e) => ResultAction::TerminateWithPacket(e.to_packet()),
                    }
                } else if block == self.curr_block.wrapping_sub(1) {
                    // A duplicate ack for the previous block means our data
                    // packet crossed paths with the client's retransmission.
                    // Never answer it; the retransmit timer is the only
                    // thing allowed to re-send (sorcerer's apprentice).
                    ResultAction::RetryRecv
                } else {
                    ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::Illegal,
                        message: format!(
                            "cannot acknowledge a block which was not yet sent; current block is {cb}, received an ack for {block}",
                            cb = self.curr_block
                        ),
                    })
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "client sent error packet: code: {:?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: "expected an Ack packet on a read session".to_string(),
            }),
        }
    }
}

#[derive(Debug)]
pub struct WriteProcessor {
    stream: FileStream,
    curr_block: u16,
}

impl WriteProcessor {
    fn new(stream: FileStream) -> WriteProcessor {
        WriteProcessor {
            stream,
            curr_block: 0,
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => {
                let expected = self.curr_block.wrapping_add(1);
                // Block ordering is checked before anything touches the
                // file, so a straggler cannot get its payload written twice.
                if *block == expected {
                    match self.stream.write(data).await {
                        Ok(()) => {
                            self.curr_block = expected;
                            let ack = tftp::Packet::Ack {
                                block: self.curr_block,
                            };
                            if data.len() < BLOCK_SIZE {
                                ResultAction::SendAndDally(ack)
                            } else {
                                ResultAction::SendAndAwait(ack)
                            }
                        }
                        Err(e) => ResultAction::TerminateWithPacket(e.to_packet()),
                    }
                } else if *block == self.curr_block {
                    // Duplicate of the block we already wrote; our ack was
                    // lost or is still in flight. Drop it and let the timer
                    // drive any re-send.
                    ResultAction::RetryRecv
                } else {
                    ResultAction::TerminateWithPacket(tftp::Packet::Error {
                        code: tftp::ErrorCode::Illegal,
                        message: format!(
                            "data blocks must arrive in sequence; expected block {expected}, received block {block}"
                        ),
                    })
                }
            }
            tftp::Packet::Error { code, message } => ResultAction::CloseConnection(Some(format!(
                "client sent error packet: code: {:?}, message: '{}'",
                code, message
            ))),
            _ => ResultAction::TerminateWithPacket(tftp::Packet::Error {
                code: tftp::ErrorCode::Illegal,
                message: "expected a Data packet on a write session".to_string(),
            }),
        }
    }
}
