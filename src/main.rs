// This is an implementation of a TFTP server compliant with RFC 1350
//
// Transfer begins with a request to read or write a file. If the server
// grants the request, the file is sent in fixed blocks of 512 bytes. Each
// data packet contains one block and must be acked before the next one is
// sent. A data packet of less than 512 bytes signals the end of a transfer.
//
// On data loss, the intended recipient times out and may retransmit its
// last packet (data or ack), causing the sender to retransmit the lost
// packet. Each side has to keep just one packet on hand for retransmission,
// because the lock step acknowledgement guarantees that all older packets
// have been received.
//
// Most errors cause the connection to terminate. An error is signaled with
// an error packet, which is not acked and never retransmitted; timeouts
// cover the case where the error packet itself is lost. The one error that
// does not terminate a connection is receipt of a packet whose source is
// not the connected peer: the interloper is sent an error packet, and the
// connection carries on.
//
// Transfer identifiers (TIDs) are the UDP ports on either end of a
// connection. The requesting host sends its initial request to port 69; the
// server answers from a freshly chosen TID, and that port pair identifies
// the connection from then on.

mod file_stream;
mod processor;
mod server;
mod srv_conn;
mod tftp;

use anyhow::{Context, Result};
use clap::Parser;
use server::{Server, Shutdown};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// A TFTP server compliant with RFC 1350.
#[derive(Debug, Parser)]
#[command(name = "tftpd", version, about)]
struct Args {
    /// Directory that files are read from and written into.
    root: PathBuf,

    /// Address of the well-known endpoint to listen on.
    #[arg(long, default_value = "0.0.0.0:69")]
    listen: SocketAddr,

    /// Increases log verbosity; may be given twice.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let listen = args.listen;
    let server = Server::bind(args.root, listen)
        .with_context(|| format!("could not bind the TFTP socket on {listen}"))?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, draining active transfers; interrupt again to force");
            let _ = shutdown_tx.send(Shutdown::Graceful).await;
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(Shutdown::Immediate).await;
        }
    });

    server
        .serve(shutdown_rx)
        .await
        .context("the TFTP server stopped unexpectedly")?;
    Ok(())
}
