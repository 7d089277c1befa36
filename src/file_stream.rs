// Buffered, single-file streaming for one transfer. A stream is opened in
// exactly one of two modes: read-only for RRQ sessions, or exclusive
// create-and-append for WRQ sessions. The transfer encoding (octet or
// netascii) is applied inside read/write, so callers only ever see wire
// bytes on the read side and local bytes land on disk on the write side.

use crate::tftp::{ErrorCode, FileMode, TftpError};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};

/// Controls whether a file is opened for reading or writing.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug)]
enum StreamIo {
    Read {
        reader: BufReader<File>,
        /// Netascii-expanded bytes waiting to be handed out. Line-ending
        /// expansion can produce more bytes than were read from disk, so
        /// the overflow is staged here between calls.
        staged: VecDeque<u8>,
        at_eof: bool,
    },
    Write {
        writer: BufWriter<File>,
        /// A CR seen at the end of the previous chunk; its meaning depends
        /// on the first byte of the next chunk.
        pending_cr: bool,
    },
}

/// A buffered read-only or write-only file stream with a fixed transfer
/// encoding.
#[derive(Debug)]
pub struct FileStream {
    io: StreamIo,
    encoding: FileMode,
}

impl FileStream {
    /// Opens `path` for a transfer. Read mode requires the file to exist;
    /// write mode creates it and fails if it already exists. Failures carry
    /// the RFC error code mapped from the OS error.
    pub async fn open(path: &Path, mode: OpenMode, encoding: FileMode) -> Result<FileStream, TftpError> {
        let io = match mode {
            OpenMode::Read => {
                let f = File::open(path).await?;
                StreamIo::Read {
                    reader: BufReader::new(f),
                    staged: VecDeque::new(),
                    at_eof: false,
                }
            }
            OpenMode::Write => {
                let f = OpenOptions::new()
                    .write(true)
                    .append(true)
                    .create_new(true)
                    .open(path)
                    .await?;
                StreamIo::Write {
                    writer: BufWriter::new(f),
                    pending_cr: false,
                }
            }
        };
        Ok(FileStream { io, encoding })
    }

    /// Reads up to `n` bytes in the stream's encoding. A short (possibly
    /// empty) result means end-of-file and nothing else.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>, TftpError> {
        let encoding = self.encoding;
        let StreamIo::Read { reader, staged, at_eof } = &mut self.io else {
            return Err(TftpError::new(
                ErrorCode::Undefined,
                "file was opened for writing",
            ));
        };

        while staged.len() < n && !*at_eof {
            let mut raw = [0_u8; 512];
            let count = reader.read(&mut raw).await?;
            if count == 0 {
                *at_eof = true;
                break;
            }
            match encoding {
                FileMode::Octet => staged.extend(&raw[..count]),
                FileMode::NetAscii => expand_netascii(&raw[..count], staged),
            }
        }

        let take = n.min(staged.len());
        Ok(staged.drain(..take).collect())
    }

    /// Appends one block of wire bytes, decoding them per the stream's
    /// encoding before they reach the file.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), TftpError> {
        let encoding = self.encoding;
        let StreamIo::Write { writer, pending_cr } = &mut self.io else {
            return Err(TftpError::new(
                ErrorCode::Undefined,
                "file was opened for reading",
            ));
        };

        match encoding {
            FileMode::Octet => writer.write_all(buf).await?,
            FileMode::NetAscii => {
                let local = collapse_netascii(buf, pending_cr);
                writer.write_all(&local).await?;
            }
        }
        Ok(())
    }

    /// Flushes any buffered writes and releases the file descriptor. Must be
    /// called on every exit path of the owning session; consuming `self`
    /// makes a second close unrepresentable.
    pub async fn close(self) -> Result<(), TftpError> {
        match self.io {
            StreamIo::Read { .. } => Ok(()),
            StreamIo::Write { mut writer, pending_cr } => {
                if pending_cr {
                    // A transfer may end mid-line-ending; keep the byte.
                    writer.write_all(b"\r").await?;
                }
                writer.flush().await?;
                Ok(())
            }
        }
    }
}

/// Local bytes to wire netascii: LF becomes CR LF, CR becomes CR NUL.
fn expand_netascii(raw: &[u8], out: &mut VecDeque<u8>) {
    for &b in raw {
        match b {
            b'\n' => {
                out.push_back(b'\r');
                out.push_back(b'\n');
            }
            b'\r' => {
                out.push_back(b'\r');
                out.push_back(0x00);
            }
            _ => out.push_back(b),
        }
    }
}

/// Wire netascii to local bytes: CR LF becomes LF, CR NUL becomes CR. A CR
/// that ends the chunk is held in `pending_cr` until the next chunk arrives.
fn collapse_netascii(wire: &[u8], pending_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire.len());
    for &b in wire {
        if *pending_cr {
            *pending_cr = false;
            match b {
                b'\n' => out.push(b'\n'),
                0x00 => out.push(b'\r'),
                b'\r' => {
                    // CR CR is outside RFC 764; pass the first through and
                    // keep waiting on the second.
                    out.push(b'\r');
                    *pending_cr = true;
                }
                _ => {
                    out.push(b'\r');
                    out.push(b);
                }
            }
        } else if b == b'\r' {
            *pending_cr = true;
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    async fn write_fixture(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).await.unwrap();
        file.write_all(contents).await.unwrap();
        file.flush().await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_open_read_missing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let err = FileStream::open(&tmpdir.path().join("absent"), OpenMode::Read, FileMode::Octet)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::FileNotFound);
    }

    #[tokio::test]
    async fn test_open_write_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = write_fixture(&tmpdir, "taken.txt", b"already here").await;
        let err = FileStream::open(&path, OpenMode::Write, FileMode::Octet)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::FileAlreadyExists);
    }

    #[tokio::test]
    async fn test_octet_read_short_at_eof_only() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = write_fixture(&tmpdir, "data.bin", &[0x42; 700]).await;

        let mut stream = FileStream::open(&path, OpenMode::Read, FileMode::Octet).await.unwrap();
        assert_eq!(stream.read(512).await.unwrap(), vec![0x42; 512]);
        assert_eq!(stream.read(512).await.unwrap(), vec![0x42; 188]);
        assert_eq!(stream.read(512).await.unwrap(), Vec::<u8>::new());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_octet_write_appends_blocks() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("out.bin");

        let mut stream = FileStream::open(&path, OpenMode::Write, FileMode::Octet).await.unwrap();
        stream.write(&[0x01; 512]).await.unwrap();
        stream.write(&[0x02]).await.unwrap();
        stream.close().await.unwrap();

        let contents = tokio::fs::read(&path).await.unwrap();
        assert_eq!(contents.len(), 513);
        assert_eq!(contents[511], 0x01);
        assert_eq!(contents[512], 0x02);
    }

    #[tokio::test]
    async fn test_netascii_read_expands_line_endings() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = write_fixture(&tmpdir, "lines.txt", b"a\nb\rc").await;

        let mut stream = FileStream::open(&path, OpenMode::Read, FileMode::NetAscii).await.unwrap();
        assert_eq!(
            stream.read(512).await.unwrap(),
            b"a\r\nb\r\x00c".to_vec()
        );
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_netascii_read_is_short_only_at_eof() {
        // 512 LFs expand to 1024 wire bytes; the first read must still
        // come back full.
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = write_fixture(&tmpdir, "lines.txt", &[b'\n'; 512]).await;

        let mut stream = FileStream::open(&path, OpenMode::Read, FileMode::NetAscii).await.unwrap();
        assert_eq!(stream.read(512).await.unwrap(), [b"\r\n".as_slice(); 256].concat());
        assert_eq!(stream.read(512).await.unwrap().len(), 512);
        assert_eq!(stream.read(512).await.unwrap(), Vec::<u8>::new());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_netascii_write_collapses_line_endings() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("lines.txt");

        let mut stream = FileStream::open(&path, OpenMode::Write, FileMode::NetAscii).await.unwrap();
        stream.write(b"a\r\nb\r\x00c").await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"a\nb\rc".to_vec());
    }

    #[tokio::test]
    async fn test_netascii_write_cr_split_across_blocks() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("split.txt");

        let mut stream = FileStream::open(&path, OpenMode::Write, FileMode::NetAscii).await.unwrap();
        stream.write(b"one\r").await.unwrap();
        stream.write(b"\ntwo\r").await.unwrap();
        stream.write(b"\x00three").await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(
            tokio::fs::read(&path).await.unwrap(),
            b"one\ntwo\rthree".to_vec()
        );
    }

    #[tokio::test]
    async fn test_netascii_write_trailing_cr_kept_on_close() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("trailing.txt");

        let mut stream = FileStream::open(&path, OpenMode::Write, FileMode::NetAscii).await.unwrap();
        stream.write(b"end\r").await.unwrap();
        stream.close().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"end\r".to_vec());
    }

    #[tokio::test]
    async fn test_read_on_write_stream_is_an_error() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("w.bin");
        let mut stream = FileStream::open(&path, OpenMode::Write, FileMode::Octet).await.unwrap();
        assert!(stream.read(512).await.is_err());
    }
}
