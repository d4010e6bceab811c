use crate::error::StoreError;
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// A readable byte stream covering exactly one archived field.
///
/// Local handles resolve lazily from the filesystem; streamed handles pull
/// frames off a bounded queue fed by a connection listener and MUST be
/// consumed in order. A closed queue without a terminating frame surfaces
/// the interruption cause at the next read.
pub enum DataHandle {
    /// The whole field, already in memory.
    Buffer(Bytes),
    /// A span of a local file, opened on first read.
    File {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
    /// Frames pushed by a remote server, in server-send order.
    Stream {
        length: u64,
        frames: mpsc::Receiver<Result<Bytes, StoreError>>,
    },
}

impl DataHandle {
    pub fn empty() -> Self {
        Self::Buffer(Bytes::new())
    }

    /// Expected total size, where known up front.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Self::Buffer(bytes) => Some(bytes.len() as u64),
            Self::File { length, .. } => Some(*length),
            Self::Stream { length, .. } => Some(*length),
        }
    }

    /// Reads the whole field into memory, enforcing the declared length.
    pub async fn read_all(self) -> Result<Bytes, StoreError> {
        match self {
            Self::Buffer(bytes) => Ok(bytes),
            Self::File {
                path,
                offset,
                length,
            } => read_file_span(path, offset, length),
            Self::Stream { length, mut frames } => {
                let mut out = Vec::with_capacity(length as usize);
                while let Some(frame) = frames.recv().await {
                    out.extend_from_slice(&frame?);
                }
                if out.len() as u64 != length {
                    return Err(StoreError::Truncated {
                        uri: "stream".to_string(),
                        expected: length,
                        got: out.len() as u64,
                    });
                }
                Ok(out.into())
            }
        }
    }
}

fn read_file_span(path: PathBuf, offset: u64, length: u64) -> Result<Bytes, StoreError> {
    let mut file = std::fs::File::open(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        _ => StoreError::Io(e),
    })?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0_u8; length as usize];
    let mut read = 0_usize;
    while read < data.len() {
        match file.read(&mut data[read..])? {
            0 => {
                return Err(StoreError::Truncated {
                    uri: path.display().to_string(),
                    expected: length,
                    got: read as u64,
                })
            }
            n => read += n,
        }
    }
    Ok(data.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_handle_reads_exact_span() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unit.data");
        std::fs::File::create(&path)
            .and_then(|mut f| f.write_all(b"xxxxDEADBEEFyyyy"))
            .expect("write");

        let handle = DataHandle::File {
            path: path.clone(),
            offset: 4,
            length: 8,
        };
        assert_eq!(handle.read_all().await.expect("read").as_ref(), b"DEADBEEF");
    }

    #[tokio::test]
    async fn short_file_reports_truncation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unit.data");
        std::fs::write(&path, b"abc").expect("write");

        let handle = DataHandle::File {
            path,
            offset: 0,
            length: 10,
        };
        assert!(matches!(
            handle.read_all().await,
            Err(StoreError::Truncated { expected: 10, .. })
        ));
    }

    #[tokio::test]
    async fn stream_handle_concatenates_frames_in_order() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(Bytes::from_static(b"DEAD"))).await.expect("send");
        tx.send(Ok(Bytes::from_static(b"BEEF"))).await.expect("send");
        drop(tx);

        let handle = DataHandle::Stream {
            length: 8,
            frames: rx,
        };
        assert_eq!(handle.read_all().await.expect("read").as_ref(), b"DEADBEEF");
    }

    #[tokio::test]
    async fn stream_handle_surfaces_interruption_cause() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Err(StoreError::Unreachable {
            endpoint: "fdb.example:7654".into(),
            msg: "connection reset".into(),
        }))
        .await
        .expect("send");
        drop(tx);

        let handle = DataHandle::Stream {
            length: 8,
            frames: rx,
        };
        assert!(matches!(
            handle.read_all().await,
            Err(StoreError::Unreachable { .. })
        ));
    }
}
