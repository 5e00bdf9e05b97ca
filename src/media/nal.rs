use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

const READ_CHUNK_SIZE: usize = 4096;

/// NAL unit type of an Access Unit Delimiter.
pub const NAL_TYPE_AUD: u8 = 9;

/// Returns the `nal_unit_type` of a start-code stripped NAL unit.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1F)
}

/// H264Reader splits an Annex-B byte stream into NAL units with their start codes stripped.
/// The source may return arbitrarily small reads.
#[derive(Debug)]
pub struct H264Reader<R> {
    reader: R,
    leftover: BytesMut,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> H264Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            leftover: BytesMut::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE],
            eof: false,
        }
    }

    /// Returns the next NAL unit, or `None` once the stream is exhausted.
    pub async fn next_nal(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if let Some(start) = find_start_code(&self.leftover, 0) {
                let payload = start + 3;
                if let Some(next) = find_start_code(&self.leftover, payload) {
                    // A zero before `00 00 01` belongs to a 4-byte start code.
                    let end = if next > payload && self.leftover[next - 1] == 0 {
                        next - 1
                    } else {
                        next
                    };
                    let mut unit = self.leftover.split_to(end);
                    unit.advance(payload);
                    if unit.is_empty() {
                        continue;
                    }
                    return Ok(Some(unit.freeze()));
                }
            }

            if self.eof {
                let remainder = self.leftover.split();
                if let Some(start) = find_start_code(&remainder, 0) {
                    let mut unit = remainder;
                    unit.advance(start + 3);
                    if !unit.is_empty() {
                        return Ok(Some(unit.freeze()));
                    }
                }
                return Ok(None);
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.leftover.extend_from_slice(&self.chunk[..n]);
            }
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Index of the first `00 00 01` at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < from + 3 {
        return None;
    }
    data[from..]
        .windows(3)
        .position(|w| w == [0, 0, 1])
        .map(|i| i + from)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };
    use tokio::io::ReadBuf;

    /// Hands out at most `chunk` bytes per read.
    pub(crate) struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl ChunkedReader {
        pub(crate) fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk,
            }
        }
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(self.chunk).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    pub(crate) fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut stream = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            if i % 2 == 0 {
                stream.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                stream.extend_from_slice(&[0, 0, 1]);
            }
            stream.extend_from_slice(nal);
        }
        stream
    }

    async fn collect(data: Vec<u8>, chunk: usize) -> Vec<Bytes> {
        let mut reader = H264Reader::new(ChunkedReader::new(data, chunk));
        let mut nals = Vec::new();
        while let Some(nal) = reader.next_nal().await.unwrap() {
            nals.push(nal);
        }
        nals
    }

    fn sample_nals() -> Vec<Vec<u8>> {
        vec![
            vec![0x09, 0xF0],
            vec![0x67, 0x42, 0xC0, 0x1F, 0x8C, 0x8D],
            vec![0x68, 0xCE, 0x3C, 0x80],
            (0..200u8).map(|b| b | 0x80).collect(),
            vec![0x41, 0x9A, 0x00, 0x02, 0x11],
        ]
    }

    #[tokio::test]
    async fn emits_every_nal_without_start_codes() {
        let nals = sample_nals();
        let refs: Vec<&[u8]> = nals.iter().map(|n| n.as_slice()).collect();
        let out = collect(annex_b(&refs), 4096).await;

        assert_eq!(out.len(), nals.len());
        for (got, want) in out.iter().zip(nals.iter()) {
            assert_eq!(got.as_ref(), want.as_slice());
        }
    }

    #[tokio::test]
    async fn output_does_not_depend_on_chunking() {
        let nals = sample_nals();
        let refs: Vec<&[u8]> = nals.iter().map(|n| n.as_slice()).collect();
        let stream = annex_b(&refs);
        let whole = collect(stream.clone(), stream.len()).await;

        for chunk in [1, 2, 3, 5, 7, 64] {
            assert_eq!(collect(stream.clone(), chunk).await, whole, "chunk={}", chunk);
        }
    }

    #[tokio::test]
    async fn empty_units_between_start_codes_are_skipped() {
        let stream = vec![0, 0, 0, 1, 0, 0, 1, 0x65, 0xAA, 0, 0, 1, 0, 0, 0, 1, 0x41];
        let out = collect(stream, 2).await;
        assert_eq!(out, vec![Bytes::from_static(&[0x65, 0xAA]), Bytes::from_static(&[0x41])]);
    }

    #[tokio::test]
    async fn stream_without_start_code_is_empty() {
        assert!(collect(vec![1, 2, 3, 4], 2).await.is_empty());
        assert!(collect(vec![], 2).await.is_empty());
    }

    #[tokio::test]
    async fn end_of_stream_is_sticky() {
        let mut reader = H264Reader::new(ChunkedReader::new(annex_b(&[&[0x65, 0x01]]), 3));
        assert!(reader.next_nal().await.unwrap().is_some());
        assert!(reader.next_nal().await.unwrap().is_none());
        assert!(reader.next_nal().await.unwrap().is_none());
    }

    #[test]
    fn nal_type_masks_header() {
        assert_eq!(nal_type(&[0x09, 0xF0]), Some(NAL_TYPE_AUD));
        assert_eq!(nal_type(&[0x65]), Some(5));
        assert_eq!(nal_type(&[]), None);
    }
}
