use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use webrtc::{
    media::Sample,
    track::track_local::{
        track_local_static_rtp::TrackLocalStaticRTP,
        track_local_static_sample::TrackLocalStaticSample, TrackLocalWriter,
    },
};

use super::nal::{nal_type, H264Reader, NAL_TYPE_AUD};
use crate::error::Error;

/// Duration of one frame at roughly 30 fps.
pub const FRAME_DURATION: Duration = Duration::from_millis(33);
/// NALs buffered without an access unit delimiter before a forced flush.
pub const MAX_PENDING_NALS: usize = 100;
/// Bytes written within one flush before pausing.
pub const PACING_BYTES: usize = 8192;
const PACING_PAUSE: Duration = Duration::from_millis(1);

/// Buffer size of the RTP passthrough path.
pub const RTP_BUFFER_SIZE: usize = 15000;
const RTP_HEADER_SIZE: usize = 12;

/// Destination of encoded video samples.
#[async_trait]
pub trait SampleWriter: Send + Sync {
    async fn write_sample(&self, sample: &Sample) -> Result<(), Error>;
}

#[async_trait]
impl SampleWriter for TrackLocalStaticSample {
    async fn write_sample(&self, sample: &Sample) -> Result<(), Error> {
        TrackLocalStaticSample::write_sample(self, sample).await?;
        Ok(())
    }
}

/// Destination of raw, already packetized RTP.
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write_packet(&self, packet: &[u8]) -> Result<usize, Error>;
}

#[async_trait]
impl PacketWriter for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &[u8]) -> Result<usize, Error> {
        Ok(self.write(packet).await?)
    }
}

/// FramePacer groups NAL units into frames using access unit delimiters and writes them as samples.
/// Only the last NAL of a frame carries the frame duration.
#[derive(Debug)]
pub struct FramePacer {
    pending: Vec<Bytes>,
    frame_duration: Duration,
    /// Sleep one frame duration after each flush, for sources that are not paced by a camera.
    realtime: bool,
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new(FRAME_DURATION)
    }
}

impl FramePacer {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            pending: Vec::new(),
            frame_duration,
            realtime: false,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffers `nal`, flushing the previous frame when it starts a new access unit. Returns the number of
    /// samples written.
    pub async fn push<W: SampleWriter + ?Sized>(
        &mut self,
        nal: Bytes,
        writer: &W,
    ) -> Result<usize, Error> {
        if nal.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        if nal_type(&nal) == Some(NAL_TYPE_AUD) && !self.pending.is_empty() {
            written += self.flush(writer).await?;
        }

        self.pending.push(nal);

        if self.pending.len() > MAX_PENDING_NALS {
            tracing::warn!(
                "{} NALs buffered without an access unit delimiter, forcing flush",
                self.pending.len()
            );
            written += self.flush(writer).await?;
        }
        Ok(written)
    }

    /// Writes every buffered NAL as one frame.
    pub async fn flush<W: SampleWriter + ?Sized>(&mut self, writer: &W) -> Result<usize, Error> {
        let nals = std::mem::take(&mut self.pending);
        let count = nals.len();
        let mut accumulated = 0;
        for (i, data) in nals.into_iter().enumerate() {
            let duration = if i + 1 == count {
                self.frame_duration
            } else {
                Duration::ZERO
            };
            accumulated += data.len();
            writer
                .write_sample(&Sample {
                    data,
                    duration,
                    ..Default::default()
                })
                .await?;

            if accumulated > PACING_BYTES {
                tokio::time::sleep(PACING_PAUSE).await;
                accumulated = 0;
            }
        }
        if self.realtime && count > 0 {
            tokio::time::sleep(self.frame_duration).await;
        }
        Ok(count)
    }
}

/// Demuxes an Annex-B stream into paced samples until the stream ends, a write fails or `cancel` fires.
pub async fn stream_samples<R, W>(
    reader: R,
    writer: &W,
    mut pacer: FramePacer,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: SampleWriter + ?Sized,
{
    let mut h264 = H264Reader::new(reader);
    loop {
        let nal = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(());
            }
            res = h264.next_nal() => res?,
        };
        match nal {
            Some(nal) => {
                pacer.push(nal, writer).await?;
            }
            None => {
                pacer.flush(writer).await?;
                tracing::debug!("Sample stream has reached end of stream");
                return Ok(());
            }
        }
    }
}

/// Forwards RTP packets read from `reader` one datagram at a time. Packets shorter than an RTP header are
/// dropped, write failures are logged and skipped.
pub async fn stream_rtp<R, W>(mut reader: R, writer: &W, cancel: CancellationToken) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: PacketWriter + ?Sized,
{
    let mut buf = vec![0u8; RTP_BUFFER_SIZE];
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(());
            }
            res = reader.read(&mut buf) => res,
        };
        match res {
            Ok(0) => {
                tracing::debug!("RTP stream has reached end of stream");
                return Ok(());
            }
            Ok(n) if n < RTP_HEADER_SIZE => {
                tracing::warn!("RTP packet too short ({} bytes), dropping", n);
                continue;
            }
            Ok(n) => {
                if let Err(err) = writer.write_packet(&buf[..n]).await {
                    tracing::warn!("Failed to write RTP packet: {}", err);
                    continue;
                }
            }
            Err(err) => {
                tracing::error!("Failed to read RTP packet: {}", err);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        }
        tokio::time::sleep(PACING_PAUSE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::nal::tests::{annex_b, ChunkedReader};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        samples: Mutex<Vec<(Vec<u8>, Duration)>>,
        packets: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl SampleWriter for RecordingWriter {
        async fn write_sample(&self, sample: &Sample) -> Result<(), Error> {
            self.samples
                .lock()
                .unwrap()
                .push((sample.data.to_vec(), sample.duration));
            Ok(())
        }
    }

    #[async_trait]
    impl PacketWriter for RecordingWriter {
        async fn write_packet(&self, packet: &[u8]) -> Result<usize, Error> {
            self.packets.lock().unwrap().push(packet.to_vec());
            Ok(packet.len())
        }
    }

    fn nal(header: u8, len: usize) -> Bytes {
        let mut data = vec![header];
        data.resize(len, 0xAB);
        Bytes::from(data)
    }

    #[tokio::test]
    async fn delimiter_flushes_previous_frame() {
        let writer = RecordingWriter::default();
        let mut pacer = FramePacer::default();

        assert_eq!(pacer.push(nal(0x09, 2), &writer).await.unwrap(), 0);
        assert_eq!(pacer.push(nal(0x67, 8), &writer).await.unwrap(), 0);
        assert_eq!(pacer.push(nal(0x65, 32), &writer).await.unwrap(), 0);
        assert_eq!(pacer.push(nal(0x09, 2), &writer).await.unwrap(), 3);
        assert_eq!(pacer.pending(), 1);

        let samples = writer.samples.lock().unwrap();
        let durations: Vec<Duration> = samples.iter().map(|(_, d)| *d).collect();
        assert_eq!(durations, vec![Duration::ZERO, Duration::ZERO, FRAME_DURATION]);
        assert_eq!(samples[1].0[0], 0x67);
    }

    #[tokio::test]
    async fn safety_flush_without_delimiter() {
        let writer = RecordingWriter::default();
        let mut pacer = FramePacer::default();

        let mut written = 0;
        for _ in 0..=MAX_PENDING_NALS {
            written += pacer.push(nal(0x41, 4), &writer).await.unwrap();
        }
        assert_eq!(written, MAX_PENDING_NALS + 1);
        assert_eq!(pacer.pending(), 0);

        let samples = writer.samples.lock().unwrap();
        assert_eq!(samples.last().unwrap().1, FRAME_DURATION);
        assert!(samples[..MAX_PENDING_NALS].iter().all(|(_, d)| d.is_zero()));
    }

    #[tokio::test]
    async fn empty_nal_is_ignored() {
        let writer = RecordingWriter::default();
        let mut pacer = FramePacer::default();
        assert_eq!(pacer.push(Bytes::new(), &writer).await.unwrap(), 0);
        assert_eq!(pacer.pending(), 0);
    }

    #[tokio::test]
    async fn stream_samples_flushes_tail_at_end_of_stream() {
        let stream = annex_b(&[&[0x09, 0xF0], &[0x65, 1, 2], &[0x09, 0xF0], &[0x41, 3]]);
        let writer = RecordingWriter::default();
        stream_samples(
            ChunkedReader::new(stream, 3),
            &writer,
            FramePacer::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let samples = writer.samples.lock().unwrap();
        let durations: Vec<Duration> = samples.iter().map(|(_, d)| *d).collect();
        assert_eq!(
            durations,
            vec![Duration::ZERO, FRAME_DURATION, Duration::ZERO, FRAME_DURATION]
        );
    }

    #[tokio::test]
    async fn stream_rtp_drops_runt_packets() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = RecordingWriter::default();
        let cancel = CancellationToken::new();

        let feed = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&[0x80; 4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(&[0x80; 20]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        });

        stream_rtp(rx, &writer, cancel).await.unwrap();
        feed.await.unwrap();

        let packets = writer.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 20);
    }
}
