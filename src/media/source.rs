use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Mutex as StdMutex,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{io::AsyncRead, sync::Mutex};

use super::udp_reader::UdpPacketReader;
use crate::error::Error;

/// Byte stream handed out by a [`MediaSource`].
pub type MediaReader = Box<dyn AsyncRead + Send + Unpin>;

/// Last values applied through the camera control commands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraSettings {
    pub camera_id: i32,
    pub focus: i32,
    pub iso: i32,
    pub zoom: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            camera_id: 0,
            focus: 500,
            iso: 100,
            zoom: 1.0,
        }
    }
}

/// A camera or other producer of encoded video. The data path only uses [`MediaSource::reader`] and
/// [`MediaSource::is_rtp`]; the remaining controls are best effort.
#[async_trait]
pub trait MediaSource: Send + Sync + fmt::Debug {
    async fn start(&self) -> Result<(), Error>;

    async fn stop(&self);

    async fn restart(&self) -> Result<(), Error> {
        self.stop().await;
        self.start().await
    }

    /// Raw H.264 Annex-B bytes, or one RTP packet per read when [`MediaSource::is_rtp`] is true.
    async fn reader(&self) -> Result<MediaReader, Error>;

    fn is_rtp(&self) -> bool;

    /// Live sources are paced by the device. Others are paced by frame duration.
    fn is_live(&self) -> bool {
        true
    }

    async fn set_zoom(&self, value: f64) {
        tracing::debug!("{:?} ignores zoom={}", self, value);
    }

    async fn set_focus(&self, value: i32) {
        tracing::debug!("{:?} ignores focus={}", self, value);
    }

    async fn set_iso(&self, value: i32) {
        tracing::debug!("{:?} ignores iso={}", self, value);
    }

    async fn switch_camera(&self, id: i32) {
        tracing::debug!("{:?} ignores camera_id={}", self, id);
    }
}

/// Streams an Annex-B `.h264` file. Every reader starts from the beginning of the file.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    settings: StdMutex<CameraSettings>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settings: StdMutex::new(CameraSettings::default()),
        }
    }

    pub fn settings(&self) -> CameraSettings {
        self.settings
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut CameraSettings)) {
        if let Ok(mut settings) = self.settings.lock() {
            f(&mut settings);
        }
    }
}

#[async_trait]
impl MediaSource for FileSource {
    async fn start(&self) -> Result<(), Error> {
        tokio::fs::metadata(&self.path).await?;
        tracing::info!("FileSource {} is ready", self.path.display());
        Ok(())
    }

    async fn stop(&self) {}

    async fn reader(&self) -> Result<MediaReader, Error> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }

    fn is_rtp(&self) -> bool {
        false
    }

    fn is_live(&self) -> bool {
        false
    }

    async fn set_zoom(&self, value: f64) {
        self.update(|s| s.zoom = value);
    }

    async fn set_focus(&self, value: i32) {
        self.update(|s| s.focus = value);
    }

    async fn set_iso(&self, value: i32) {
        self.update(|s| s.iso = value);
    }

    async fn switch_camera(&self, id: i32) {
        self.update(|s| s.camera_id = id);
    }
}

/// Receives RTP packets that an external encoder process sends to a local UDP port.
#[derive(Debug)]
pub struct UdpRtpSource {
    addr: SocketAddr,
    reader: Mutex<Option<UdpPacketReader>>,
}

impl UdpRtpSource {
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            reader: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MediaSource for UdpRtpSource {
    async fn start(&self) -> Result<(), Error> {
        let mut reader = self.reader.lock().await;
        if reader.is_none() {
            *reader = Some(UdpPacketReader::bind(self.addr).await?);
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.close();
        }
    }

    async fn reader(&self) -> Result<MediaReader, Error> {
        self.start().await?;
        let mut reader = self.reader.lock().await;
        match reader.take() {
            Some(r) => Ok(Box::new(r)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("UDP source {} is not started", self.addr),
            )
            .into()),
        }
    }

    fn is_rtp(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn file_source_reads_from_start_each_time() {
        let path = std::env::temp_dir().join(format!("skyrelay-{}.h264", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, [0, 0, 0, 1, 0x65, 0x88]).await.unwrap();

        let source = FileSource::new(&path);
        source.start().await.unwrap();
        assert!(!source.is_rtp());
        assert!(!source.is_live());

        for _ in 0..2 {
            let mut reader = source.reader().await.unwrap();
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await.unwrap();
            assert_eq!(data, vec![0, 0, 0, 1, 0x65, 0x88]);
        }
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn file_source_start_fails_for_missing_file() {
        let source = FileSource::new("/nonexistent/skyrelay.h264");
        assert!(matches!(source.start().await, Err(Error::IOError(_))));
    }

    #[tokio::test]
    async fn camera_controls_are_recorded() {
        let source = FileSource::new("video.h264");
        source.set_zoom(2.5).await;
        source.set_focus(300).await;
        source.set_iso(800).await;
        source.switch_camera(1).await;
        assert_eq!(
            source.settings(),
            CameraSettings {
                camera_id: 1,
                focus: 300,
                iso: 800,
                zoom: 2.5,
            }
        );
    }

    #[tokio::test]
    async fn udp_source_hands_out_packets() {
        let source = UdpRtpSource::new(0);
        assert!(source.is_rtp());
        source.start().await.unwrap();
        let addr = source
            .reader
            .lock()
            .await
            .as_ref()
            .map(|r| r.local_addr())
            .unwrap();

        let mut reader = source.reader().await.unwrap();
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[0x80; 12], addr).await.unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 12);
    }
}
