use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::encoder::{AccessUnit, ChannelId};
use crate::error::Result;
use crate::media::Codec;

/// Raw elementary-stream output for one channel.
///
/// Continuous codecs write every unit to `stream_chn{N}.{ext}`, created
/// (and truncated) when the sink is opened. Still-image codecs write each
/// unit to its own `stream_chn{N}_{K}.jpg`, closed right after the write.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    channel: ChannelId,
    codec: Codec,
    file: Option<File>,
    pictures: u64,
    closed: bool,
}

impl FileSink {
    pub fn open(dir: impl AsRef<Path>, channel: ChannelId, codec: Codec) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let file = if codec.is_still_image() {
            None
        } else {
            let path = dir.join(format!("stream_chn{channel}.{}", codec.extension()));
            let file = File::create(&path)?;
            tracing::info!(%channel, path = %path.display(), "file sink opened");
            Some(file)
        };

        Ok(Self {
            dir,
            channel,
            codec,
            file,
            pictures: 0,
            closed: false,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Path of the continuous output file, or of the next picture.
    pub fn path(&self) -> PathBuf {
        if self.codec.is_still_image() {
            self.dir.join(format!(
                "stream_chn{}_{}.{}",
                self.channel,
                self.pictures,
                self.codec.extension()
            ))
        } else {
            self.dir
                .join(format!("stream_chn{}.{}", self.channel, self.codec.extension()))
        }
    }

    /// Write every pack payload of `unit`, flushing after each one.
    ///
    /// Returns `(writes, bytes)`.
    pub fn write_unit(&mut self, unit: &AccessUnit) -> Result<(u64, u64)> {
        if self.closed {
            return Err(std::io::Error::other("file sink closed").into());
        }

        if self.codec.is_still_image() {
            let path = self.path();
            let mut file = File::create(&path)?;
            let written = write_packs(&mut file, unit)?;
            self.pictures += 1;
            tracing::debug!(channel = %self.channel, path = %path.display(), "picture written");
            return Ok(written);
        }

        match self.file.as_mut() {
            Some(file) => write_packs(file, unit),
            None => Err(std::io::Error::other("file sink has no open file").into()),
        }
    }

    /// Close the output. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            tracing::info!(channel = %self.channel, "file sink closed");
        }
        Ok(())
    }
}

fn write_packs(file: &mut File, unit: &AccessUnit) -> Result<(u64, u64)> {
    let mut writes = 0u64;
    let mut bytes = 0u64;
    for pack in unit.packs() {
        let payload = pack.payload();
        file.write_all(payload)?;
        file.flush()?;
        writes += 1;
        bytes += payload.len() as u64;
    }
    Ok((writes, bytes))
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(channel = %self.channel, error = %e, "failed to close file sink");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Pack;
    use bytes::Bytes;

    fn unit(channel: u32, packs: &[&'static [u8]]) -> AccessUnit {
        let mut unit = AccessUnit::try_with_capacity(ChannelId(channel), packs.len()).unwrap();
        for p in packs {
            unit.push(Pack::new(Bytes::from_static(p), 0));
        }
        unit
    }

    #[test]
    fn continuous_codec_appends_to_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream_chn2.h264");
        std::fs::write(&path, b"stale").unwrap();

        let mut sink = FileSink::open(dir.path(), ChannelId(2), Codec::H264).unwrap();
        assert_eq!(sink.path(), path);
        let (writes, bytes) = sink
            .write_unit(&unit(2, &[&[0, 0, 0, 1, 0x67], &[0, 0, 1, 0x65, 0xAA]]))
            .unwrap();
        assert_eq!((writes, bytes), (2, 10));
        sink.write_unit(&unit(2, &[&[0, 0, 1, 0x41]])).unwrap();
        sink.close().unwrap();

        assert_eq!(
            std::fs::read(&path).unwrap(),
            vec![0, 0, 0, 1, 0x67, 0, 0, 1, 0x65, 0xAA, 0, 0, 1, 0x41]
        );
    }

    #[test]
    fn still_images_get_one_file_each() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::open(dir.path(), ChannelId(0), Codec::Jpeg).unwrap();
        sink.write_unit(&unit(0, &[&[0xFF, 0xD8, 1, 0xFF, 0xD9]])).unwrap();
        sink.write_unit(&unit(0, &[&[0xFF, 0xD8, 2, 0xFF, 0xD9]])).unwrap();

        let second = std::fs::read(dir.path().join("stream_chn0_1.jpg")).unwrap();
        assert_eq!(second, vec![0xFF, 0xD8, 2, 0xFF, 0xD9]);
        assert!(dir.path().join("stream_chn0_0.jpg").exists());
        assert!(!dir.path().join("stream_chn0_2.jpg").exists());
    }

    #[test]
    fn close_is_idempotent_and_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::open(dir.path(), ChannelId(1), Codec::Mjpeg).unwrap();
        assert!(dir.path().join("stream_chn1.mjp").exists());
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.is_closed());
        assert!(sink.write_unit(&unit(1, &[&[1]])).is_err());
    }
}
