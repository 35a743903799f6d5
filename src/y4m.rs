//! Raw video input: a minimal YUV4MPEG2 reader behind the [`FrameSource`]
//! seam the sender loops consume.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context};

use crate::error::ProtocolError;
use crate::image::RawImage;

/// Producer of raw planar frames. Exhaustion is reported as
/// [`ProtocolError::EndOfInput`], which the sender treats as a clean exit.
pub trait FrameSource: Send {
    fn read_frame(&mut self, into: &mut RawImage) -> Result<(), ProtocolError>;
}

pub struct Y4mReader {
    reader: BufReader<File>,
    width: u16,
    height: u16,
}

impl Y4mReader {
    pub fn open(path: &Path, width: u16, height: u16) -> anyhow::Result<Y4mReader> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut header = String::new();
        reader
            .read_line(&mut header)
            .context("reading YUV4MPEG2 stream header")?;
        let header = header.trim_end();

        let mut tokens = header.split(' ');
        if tokens.next() != Some("YUV4MPEG2") {
            bail!("{} is not a YUV4MPEG2 stream", path.display());
        }

        let mut file_width = None;
        let mut file_height = None;
        for token in tokens.filter(|t| !t.is_empty()) {
            match token.split_at(1) {
                ("W", w) => file_width = Some(w.parse::<u16>().context("parsing frame width")?),
                ("H", h) => file_height = Some(h.parse::<u16>().context("parsing frame height")?),
                ("C", c) if !c.starts_with("420") => {
                    bail!("unsupported chroma subsampling C{c}, only 4:2:0 is supported")
                }
                _ => {}
            }
        }

        let (file_width, file_height) = match (file_width, file_height) {
            (Some(w), Some(h)) => (w, h),
            _ => bail!("stream header is missing frame dimensions"),
        };
        if (file_width, file_height) != (width, height) {
            bail!(
                "stream is {file_width}x{file_height}, expected {width}x{height}"
            );
        }

        Ok(Y4mReader {
            reader,
            width,
            height,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }
}

impl FrameSource for Y4mReader {
    fn read_frame(&mut self, into: &mut RawImage) -> Result<(), ProtocolError> {
        debug_assert_eq!((into.width(), into.height()), (self.width, self.height));

        let mut marker = String::new();
        if self.reader.read_line(&mut marker)? == 0 {
            return Err(ProtocolError::EndOfInput);
        }
        if !marker.starts_with("FRAME") {
            return Err(ProtocolError::Malformed("expected FRAME marker"));
        }

        self.reader.read_exact(into.y_mut())?;
        self.reader.read_exact(into.u_mut())?;
        self.reader.read_exact(into.v_mut())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_stream(name: &str, header: &str, frames: &[[u8; 6]]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tilecast-{name}-{}.y4m", std::process::id()));
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{header}").unwrap();
        for frame in frames {
            writeln!(file, "FRAME").unwrap();
            file.write_all(frame).unwrap();
        }
        path
    }

    #[test]
    fn reads_frames_until_end_of_input() {
        // 2x2 I420: 4 luma + 1 + 1 chroma bytes per frame
        let path = write_stream(
            "ok",
            "YUV4MPEG2 W2 H2 F30:1 Ip A1:1 C420jpeg",
            &[[1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12]],
        );

        let mut source = Y4mReader::open(&path, 2, 2).unwrap();
        let mut img = RawImage::new(2, 2);

        source.read_frame(&mut img).unwrap();
        assert_eq!(img.y(), &[1, 2, 3, 4]);
        assert_eq!(img.u(), &[5]);
        assert_eq!(img.v(), &[6]);

        source.read_frame(&mut img).unwrap();
        assert_eq!(img.y(), &[7, 8, 9, 10]);

        assert_matches!(
            source.read_frame(&mut img),
            Err(ProtocolError::EndOfInput)
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_wrong_dimensions_and_chroma() {
        let path = write_stream("dims", "YUV4MPEG2 W2 H2 F30:1", &[]);
        assert!(Y4mReader::open(&path, 4, 4).is_err());
        let _ = std::fs::remove_file(path);

        let path = write_stream("chroma", "YUV4MPEG2 W2 H2 C444", &[]);
        assert!(Y4mReader::open(&path, 2, 2).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_non_y4m_files() {
        let path = write_stream("magic", "RIFFdata", &[]);
        assert!(Y4mReader::open(&path, 2, 2).is_err());
        let _ = std::fs::remove_file(path);
    }
}
