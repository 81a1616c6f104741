use std::io::{BufRead, BufReader, Read};

use super::Frame;
use crate::{Error, Result};

/// Reads raw binary pixel-map (`P6`) frame records from a byte source, usually
/// the stdout pipe of an external decoder process.
///
/// Each record is an ASCII magic line, an ASCII "width height" line, an ASCII
/// max-channel-value line, then exactly `width * height * 3` raw bytes. There
/// are no other frame boundary markers.
///
/// Reads are blocking; the detection loop naturally stalls until the decoder
/// produces more bytes. A clean end of the source before the next magic line is
/// the expected termination signal and surfaces as `Ok(None)`, not as an error.
/// The reader is not restartable mid-stream: after an error or end of stream,
/// retries happen at "start a new decoder process" granularity, outside this
/// type.
///
/// Declared dimensions are capped (default: the expected production frame
/// size); a corrupt-but-numeric header is rejected before the payload buffer is
/// allocated.
pub struct FrameReader<R: Read> {
    source: BufReader<R>,
    frames_read: u64,
    max_dimensions: (u32, u32),
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source: BufReader::new(source),
            frames_read: 0,
            max_dimensions: (super::DEFAULT_EXPECTED_WIDTH, super::DEFAULT_EXPECTED_HEIGHT),
        }
    }

    /// Returns a new [FrameReader] accepting frames up to the provided
    /// dimensions.
    pub fn with_max_dimensions(mut self, width: u32, height: u32) -> Self {
        self.max_dimensions = (width, height);
        self
    }

    /// Number of frames decoded so far.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Pulls the next frame out of the source.
    ///
    /// Returns `Ok(None)` once the source is exhausted at a record boundary.
    /// Any malformed header or truncated payload is fatal for the stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let magic = match self.read_header_line()? {
            Some(line) => line,
            // Upstream closed its output: end of stream.
            None => return Ok(None),
        };
        if magic.trim() != "P6" {
            return Err(self.parse_error(format!("expected P6 magic, got {:?}", magic.trim())));
        }

        let dimensions = self
            .read_header_line()?
            .ok_or_else(|| self.parse_error("stream ended inside a frame header".into()))?;
        let mut parts = dimensions.split_whitespace();
        let (width, height) = match (parts.next(), parts.next(), parts.next()) {
            (Some(w), Some(h), None) => {
                let width: u32 = w
                    .parse()
                    .map_err(|_| self.parse_error(format!("non-numeric width {:?}", w)))?;
                let height: u32 = h
                    .parse()
                    .map_err(|_| self.parse_error(format!("non-numeric height {:?}", h)))?;
                (width, height)
            }
            _ => {
                return Err(
                    self.parse_error(format!("malformed dimension line {:?}", dimensions.trim()))
                )
            }
        };

        let max_value = self
            .read_header_line()?
            .ok_or_else(|| self.parse_error("stream ended inside a frame header".into()))?;
        let max_value: u32 = max_value.trim().parse().map_err(|_| {
            self.parse_error(format!("non-numeric max value {:?}", max_value.trim()))
        })?;
        if max_value != 255 {
            tracing::warn!(max_value, "unexpected max channel value, assuming 8-bit");
        }

        let (max_width, max_height) = self.max_dimensions;
        if width > max_width || height > max_height {
            return Err(self.parse_error(format!(
                "declared dimensions {}x{} exceed the expected {}x{}",
                width, height, max_width, max_height
            )));
        }

        // Exactly the declared payload size: never more, never less.
        let mut data = vec![0u8; (width as usize) * (height as usize) * 3];
        if let Err(e) = self.source.read_exact(&mut data) {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    Err(self.parse_error("truncated pixel payload".into()))
                }
                _ => Err(e.into()),
            };
        }

        self.frames_read += 1;
        // Length is correct by construction.
        Ok(Frame::from_raw(width, height, data))
    }

    // Reads one LF-terminated ASCII header line. `Ok(None)` means the source
    // ended cleanly before the line started.
    fn read_header_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.source.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| self.parse_error("header line is not valid UTF-8".into()))
    }

    fn parse_error(&self, reason: String) -> Error {
        Error::StreamParse {
            frame: self.frames_read,
            reason,
        }
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vision::testutil::{gradient_frame, ppm_stream, solid_frame};

    #[test]
    fn test_reads_consecutive_frames() {
        let frames = vec![gradient_frame(8, 6), solid_frame(8, 6, [1, 2, 3])];
        let bytes = ppm_stream(&frames);
        let mut reader = FrameReader::new(&bytes[..]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), frames[0]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), frames[1]);
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.frames_read(), 2);
    }

    #[test]
    fn test_empty_source_is_end_of_stream() {
        let mut reader = FrameReader::new(&[][..]);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_iterator_is_finite() {
        let bytes = ppm_stream(&[gradient_frame(4, 4)]);
        let reader = FrameReader::new(&bytes[..]);
        let frames: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_bad_magic_is_fatal() {
        let bytes = b"P5\n4 4\n255\n".to_vec();
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { frame: 0, .. })
        ));
    }

    #[test]
    fn test_non_numeric_dimensions_are_fatal() {
        let bytes = b"P6\nwide tall\n255\n".to_vec();
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_is_fatal() {
        let mut bytes = ppm_stream(&[solid_frame(4, 4, [9, 9, 9])]);
        bytes.truncate(bytes.len() - 5);
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { .. })
        ));
    }

    #[test]
    fn test_oversized_dimensions_are_fatal() {
        // A corrupt-but-numeric header must fail cleanly instead of driving a
        // multi-gigabyte payload allocation.
        let bytes = b"P6\n60000 60000\n255\n".to_vec();
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { .. })
        ));
    }

    #[test]
    fn test_max_dimensions_are_configurable() {
        let bytes = ppm_stream(&[gradient_frame(8, 6)]);
        let mut reader = FrameReader::new(&bytes[..]).with_max_dimensions(4, 4);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { .. })
        ));
        let mut reader = FrameReader::new(&bytes[..]).with_max_dimensions(8, 6);
        assert!(reader.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_non_utf8_header_is_fatal() {
        let bytes = b"P6\n\xff\xfe\n255\n".to_vec();
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { .. })
        ));
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        let bytes = b"P6\n4 4\n".to_vec();
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.next_frame(),
            Err(crate::Error::StreamParse { .. })
        ));
    }

    #[test]
    fn test_error_context_includes_frame_index() {
        let mut bytes = ppm_stream(&[solid_frame(4, 4, [1, 1, 1])]);
        bytes.extend_from_slice(b"P7\n4 4\n255\n");
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(reader.next_frame().unwrap().is_some());
        match reader.next_frame() {
            Err(crate::Error::StreamParse { frame, .. }) => assert_eq!(frame, 1),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
