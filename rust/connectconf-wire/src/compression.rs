//! Compression factories: a new encoder writing to `W`, a new decoder reading
//! from `R`, for every algorithm the harness negotiates.

use std::io::{self, Read, Write};

use connectconf_proto::Compression;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("unknown compression {0:?}")]
    Unknown(String),

    #[error("{algorithm}: {err}")]
    Io {
        algorithm: &'static str,
        err: io::Error,
    },

    #[error("decompressed message exceeds limit of {max} bytes")]
    TooLarge { max: usize },
}

/// A compressing writer. Call [`Encoder::finish`] to flush the trailer.
pub enum Encoder<W: Write> {
    Identity(W),
    Gzip(flate2::write::GzEncoder<W>),
    Deflate(flate2::write::DeflateEncoder<W>),
    Br(Box<brotli::CompressorWriter<W>>),
    Zstd(zstd::Encoder<'static, W>),
    Snappy(snap::write::FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(compression: Compression, inner: W) -> io::Result<Self> {
        Ok(match compression {
            Compression::Unspecified | Compression::Identity => Encoder::Identity(inner),
            Compression::Gzip => {
                Encoder::Gzip(flate2::write::GzEncoder::new(inner, flate2::Compression::default()))
            }
            Compression::Deflate => Encoder::Deflate(flate2::write::DeflateEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            Compression::Br => Encoder::Br(Box::new(brotli::CompressorWriter::new(
                inner,
                BROTLI_BUFFER,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            ))),
            Compression::Zstd => Encoder::Zstd(zstd::Encoder::new(inner, 0)?),
            Compression::Snappy => Encoder::Snappy(snap::write::FrameEncoder::new(inner)),
        })
    }

    /// Finish the compressed stream and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Identity(w) => Ok(w),
            Encoder::Gzip(e) => e.finish(),
            Encoder::Deflate(e) => e.finish(),
            Encoder::Br(e) => Ok(e.into_inner()),
            Encoder::Zstd(e) => e.finish(),
            Encoder::Snappy(e) => e
                .into_inner()
                .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string())),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Identity(w) => w.write(buf),
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Deflate(e) => e.write(buf),
            Encoder::Br(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
            Encoder::Snappy(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Identity(w) => w.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Deflate(e) => e.flush(),
            Encoder::Br(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
            Encoder::Snappy(e) => e.flush(),
        }
    }
}

/// A decompressing reader over `inner`.
pub fn new_decoder<'a, R: Read + 'a>(
    compression: Compression,
    inner: R,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::Unspecified | Compression::Identity => Box::new(inner),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(inner)),
        Compression::Deflate => Box::new(flate2::read::DeflateDecoder::new(inner)),
        Compression::Br => Box::new(brotli::Decompressor::new(inner, BROTLI_BUFFER)),
        Compression::Zstd => Box::new(zstd::Decoder::new(inner)?),
        Compression::Snappy => Box::new(snap::read::FrameDecoder::new(inner)),
    })
}

/// Compress a whole buffer.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let io_err = |err| CompressionError::Io {
        algorithm: compression.name(),
        err,
    };
    let mut encoder = Encoder::new(compression, Vec::new()).map_err(io_err)?;
    encoder.write_all(data).map_err(io_err)?;
    encoder.finish().map_err(io_err)
}

/// Decompress a whole buffer, refusing output larger than `max` (0 means no limit).
pub fn decompress(
    compression: Compression,
    data: &[u8],
    max: usize,
) -> Result<Vec<u8>, CompressionError> {
    let io_err = |err| CompressionError::Io {
        algorithm: compression.name(),
        err,
    };
    let decoder = new_decoder(compression, data).map_err(io_err)?;
    let mut out = Vec::new();
    if max == 0 {
        let mut decoder = decoder;
        decoder.read_to_end(&mut out).map_err(io_err)?;
        return Ok(out);
    }
    decoder
        .take(max as u64 + 1)
        .read_to_end(&mut out)
        .map_err(io_err)?;
    if out.len() > max {
        return Err(CompressionError::TooLarge { max });
    }
    Ok(out)
}

/// Look up an encoding token from a `*-encoding` header.
pub fn from_header(name: &str) -> Result<Compression, CompressionError> {
    Compression::from_name(name).ok_or_else(|| CompressionError::Unknown(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Compression; 6] = [
        Compression::Identity,
        Compression::Gzip,
        Compression::Deflate,
        Compression::Br,
        Compression::Zstd,
        Compression::Snappy,
    ];

    #[test]
    fn every_algorithm_inverts() {
        let data = b"grpc-status: 0\r\ngrpc-message: \r\n".repeat(20);
        for c in ALL {
            let packed = compress(c, &data).unwrap();
            assert_eq!(decompress(c, &packed, 0).unwrap(), data, "{c}");
        }
    }

    #[test]
    fn gzip_output_has_magic() {
        let packed = compress(Compression::Gzip, b"x").unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn deflate_is_raw() {
        // A zlib stream would start with 0x78.
        let packed = compress(Compression::Deflate, b"abc").unwrap();
        assert_ne!(packed[0], 0x78);
    }

    #[test]
    fn decompress_enforces_limit() {
        let packed = compress(Compression::Gzip, &[b'a'; 100]).unwrap();
        assert!(matches!(
            decompress(Compression::Gzip, &packed, 99),
            Err(CompressionError::TooLarge { max: 99 })
        ));
        assert_eq!(decompress(Compression::Gzip, &packed, 100).unwrap().len(), 100);
    }

    #[test]
    fn corrupt_input_is_an_error() {
        let err = decompress(Compression::Gzip, b"definitely not gzip", 0).unwrap_err();
        assert!(err.to_string().starts_with("gzip: "), "{err}");
    }

    #[test]
    fn header_tokens() {
        assert_eq!(from_header("").unwrap(), Compression::Identity);
        assert_eq!(from_header("zstd").unwrap(), Compression::Zstd);
        assert_eq!(
            from_header("lz4").unwrap_err().to_string(),
            "unknown compression \"lz4\""
        );
    }
}
