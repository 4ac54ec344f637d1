//! Framing: 4-byte big-endian metadata length + UTF-8 `<name><delim><size>`, then raw payload.

use crate::error::TransferError;
use crate::protocol::Metadata;

pub const LEN_SIZE: usize = 4;
pub const MAX_METADATA_LEN: u32 = 64 * 1024; // 64 KiB

/// Length prefix and metadata bytes, kept apart because they go out as two writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedHeader {
    pub length: [u8; LEN_SIZE],
    pub metadata: Vec<u8>,
}

impl EncodedHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LEN_SIZE + self.metadata.len());
        out.extend_from_slice(&self.length);
        out.extend_from_slice(&self.metadata);
        out
    }
}

/// Check that `name` can be carried in a header delimited by `delimiter`.
pub fn check_file_name(name: &str, delimiter: char) -> Result<(), FrameEncodeError> {
    if name.is_empty() {
        return Err(FrameEncodeError::EmptyName);
    }
    if name.contains(delimiter) {
        return Err(FrameEncodeError::DelimiterInName(delimiter));
    }
    Ok(())
}

/// Encode the header for `meta`. The payload follows it on the wire unframed.
pub fn encode_header(meta: &Metadata, delimiter: char) -> Result<EncodedHeader, FrameEncodeError> {
    check_file_name(&meta.file_name, delimiter)?;
    let metadata = format!("{}{}{}", meta.file_name, delimiter, meta.file_size).into_bytes();
    let len = u32::try_from(metadata.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_METADATA_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(EncodedHeader {
        length: len.to_be_bytes(),
        metadata,
    })
}

/// Error encoding a header.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("file name is empty")]
    EmptyName,
    #[error("file name contains the delimiter {0:?}")]
    DelimiterInName(char),
    #[error("metadata too large")]
    TooLarge,
}

/// Read the metadata length from the first [`LEN_SIZE`] bytes.
pub fn decode_length(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let Some(prefix) = bytes.get(..LEN_SIZE) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if len > MAX_METADATA_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Split a metadata string on the first delimiter. A size that is not a
/// non-negative decimal integer is read as 0.
pub fn parse_metadata(bytes: &[u8], delimiter: char) -> Result<Metadata, FrameDecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameDecodeError::NotUtf8)?;
    let (name, size) = text
        .split_once(delimiter)
        .ok_or(FrameDecodeError::MissingDelimiter)?;
    Ok(Metadata {
        file_name: name.to_string(),
        file_size: size.parse().unwrap_or(0),
    })
}

/// Decode length prefix + metadata from the front of `bytes`. Returns the
/// metadata and the number of bytes consumed; the payload starts right after.
/// Returns `NeedMore` on a partial buffer (caller should read more, or treat
/// it as truncated at end of stream).
pub fn decode_header(bytes: &[u8], delimiter: char) -> Result<(Metadata, usize), FrameDecodeError> {
    let len = decode_length(bytes)?;
    let Some(metadata) = bytes.get(LEN_SIZE..LEN_SIZE + len) else {
        return Err(FrameDecodeError::NeedMore);
    };
    let meta = parse_metadata(metadata, delimiter)?;
    Ok((meta, LEN_SIZE + len))
}

/// Error decoding a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("metadata too large")]
    TooLarge,
    #[error("metadata is not UTF-8")]
    NotUtf8,
    #[error("metadata has no delimiter")]
    MissingDelimiter,
}

impl From<FrameDecodeError> for TransferError {
    fn from(e: FrameDecodeError) -> Self {
        TransferError::InvalidMetadata(match e {
            FrameDecodeError::NeedMore => "truncated header",
            FrameDecodeError::TooLarge => "metadata too large",
            FrameDecodeError::NotUtf8 => "metadata is not UTF-8",
            FrameDecodeError::MissingDelimiter => "missing delimiter",
        })
    }
}

impl From<FrameEncodeError> for TransferError {
    fn from(e: FrameEncodeError) -> Self {
        TransferError::InvalidMetadata(match e {
            FrameEncodeError::EmptyName => "empty file name",
            FrameEncodeError::DelimiterInName(_) => "file name contains the delimiter",
            FrameEncodeError::TooLarge => "metadata too large",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn header_layout() {
        let h = encode_header(&Metadata::new("photo.jpg", 10_000), '|').unwrap();
        assert_eq!(h.metadata, b"photo.jpg|10000");
        assert_eq!(h.length, [0, 0, 0, 15]);
        let bytes = h.to_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 15]);
        assert_eq!(&bytes[4..], b"photo.jpg|10000");
    }

    #[test]
    fn roundtrip_with_payload() {
        let payload = b"hello world".to_vec();
        let meta = Metadata::new("notes.txt", payload.len() as u64);
        let mut frame = encode_header(&meta, '|').unwrap().to_bytes();
        frame.extend_from_slice(&payload);

        let (decoded, n) = decode_header(&frame, '|').unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(&frame[n..], payload.as_slice());
    }

    #[test]
    fn roundtrip_empty_file() {
        let meta = Metadata::new("empty.bin", 0);
        let frame = encode_header(&meta, '|').unwrap().to_bytes();
        let (decoded, n) = decode_header(&frame, '|').unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(n, frame.len());
    }

    #[test]
    fn roundtrip_custom_delimiter_and_unicode_name() {
        let meta = Metadata::new("résumé|final.pdf", 42);
        let frame = encode_header(&meta, '#').unwrap().to_bytes();
        let (decoded, _) = decode_header(&frame, '#').unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn short_header_needs_more() {
        assert_eq!(decode_header(&[], '|'), Err(FrameDecodeError::NeedMore));
        assert_eq!(decode_header(&[0, 0, 0], '|'), Err(FrameDecodeError::NeedMore));
    }

    #[test]
    fn truncated_metadata_needs_more() {
        let frame = encode_header(&Metadata::new("a.txt", 5), '|')
            .unwrap()
            .to_bytes();
        for cut in LEN_SIZE..frame.len() {
            assert_eq!(
                decode_header(&frame[..cut], '|'),
                Err(FrameDecodeError::NeedMore)
            );
        }
    }

    #[test]
    fn missing_delimiter_is_invalid_metadata() {
        let err = parse_metadata(b"report.pdf999", '|').unwrap_err();
        assert_eq!(err, FrameDecodeError::MissingDelimiter);
        assert_eq!(TransferError::from(err).kind(), ErrorKind::InvalidMetadata);
    }

    #[test]
    fn splits_on_first_delimiter() {
        let meta = parse_metadata(b"a|b|3", '|').unwrap();
        assert_eq!(meta.file_name, "a");
        // "b|3" is not a number.
        assert_eq!(meta.file_size, 0);
    }

    #[test]
    fn malformed_size_reads_as_zero() {
        assert_eq!(parse_metadata(b"x.bin|", '|').unwrap().file_size, 0);
        assert_eq!(parse_metadata(b"x.bin|-12", '|').unwrap().file_size, 0);
        assert_eq!(parse_metadata(b"x.bin|12kb", '|').unwrap().file_size, 0);
    }

    #[test]
    fn non_utf8_rejected() {
        assert_eq!(
            parse_metadata(&[0xff, b'|', b'1'], '|'),
            Err(FrameDecodeError::NotUtf8)
        );
    }

    #[test]
    fn oversized_length_rejected() {
        let len = (MAX_METADATA_LEN + 1).to_be_bytes();
        assert_eq!(decode_length(&len), Err(FrameDecodeError::TooLarge));
    }

    #[test]
    fn encode_rejects_unencodable_names() {
        assert!(matches!(
            encode_header(&Metadata::new("", 1), '|'),
            Err(FrameEncodeError::EmptyName)
        ));
        assert!(matches!(
            encode_header(&Metadata::new("a|b", 1), '|'),
            Err(FrameEncodeError::DelimiterInName('|'))
        ));
        let long = "x".repeat(MAX_METADATA_LEN as usize);
        assert!(matches!(
            encode_header(&Metadata::new(long, 1), '|'),
            Err(FrameEncodeError::TooLarge)
        ));
    }
}
