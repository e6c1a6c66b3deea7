//! H.264 framing helpers.
//!
//! FFmpeg encoders emit Annex B (start-code delimited) access units and
//! parameter sets. Containers such as MP4 want avcc framing: every NAL unit
//! prefixed by its 4-byte big-endian length, and the SPS/PPS packed into an
//! `AVCDecoderConfigurationRecord`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ExportError, Result};

pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Length of the NAL size prefix written by `convert_annexb_to_avcc`.
pub const LENGTH_SIZE: usize = 4;

/// Check if packet data is in Annex B format by looking at the start codes.
pub fn is_annexb_packet(data: &[u8]) -> bool {
    data.starts_with(&[0x00, 0x00, 0x00, 0x01]) || data.starts_with(&[0x00, 0x00, 0x01])
}

/// Returns `(offset, start code length)` of the first start code in `data`.
fn find_start_code(data: &[u8]) -> Option<(usize, usize)> {
    let len = data.len();
    if len < 3 {
        return None;
    }
    for i in 0..len - 2 {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            } else if i + 3 < len && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
    }
    None
}

/// Splits an Annex B byte stream into NAL units (start codes stripped).
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut pos = match find_start_code(data) {
        Some((offset, len)) => offset + len,
        None => return nals,
    };
    while pos < data.len() {
        let rest = &data[pos..];
        let end = match find_start_code(rest) {
            Some((offset, _)) => pos + offset,
            None => data.len(),
        };
        let nal = trim_trailing_zeros(&data[pos..end]);
        if !nal.is_empty() {
            nals.push(nal);
        }
        pos = match find_start_code(rest) {
            Some((offset, len)) => pos + offset + len,
            None => data.len(),
        };
    }
    nals
}

// A 4-byte start code leaves its leading zero at the end of the previous NAL.
fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let mut end = nal.len();
    while end > 0 && nal[end - 1] == 0 {
        end -= 1;
    }
    &nal[..end]
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|header| header & 0x1F)
}

/// Converts Annex B (start code + NAL) to avcc (4-byte length + NAL).
/// Data without start codes is assumed to be avcc already and returned as is.
pub fn convert_annexb_to_avcc(data: &[u8]) -> Bytes {
    if !is_annexb_packet(data) {
        return Bytes::copy_from_slice(data);
    }
    let nals = split_annexb(data);
    let mut out = BytesMut::with_capacity(data.len() + nals.len() * LENGTH_SIZE);
    for nal in nals {
        out.put_u32(nal.len() as u32);
        out.extend_from_slice(nal);
    }
    out.freeze()
}

/// Builds an `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15) from SPS and
/// PPS NAL units.
pub fn decoder_config_record(sps: &[&[u8]], pps: &[&[u8]]) -> Result<Bytes> {
    let first = sps
        .first()
        .ok_or_else(|| ExportError::Encode("missing SPS".to_string()))?;
    if first.len() < 4 {
        return Err(ExportError::Encode(format!(
            "SPS too short: {} bytes",
            first.len()
        )));
    }
    if pps.is_empty() {
        return Err(ExportError::Encode("missing PPS".to_string()));
    }
    if sps.len() > 31 || pps.len() > 255 {
        return Err(ExportError::Encode("too many parameter sets".to_string()));
    }

    let mut out = BytesMut::new();
    out.put_u8(1);
    // profile, compatibility, level
    out.put_slice(&first[1..4]);
    out.put_u8(0xFC | (LENGTH_SIZE as u8 - 1));
    out.put_u8(0xE0 | sps.len() as u8);
    for nal in sps {
        out.put_u16(nal.len() as u16);
        out.put_slice(nal);
    }
    out.put_u8(pps.len() as u8);
    for nal in pps {
        out.put_u16(nal.len() as u16);
        out.put_slice(nal);
    }
    Ok(out.freeze())
}

/// Turns encoder extradata into a decoder descriptor. Extradata that already
/// is a configuration record (version byte 1) is passed through.
pub fn decoder_descriptor(extradata: &[u8]) -> Result<Option<Bytes>> {
    if extradata.is_empty() {
        return Ok(None);
    }
    if !is_annexb_packet(extradata) {
        if extradata[0] == 0x01 && extradata.len() >= 7 {
            return Ok(Some(Bytes::copy_from_slice(extradata)));
        }
        return Err(ExportError::Encode(
            "unrecognised H.264 extradata".to_string(),
        ));
    }

    let nals = split_annexb(extradata);
    let sps: Vec<&[u8]> = nals
        .iter()
        .copied()
        .filter(|nal| nal_type(nal) == Some(NAL_SPS))
        .collect();
    let pps: Vec<&[u8]> = nals
        .iter()
        .copied()
        .filter(|nal| nal_type(nal) == Some(NAL_PPS))
        .collect();
    decoder_config_record(&sps, &pps).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
    const PPS: &[u8] = &[0x68, 0xEB, 0xE3, 0xCB];

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb_packet(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb_packet(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb_packet(&[0x01, 0x00, 0x00, 0x00]));
        assert!(!is_annexb_packet(&[0x00, 0x00]));
    }

    #[test]
    fn test_split_mixed_start_codes() {
        let stream = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x00, 0x00, 0x00,
            0x01, 0x65, 0x88,
        ];
        let expected: Vec<&[u8]> = vec![&[0x67u8, 0x42][..], &[0x68u8, 0xCE][..], &[0x65u8, 0x88][..]];
        assert_eq!(split_annexb(&stream), expected);
    }

    #[test]
    fn test_annexb_to_avcc() {
        let annexb = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x81, 0x00, 0x00, 0x01, 0x06, 0x05];
        let out = convert_annexb_to_avcc(&annexb);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 3, 0x65, 0x88, 0x81, 0, 0, 0, 2, 0x06, 0x05][..]
        );
    }

    #[test]
    fn test_avcc_passthrough() {
        let avcc = [0u8, 0, 0, 2, 0x41, 0x9A];
        assert_eq!(&convert_annexb_to_avcc(&avcc)[..], &avcc[..]);
    }

    #[test]
    fn test_decoder_config_record_layout() {
        let record = decoder_config_record(&[SPS], &[PPS]).unwrap();
        let mut expected = vec![0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x06];
        expected.extend_from_slice(SPS);
        expected.extend_from_slice(&[0x01, 0x00, 0x04]);
        expected.extend_from_slice(PPS);
        assert_eq!(&record[..], &expected[..]);
    }

    #[test]
    fn test_descriptor_from_annexb_extradata() {
        let mut extradata = vec![0x00, 0x00, 0x00, 0x01];
        extradata.extend_from_slice(SPS);
        extradata.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        extradata.extend_from_slice(PPS);

        let descriptor = decoder_descriptor(&extradata).unwrap().unwrap();
        assert_eq!(descriptor, decoder_config_record(&[SPS], &[PPS]).unwrap());
        assert_eq!(decoder_descriptor(&descriptor).unwrap(), Some(descriptor));
    }

    #[test]
    fn test_descriptor_requires_pps() {
        let mut extradata = vec![0x00, 0x00, 0x00, 0x01];
        extradata.extend_from_slice(SPS);
        assert!(decoder_descriptor(&extradata).is_err());
        assert_eq!(decoder_descriptor(&[]).unwrap(), None);
    }
}
