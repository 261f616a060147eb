//! Coding engine seam: erasure encode/decode over RaptorQ. The engine math
//! is opaque; this module fixes the parameters and the fragment shape.

use raptorq::{Decoder, Encoder, EncodingPacket, ObjectTransmissionInformation};

use crate::store::{Fragment, StorageError};

/// Symbol size in bytes. Must match on both peers for fragments to combine.
pub const SYMBOL_SIZE: u16 = 1024;

/// Serialized OTI length. The OTI is carried opaquely inside `FileMetadata`.
const OTI_LEN: usize = 12;

/// Output of a local encode: the opaque transfer information plus one
/// payload per generated fragment, tagged with its encoding symbol id.
#[derive(Debug)]
pub struct EncodedObject {
    pub oti: Vec<u8>,
    pub fragments: Vec<(u32, Vec<u8>)>,
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("cannot encode empty input")]
    EmptyInput,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconstructionError {
    #[error("no metadata stored for file {0}")]
    UnknownFile(String),
    #[error("insufficient fragments: {provided} provided, at least {needed} needed")]
    InsufficientFragments { provided: usize, needed: usize },
    #[error("codec fault: {0}")]
    CodecFault(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Number of source symbols for a transfer. The engine needs roughly this
/// many fragments, of any identity, to decode.
pub fn source_symbols(oti: &ObjectTransmissionInformation) -> usize {
    let transfer = oti.transfer_length();
    let sym = u64::from(oti.symbol_size());
    transfer.div_ceil(sym) as usize
}

/// Erasure-encode `data`, producing source symbols plus an equal number of
/// repair symbols: any K of the 2K fragments reconstruct the input.
pub fn encode(data: &[u8]) -> Result<EncodedObject, EncodingError> {
    if data.is_empty() {
        return Err(EncodingError::EmptyInput);
    }
    let oti = ObjectTransmissionInformation::with_defaults(data.len() as u64, SYMBOL_SIZE);
    let k = source_symbols(&oti) as u32;
    let oti_bytes = oti.serialize().to_vec();
    let encoder = Encoder::new(data, oti);
    let fragments = encoder
        .get_encoded_packets(k)
        .into_iter()
        .map(|packet| {
            let esi = packet.payload_id().encoding_symbol_id();
            (esi, packet.serialize())
        })
        .collect();
    Ok(EncodedObject {
        oti: oti_bytes,
        fragments,
    })
}

/// Rebuild the original bytes from stored fragments. Fails with
/// `InsufficientFragments` when the engine cannot complete from what was
/// supplied, and `CodecFault` for malformed OTI or fragment payloads.
pub fn decode(oti: &[u8], fragments: &[Fragment]) -> Result<Vec<u8>, ReconstructionError> {
    let oti_bytes: [u8; OTI_LEN] = oti
        .try_into()
        .map_err(|_| ReconstructionError::CodecFault(format!("bad OTI length {}", oti.len())))?;
    let oti = ObjectTransmissionInformation::deserialize(&oti_bytes);
    let needed = source_symbols(&oti);
    let mut decoder = Decoder::new(oti);
    for fragment in fragments {
        if fragment.payload.len() <= 4 {
            return Err(ReconstructionError::CodecFault(format!(
                "fragment {} too short",
                fragment.sequence_info
            )));
        }
        let packet = EncodingPacket::deserialize(&fragment.payload);
        if let Some(data) = decoder.decode(packet) {
            return Ok(data);
        }
    }
    Err(ReconstructionError::InsufficientFragments {
        provided: fragments.len(),
        needed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn fragments_of(encoded: &EncodedObject, file_id: &str) -> Vec<Fragment> {
        encoded
            .fragments
            .iter()
            .map(|(esi, payload)| Fragment {
                file_id: file_id.to_string(),
                sequence_info: *esi,
                payload: payload.clone(),
            })
            .collect()
    }

    #[test]
    fn roundtrip_with_all_fragments() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode(&data).unwrap();
        let fragments = fragments_of(&encoded, "f");
        let rebuilt = decode(&encoded.oti, &fragments).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn ten_kilobytes_yields_twenty_fragments() {
        let data = vec![7u8; 10_000];
        let encoded = encode(&data).unwrap();
        assert_eq!(encoded.fragments.len(), 20);
    }

    #[test]
    fn survives_losing_any_six_of_twenty() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        let encoded = encode(&data).unwrap();
        let mut fragments = fragments_of(&encoded, "f");
        let mut rng = rand::thread_rng();
        fragments.shuffle(&mut rng);
        fragments.truncate(fragments.len() - 6);
        let rebuilt = decode(&encoded.oti, &fragments).unwrap();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn below_threshold_reports_insufficient() {
        let data = vec![3u8; 10_000];
        let encoded = encode(&data).unwrap();
        let mut fragments = fragments_of(&encoded, "f");
        // 10 source symbols are needed; keep fewer than that.
        fragments.truncate(5);
        match decode(&encoded.oti, &fragments) {
            Err(ReconstructionError::InsufficientFragments { provided, needed }) => {
                assert_eq!(provided, 5);
                assert_eq!(needed, 10);
            }
            other => panic!("expected InsufficientFragments, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(encode(&[]), Err(EncodingError::EmptyInput)));
    }

    #[test]
    fn malformed_oti_is_a_codec_fault() {
        let fragments = vec![Fragment {
            file_id: "f".to_string(),
            sequence_info: 0,
            payload: vec![0u8; 32],
        }];
        assert!(matches!(
            decode(&[1, 2, 3], &fragments),
            Err(ReconstructionError::CodecFault(_))
        ));
    }

    #[test]
    fn truncated_fragment_is_a_codec_fault() {
        let data = vec![9u8; 2048];
        let encoded = encode(&data).unwrap();
        let fragments = vec![Fragment {
            file_id: "f".to_string(),
            sequence_info: 0,
            payload: vec![1, 2],
        }];
        assert!(matches!(
            decode(&encoded.oti, &fragments),
            Err(ReconstructionError::CodecFault(_))
        ));
    }
}
