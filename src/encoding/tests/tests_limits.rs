#[cfg(test)]
mod tests {
    use crate::encoding::{
        EncodingError, MAX_BYTE_LEN, MAX_VEC_ELEMENTS, decode_from_slice, decode_vec,
        encode_to_vec,
    };

    #[test]
    fn test_truncated_u32_reports_eof() {
        let err = decode_from_slice::<u32>(&[1u8, 2]).unwrap_err();
        match err {
            EncodingError::UnexpectedEof { needed, available } => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_byte_vector_payload() {
        // Length prefix claims 10 bytes but only 3 follow.
        let mut bytes = encode_to_vec(&10u32).unwrap();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert!(decode_from_slice::<Vec<u8>>(&bytes).is_err());
    }

    #[test]
    fn test_byte_length_bomb_rejected() {
        let bytes = encode_to_vec(&(MAX_BYTE_LEN + 1)).unwrap();
        let err = decode_from_slice::<Vec<u8>>(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn test_vec_count_bomb_rejected() {
        let bytes = encode_to_vec(&(MAX_VEC_ELEMENTS + 1)).unwrap();
        let err = decode_vec::<u32>(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn test_empty_buffer_fails_cleanly() {
        assert!(decode_from_slice::<u8>(&[]).is_err());
        assert!(decode_from_slice::<u64>(&[]).is_err());
        assert!(decode_from_slice::<Vec<u8>>(&[]).is_err());
        assert!(decode_from_slice::<String>(&[]).is_err());
    }
}
