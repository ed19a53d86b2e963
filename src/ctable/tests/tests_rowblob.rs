#[cfg(test)]
mod tests {
    use crate::ctable::rowblob::{IndexBlob, SubBlob};
    use crate::value::Blob;

    #[test]
    fn test_subblob_set_get_flatten() {
        let mut row = SubBlob::new();
        row.set("name", Blob::from(&b"anvil"[..])).unwrap();
        row.set("size", Blob::from_u32(42)).unwrap();

        let packed = row.flatten();
        let parsed = SubBlob::from_blob(&packed).unwrap();
        assert_eq!(parsed.get("name"), Some(Blob::from(&b"anvil"[..])));
        assert_eq!(parsed.get("size"), Some(Blob::from_u32(42)));
        assert_eq!(parsed.get("missing"), None);
    }

    #[test]
    fn test_subblob_extract_without_parse() {
        let mut row = SubBlob::new();
        row.set("a", Blob::from(&b"1"[..])).unwrap();
        row.set("b", Blob::from(&b"22"[..])).unwrap();
        let packed = row.flatten();

        assert_eq!(
            SubBlob::extract(&packed, "b").unwrap(),
            Some(Blob::from(&b"22"[..]))
        );
        assert_eq!(SubBlob::extract(&packed, "c").unwrap(), None);
        assert_eq!(SubBlob::extract(&Blob::dne(), "a").unwrap(), None);
    }

    #[test]
    fn test_subblob_remove_and_empty() {
        let mut row = SubBlob::new();
        row.set("only", Blob::from(&b"x"[..])).unwrap();
        assert!(!row.is_empty());
        row.remove("only").unwrap();
        assert!(row.is_empty());
    }

    #[test]
    fn test_subblob_overwrite_column() {
        let mut row = SubBlob::new();
        row.set("k", Blob::from(&b"old"[..])).unwrap();
        row.set("k", Blob::from(&b"new longer value"[..])).unwrap();
        let parsed = SubBlob::from_blob(&row.flatten()).unwrap();
        assert_eq!(parsed.get("k"), Some(Blob::from(&b"new longer value"[..])));
        assert_eq!(parsed.present().count(), 1);
    }

    #[test]
    fn test_subblob_wide_values_use_wider_lengths() {
        let mut row = SubBlob::new();
        let big = vec![7u8; 70_000];
        row.set("big", Blob::from(big.clone())).unwrap();
        row.set("small", Blob::from(&b"s"[..])).unwrap();
        let parsed = SubBlob::from_blob(&row.flatten()).unwrap();
        assert_eq!(parsed.get("big"), Some(Blob::from(big)));
        assert_eq!(parsed.get("small"), Some(Blob::from(&b"s"[..])));
    }

    #[test]
    fn test_subblob_rejects_long_names() {
        let mut row = SubBlob::new();
        let long = "x".repeat(300);
        assert!(row.set(&long, Blob::empty()).is_err());
    }

    #[test]
    fn test_indexblob_roundtrip_with_absent_slots() {
        let mut row = IndexBlob::new(3);
        row.set(0, Blob::from(&b"zero"[..])).unwrap();
        row.set(2, Blob::empty()).unwrap();

        let packed = row.flatten();
        let parsed = IndexBlob::from_blob(&packed, 3).unwrap();
        assert_eq!(parsed.get(0), Some(Blob::from(&b"zero"[..])));
        // Absent and empty are different states.
        assert_eq!(parsed.get(1), None);
        assert_eq!(parsed.get(2), Some(Blob::empty()));
    }

    #[test]
    fn test_indexblob_out_of_range_slot() {
        let mut row = IndexBlob::new(2);
        assert!(row.set(5, Blob::empty()).is_err());
    }

    #[test]
    fn test_indexblob_empty_detection() {
        let mut row = IndexBlob::new(2);
        assert!(row.is_empty());
        row.set(1, Blob::from(&b"v"[..])).unwrap();
        assert!(!row.is_empty());
        row.set(1, Blob::dne()).unwrap();
        assert!(row.is_empty());
    }
}
