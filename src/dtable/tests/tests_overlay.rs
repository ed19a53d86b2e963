#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::dtable::tests::helpers::{collect, collect_keys, init_tracing, seeded_memory};
    use crate::dtable::{Dtable, iter::SkipIter, overlay::OverlayDtable};
    use crate::value::{Blob, Dtype};

    fn sample_overlay() -> OverlayDtable {
        // Lower layer: 1..4; upper layer shadows 2 with a new value and
        // tombstones 3.
        let lower = seeded_memory(&[(1, b"a0"), (2, b"b0"), (3, b"c0"), (4, b"d0")]);
        let upper = seeded_memory(&[(2, b"b1"), (5, b"e1")]);
        upper.remove(&Dtype::U32(3)).unwrap();
        OverlayDtable::new(vec![Arc::new(upper), Arc::new(lower)]).unwrap()
    }

    #[test]
    fn test_lookup_stops_at_first_decision() {
        init_tracing();

        let overlay = sample_overlay();
        assert_eq!(
            overlay.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"a0"[..]))
        );
        // The upper layer wins.
        assert_eq!(
            overlay.get(&Dtype::U32(2)).unwrap(),
            Some(Blob::from(&b"b1"[..]))
        );
        // The upper tombstone hides the lower value.
        let stored = overlay.lookup(&Dtype::U32(3)).unwrap().unwrap();
        assert!(!stored.exists());
        assert_eq!(overlay.get(&Dtype::U32(3)).unwrap(), None);
        assert_eq!(overlay.lookup(&Dtype::U32(9)).unwrap(), None);
    }

    #[test]
    fn test_merge_iteration_one_entry_per_key() {
        init_tracing();

        let overlay = sample_overlay();
        let mut iter = overlay.iterate().unwrap();
        let entries = collect(iter.as_mut());
        let keys: Vec<u32> = entries
            .iter()
            .map(|(key, _)| match key {
                Dtype::U32(k) => *k,
                other => panic!("unexpected key {other:?}"),
            })
            .collect();
        // Tombstones are surfaced by the raw merge.
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert_eq!(entries[1].1, Blob::from(&b"b1"[..]));
        assert!(!entries[2].1.exists());
    }

    #[test]
    fn test_external_view_skips_tombstones() {
        init_tracing();

        let overlay = sample_overlay();
        let merged = overlay.iterate().unwrap();
        let mut external = SkipIter::skip_nonexistent(merged);
        assert_eq!(collect_keys(&mut external), vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_backward_iteration() {
        init_tracing();

        let overlay = sample_overlay();
        let mut iter = overlay.iterate().unwrap();
        assert!(iter.last());
        let mut keys = Vec::new();
        loop {
            let Some(Dtype::U32(key)) = iter.key() else {
                panic!("invalid position");
            };
            keys.push(key);
            if !iter.prev() {
                break;
            }
        }
        assert_eq!(keys, vec![5, 4, 3, 2, 1]);
        // prev at the first entry did not move.
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(1)));
    }

    #[test]
    fn test_direction_changes() {
        init_tracing();

        let overlay = sample_overlay();
        let mut iter = overlay.iterate().unwrap();

        assert!(iter.seek(&Dtype::U32(3)));
        assert!(iter.next());
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(4)));
        assert!(iter.prev());
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(3)));
        assert!(iter.prev());
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(2)));
        assert!(iter.next());
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(3)));
    }

    #[test]
    fn test_seek_prev_past_end() {
        init_tracing();

        let overlay = sample_overlay();
        let mut iter = overlay.iterate().unwrap();
        assert!(!iter.seek(&Dtype::U32(77)));
        assert!(!iter.valid());
        assert!(iter.prev());
        assert_eq!(iter.key().map(|k| k.flatten()), Some(Blob::from_u32(5)));
    }

    #[test]
    fn test_key_type_mismatch_rejected() {
        init_tracing();

        let u32_layer = seeded_memory(&[(1, b"a")]);
        let str_layer = crate::dtable::memory::MemoryDtable::new(crate::value::KeyType::Str, false);
        assert!(OverlayDtable::new(vec![Arc::new(u32_layer), Arc::new(str_layer)]).is_err());
    }
}
