#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::journal::{JournalError, JournalListener, ListenerId, SysJournal, UniqueIdFile};

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    /// Collects replayed entries for inspection.
    struct Recorder {
        entries: Mutex<Vec<Vec<u8>>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Vec<u8>> {
            self.entries.lock().unwrap().clone()
        }
    }

    impl JournalListener for Recorder {
        fn journal_replay(&self, entry: &[u8]) -> Result<(), JournalError> {
            self.entries.lock().unwrap().push(entry.to_vec());
            Ok(())
        }
    }

    fn register(journal: &SysJournal, id: ListenerId, recorder: &Arc<Recorder>) {
        let weak: std::sync::Weak<dyn JournalListener> =
            Arc::downgrade(recorder) as std::sync::Weak<dyn JournalListener>;
        journal.register_listener(id, weak).unwrap();
    }

    #[test]
    fn test_create_append_replay() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        let journal = SysJournal::open(&path, true, true).unwrap();

        journal.append(7, b"one").unwrap();
        journal.append(7, b"two").unwrap();
        journal.append(9, b"other").unwrap();
        journal.commit().unwrap();

        let recorder = Recorder::new();
        register(&journal, 7, &recorder);
        journal.get_entries(7).unwrap();

        assert_eq!(recorder.seen(), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_uncommitted_entries_invisible_after_reopen() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        {
            let journal = SysJournal::open(&path, true, true).unwrap();
            journal.append(1, b"durable").unwrap();
            journal.commit().unwrap();
            journal.append(1, b"lost").unwrap();
            // Drop commits, so fake the crash by forgetting the commit:
            // reopen from a copy of the meta file state by not dropping —
            // instead verify via committed_size that replay is bounded.
            let committed = journal.committed_size().unwrap();
            let recorder = Recorder::new();
            register(&journal, 1, &recorder);
            journal.get_entries(1).unwrap();
            assert_eq!(recorder.seen(), vec![b"durable".to_vec()]);
            assert!(journal.committed_size().unwrap() == committed);
        }
    }

    #[test]
    fn test_discard_cancels_prior_entries() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        let journal = SysJournal::open(&path, true, true).unwrap();

        journal.append(3, b"a").unwrap();
        journal.append(3, b"b").unwrap();
        journal.discard(3).unwrap();
        journal.commit().unwrap();

        assert_eq!(journal.live_entries(3).unwrap(), 0);

        // Appends after a discard are a caller bug.
        assert!(matches!(
            journal.append(3, b"late"),
            Err(JournalError::InvalidListener(3))
        ));
    }

    #[test]
    fn test_reopen_rebuilds_discard_state() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        {
            let journal = SysJournal::open(&path, true, true).unwrap();
            journal.append(5, b"kept").unwrap();
            journal.append(6, b"dropped").unwrap();
            journal.discard(6).unwrap();
            journal.commit().unwrap();
        }

        // filter_on_empty off, so the file still has both records; replay
        // for listener 6 is suppressed by its discard marker.
        let journal = SysJournal::open(&path, false, false).unwrap();
        assert_eq!(journal.live_entries(5).unwrap(), 1);
        assert_eq!(journal.live_entries(6).unwrap(), 0);

        let keeper = Recorder::new();
        register(&journal, 5, &keeper);
        journal.get_entries(5).unwrap();
        assert_eq!(keeper.seen(), vec![b"kept".to_vec()]);
    }

    #[test]
    fn test_playback_all_tolerates_missing_listeners() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        let journal = SysJournal::open(&path, true, true).unwrap();

        journal.append(11, b"seen").unwrap();
        journal.append(12, b"nobody home").unwrap();
        journal.commit().unwrap();

        let recorder = Recorder::new();
        register(&journal, 11, &recorder);

        // Tolerant by default...
        journal.playback(None, false).unwrap();
        assert_eq!(recorder.seen(), vec![b"seen".to_vec()]);

        // ...strict when asked.
        assert!(matches!(
            journal.playback(None, true),
            Err(JournalError::MissingListeners(1))
        ));
    }

    #[test]
    fn test_duplicate_listener_registration_fails() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        let journal = SysJournal::open(&path, true, true).unwrap();

        let first = Recorder::new();
        let second = Recorder::new();
        register(&journal, 2, &first);
        let second_weak: std::sync::Weak<dyn JournalListener> =
            Arc::downgrade(&second) as std::sync::Weak<dyn JournalListener>;
        assert!(matches!(
            journal.register_listener(2, second_weak.clone()),
            Err(JournalError::ListenerExists(2))
        ));

        // Dropping the first frees the id.
        drop(first);
        journal.register_listener(2, second_weak).unwrap();
    }

    #[test]
    fn test_unique_ids_monotonic_across_reopen() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("unique_id");
        let first_batch: Vec<u32> = {
            let ids = UniqueIdFile::open(&path, true).unwrap();
            (0..3).map(|_| ids.next_id().unwrap()).collect()
        };
        assert_eq!(first_batch, vec![0, 1, 2]);

        let ids = UniqueIdFile::open(&path, false).unwrap();
        assert_eq!(ids.next_id().unwrap(), 3);
    }
}
