#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::journal::{JournalError, JournalListener, SysJournal};

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

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

    #[test]
    fn test_filter_drops_discarded_and_bumps_sequence() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        let journal = SysJournal::open(&path, true, true).unwrap();

        journal.append(1, b"live-1").unwrap();
        journal.append(2, b"dead").unwrap();
        journal.append(1, b"live-2").unwrap();
        journal.discard(2).unwrap();
        journal.commit().unwrap();

        let size_before = journal.committed_size().unwrap();
        assert_eq!(journal.sequence().unwrap(), 0);

        journal.filter().unwrap();

        assert_eq!(journal.sequence().unwrap(), 1);
        assert!(journal.committed_size().unwrap() < size_before);
        assert!(tmp.path().join("sys_journal.1").exists());
        assert!(!tmp.path().join("sys_journal.0").exists());

        // Surviving entries replay in order.
        let recorder = Recorder::new();
        journal
            .register_listener(1, Arc::downgrade(&recorder) as std::sync::Weak<dyn JournalListener>)
            .unwrap();
        journal.get_entries(1).unwrap();
        assert_eq!(recorder.seen(), vec![b"live-1".to_vec(), b"live-2".to_vec()]);
    }

    #[test]
    fn test_filter_idempotent_modulo_sequence() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        let journal = SysJournal::open(&path, true, true).unwrap();

        journal.append(4, b"entry").unwrap();
        journal.commit().unwrap();

        journal.filter().unwrap();
        let size_once = journal.committed_size().unwrap();
        journal.filter().unwrap();

        assert_eq!(journal.sequence().unwrap(), 2);
        assert_eq!(journal.committed_size().unwrap(), size_once);

        let recorder = Recorder::new();
        journal
            .register_listener(4, Arc::downgrade(&recorder) as std::sync::Weak<dyn JournalListener>)
            .unwrap();
        journal.get_entries(4).unwrap();
        assert_eq!(recorder.seen(), vec![b"entry".to_vec()]);
    }

    #[test]
    fn test_reopen_after_filter_reads_new_data_file() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        {
            let journal = SysJournal::open(&path, true, true).unwrap();
            journal.append(8, b"survives").unwrap();
            journal.append(9, b"does not").unwrap();
            journal.discard(9).unwrap();
            journal.commit().unwrap();
            journal.filter().unwrap();
        }

        let journal = SysJournal::open(&path, false, true).unwrap();
        assert_eq!(journal.sequence().unwrap(), 1);

        let recorder = Recorder::new();
        journal
            .register_listener(8, Arc::downgrade(&recorder) as std::sync::Weak<dyn JournalListener>)
            .unwrap();
        journal.get_entries(8).unwrap();
        assert_eq!(recorder.seen(), vec![b"survives".to_vec()]);
    }

    #[test]
    fn test_open_filters_when_only_discarded_entries_remain() {
        init_tracing();

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sys_journal");
        {
            let journal = SysJournal::open(&path, true, true).unwrap();
            journal.append(3, b"going away").unwrap();
            journal.discard(3).unwrap();
            journal.commit().unwrap();
        }

        let journal = SysJournal::open(&path, false, true).unwrap();
        // Everything was discarded, so open compacted to an empty journal
        // under the next sequence number.
        assert_eq!(journal.sequence().unwrap(), 1);
        assert_eq!(journal.committed_size().unwrap(), 8);
    }
}
