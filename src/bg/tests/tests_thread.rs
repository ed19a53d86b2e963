#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::bg::MaintenanceThread;
    use crate::dtable::Dtable;
    use crate::env::Env;
    use crate::factory::Registry;
    use crate::params::Params;
    use crate::value::{Blob, Dtype, KeyType};

    #[test]
    fn test_maintenance_thread_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let env = Env::open(tmp.path().join("store")).unwrap();
        let config = Params::parse(
            r#"config [
                "base" class(dt) simple_dtable
                "digest_interval" int 100000
                "combine_interval" int 100000
            ]"#,
            &Registry::standard(),
        )
        .unwrap();
        env.create_managed("table", &config, KeyType::U32).unwrap();
        let table = env.open_managed("table", &config).unwrap();
        table.insert(&Dtype::U32(1), Blob::from(&b"v"[..])).unwrap();

        let mut worker = MaintenanceThread::spawn(table.clone(), Duration::from_millis(10));
        assert!(!worker.stop_requested());
        worker.poke();
        std::thread::sleep(Duration::from_millis(50));

        // Maintenance ran (intervals were far away, so no digest), and the
        // table stayed fully usable underneath the worker.
        assert_eq!(
            table.get(&Dtype::U32(1)).unwrap(),
            Some(Blob::from(&b"v"[..]))
        );
        assert_eq!(table.disk_count().unwrap(), 0);

        worker.stop();
        assert!(worker.stop_requested());
    }
}
