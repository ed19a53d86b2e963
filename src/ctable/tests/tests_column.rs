#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::ctable::{Ctable, column::ColumnCtable};
    use crate::env::Env;
    use crate::factory::Registry;
    use crate::params::Params;
    use crate::value::{Blob, Dtype, KeyType};

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    const CONFIG: &str = r#"config [
        "columns" int 3
        "column0_name" string "name"
        "column1_name" string "qty"
        "column2_name" string "note"
        "base" class(dt) managed_dtable
        "base_config" config [ "base" class(dt) simple_dtable ]
    ]"#;

    fn test_env() -> (TempDir, Env) {
        let tmp = TempDir::new().unwrap();
        let env = Env::open(tmp.path().join("store")).unwrap();
        (tmp, env)
    }

    fn open_table(env: &Env) -> ColumnCtable {
        let cfg = Params::parse(CONFIG, &Registry::standard()).unwrap();
        ColumnCtable::create(env.ctx(), &env.dir().join("cols"), &cfg, KeyType::U32).unwrap();
        ColumnCtable::open(env.ctx(), &env.dir().join("cols"), &cfg).unwrap()
    }

    #[test]
    fn test_insert_routes_to_one_column() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env);

        table
            .insert(&Dtype::U32(1), "name", Blob::from(&b"bolt"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(1), "qty", Blob::from_u32(12))
            .unwrap();

        assert_eq!(
            table.find(&Dtype::U32(1), "name").unwrap(),
            Some(Blob::from(&b"bolt"[..]))
        );
        assert_eq!(
            table.find(&Dtype::U32(1), "qty").unwrap(),
            Some(Blob::from_u32(12))
        );
        assert_eq!(table.find(&Dtype::U32(1), "note").unwrap(), None);
        assert!(table.find(&Dtype::U32(1), "bogus").is_err());
    }

    #[test]
    fn test_remove_row_clears_every_column() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env);

        table
            .insert(&Dtype::U32(5), "name", Blob::from(&b"nut"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(5), "note", Blob::from(&b"m5"[..]))
            .unwrap();
        assert!(table.contains(&Dtype::U32(5)).unwrap());

        table.remove_row(&Dtype::U32(5)).unwrap();
        assert!(!table.contains(&Dtype::U32(5)).unwrap());
        assert_eq!(table.find(&Dtype::U32(5), "name").unwrap(), None);
        assert_eq!(table.find(&Dtype::U32(5), "note").unwrap(), None);
    }

    #[test]
    fn test_row_iteration_keyed_on_primary_column() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env);

        // Row 1 has the primary column; row 2 does not and is skipped.
        table
            .insert(&Dtype::U32(1), "name", Blob::from(&b"one"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(1), "qty", Blob::from_u32(1))
            .unwrap();
        table
            .insert(&Dtype::U32(2), "qty", Blob::from_u32(2))
            .unwrap();
        table
            .insert(&Dtype::U32(3), "name", Blob::from(&b"three"[..]))
            .unwrap();

        let mut rows = Vec::new();
        let mut iter = table.iterate().unwrap();
        iter.first();
        while iter.valid() {
            let Some(Dtype::U32(key)) = iter.key() else {
                panic!("bad key");
            };
            rows.push((key, iter.column().unwrap()));
            iter.next();
        }
        assert_eq!(
            rows,
            vec![
                (1, "name".to_string()),
                (1, "qty".to_string()),
                (3, "name".to_string())
            ]
        );
    }

    #[test]
    fn test_reopen_reads_metadata_names() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = Params::parse(CONFIG, &Registry::standard()).unwrap();
        ColumnCtable::create(env.ctx(), &env.dir().join("cols"), &cfg, KeyType::U32).unwrap();
        {
            let table = ColumnCtable::open(env.ctx(), &env.dir().join("cols"), &cfg).unwrap();
            table
                .insert(&Dtype::U32(7), "note", Blob::from(&b"kept"[..]))
                .unwrap();
        }
        let table = ColumnCtable::open(env.ctx(), &env.dir().join("cols"), &cfg).unwrap();
        assert_eq!(table.column_names(), vec!["name", "qty", "note"]);
        assert_eq!(
            table.find(&Dtype::U32(7), "note").unwrap(),
            Some(Blob::from(&b"kept"[..]))
        );
    }
}
