#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use tracing::Level;
    use tracing_subscriber::fmt::Subscriber;

    use crate::ctable::{Ctable, simple::SimpleCtable};
    use crate::env::Env;
    use crate::factory::Registry;
    use crate::params::Params;
    use crate::value::{Blob, Dtype, KeyType};

    fn init_tracing() {
        let _ = Subscriber::builder()
            .with_max_level(Level::TRACE)
            .try_init();
    }

    const NAMED_CONFIG: &str = r#"config [
        "base" class(dt) managed_dtable
        "base_config" config [ "base" class(dt) simple_dtable ]
    ]"#;

    const INDEXED_CONFIG: &str = r#"config [
        "columns" int 2
        "column0_name" string "name"
        "column1_name" string "size"
        "base" class(dt) managed_dtable
        "base_config" config [ "base" class(dt) simple_dtable ]
    ]"#;

    fn open_table(env: &Env, name: &str, cfg_text: &str) -> Arc<SimpleCtable> {
        let cfg = Params::parse(cfg_text, &Registry::standard()).unwrap();
        SimpleCtable::create(env.ctx(), &env.dir().join(name), &cfg, KeyType::U32).unwrap();
        Arc::new(SimpleCtable::open(env.ctx(), &env.dir().join(name), &cfg).unwrap())
    }

    fn test_env() -> (TempDir, Env) {
        let tmp = TempDir::new().unwrap();
        let env = Env::open(tmp.path().join("store")).unwrap();
        (tmp, env)
    }

    #[test]
    fn test_insert_find_named_columns() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env, "rows", NAMED_CONFIG);

        table
            .insert(&Dtype::U32(1), "name", Blob::from(&b"widget"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(1), "qty", Blob::from_u32(5))
            .unwrap();

        assert_eq!(
            table.find(&Dtype::U32(1), "name").unwrap(),
            Some(Blob::from(&b"widget"[..]))
        );
        assert_eq!(
            table.find(&Dtype::U32(1), "qty").unwrap(),
            Some(Blob::from_u32(5))
        );
        assert_eq!(table.find(&Dtype::U32(1), "missing").unwrap(), None);
        assert!(table.contains(&Dtype::U32(1)).unwrap());
        assert!(!table.contains(&Dtype::U32(2)).unwrap());
    }

    #[test]
    fn test_column_remove_collects_empty_row() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env, "rows", NAMED_CONFIG);

        table
            .insert(&Dtype::U32(1), "a", Blob::from(&b"x"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(1), "b", Blob::from(&b"y"[..]))
            .unwrap();

        table.remove(&Dtype::U32(1), "a").unwrap();
        assert_eq!(table.find(&Dtype::U32(1), "a").unwrap(), None);
        assert!(table.contains(&Dtype::U32(1)).unwrap());

        // Removing the last column collects the whole row.
        table.remove(&Dtype::U32(1), "b").unwrap();
        assert!(!table.contains(&Dtype::U32(1)).unwrap());
    }

    #[test]
    fn test_indexed_columns_enforced() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env, "rows", INDEXED_CONFIG);

        table
            .insert(&Dtype::U32(1), "name", Blob::from(&b"gear"[..]))
            .unwrap();
        assert!(table.insert(&Dtype::U32(1), "nope", Blob::empty()).is_err());
        assert_eq!(table.column_names(), vec!["name", "size"]);
        assert_eq!(
            table.find(&Dtype::U32(1), "name").unwrap(),
            Some(Blob::from(&b"gear"[..]))
        );
        assert_eq!(table.find(&Dtype::U32(1), "size").unwrap(), None);
    }

    #[test]
    fn test_cell_iteration_in_key_order() {
        init_tracing();

        let (_tmp, env) = test_env();
        let table = open_table(&env, "rows", NAMED_CONFIG);

        table
            .insert(&Dtype::U32(2), "b", Blob::from(&b"2b"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(1), "a", Blob::from(&b"1a"[..]))
            .unwrap();
        table
            .insert(&Dtype::U32(1), "b", Blob::from(&b"1b"[..]))
            .unwrap();

        let mut cells = Vec::new();
        let mut iter = table.iterate().unwrap();
        iter.first();
        while iter.valid() {
            let Some(Dtype::U32(key)) = iter.key() else {
                panic!("bad key");
            };
            cells.push((key, iter.column().unwrap(), iter.value().unwrap()));
            iter.next();
        }
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].0, 1);
        assert_eq!(cells[1].0, 1);
        assert_eq!(cells[2].0, 2);
        assert_eq!(cells[2].1, "b");
        assert_eq!(cells[2].2, Blob::from(&b"2b"[..]));
    }

    #[test]
    fn test_row_survives_reopen() {
        init_tracing();

        let (_tmp, env) = test_env();
        let cfg = Params::parse(NAMED_CONFIG, &Registry::standard()).unwrap();
        SimpleCtable::create(env.ctx(), &env.dir().join("rows"), &cfg, KeyType::U32).unwrap();
        {
            let table =
                SimpleCtable::open(env.ctx(), &env.dir().join("rows"), &cfg).unwrap();
            table
                .insert(&Dtype::U32(9), "k", Blob::from(&b"v"[..]))
                .unwrap();
        }
        let table = SimpleCtable::open(env.ctx(), &env.dir().join("rows"), &cfg).unwrap();
        assert_eq!(
            table.find(&Dtype::U32(9), "k").unwrap(),
            Some(Blob::from(&b"v"[..]))
        );
    }
}
