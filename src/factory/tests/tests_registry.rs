#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::dtable::{Dtable, DtableError, DtableIter};
    use crate::factory::{DtableFactory, Registry, TableContext};
    use crate::params::Params;

    #[test]
    fn test_standard_registry_has_every_builtin() {
        let registry = Registry::standard();
        for class in [
            "simple_dtable",
            "fixed_dtable",
            "array_dtable",
            "memory_dtable",
            "managed_dtable",
            "smallint_dtable",
            "deltaint_dtable",
            "exception_dtable",
            "exist_dtable",
            "keydiv_dtable",
            "btree_dtable",
            "rwatx_dtable",
        ] {
            assert!(registry.lookup_dtable(class).is_some(), "missing {class}");
        }
        for class in ["simple_ctable", "column_ctable"] {
            assert!(registry.lookup_ctable(class).is_some(), "missing {class}");
        }
        assert!(registry.lookup_dtable("nonsense").is_none());
    }

    struct DummyFactory;

    impl DtableFactory for DummyFactory {
        fn class_name(&self) -> &'static str {
            "dummy_dtable"
        }

        fn open(
            &self,
            _ctx: &TableContext,
            _path: &std::path::Path,
            _config: &Params,
        ) -> Result<Arc<dyn Dtable>, DtableError> {
            Err(DtableError::Unsupported("dummy"))
        }
    }

    #[test]
    fn test_registration_is_append_only() {
        let registry = Registry::standard();
        registry.register_dtable(Arc::new(DummyFactory)).unwrap();
        assert!(registry.lookup_dtable("dummy_dtable").is_some());

        // Taken names stay taken.
        let err = registry.register_dtable(Arc::new(DummyFactory)).unwrap_err();
        assert!(matches!(err, DtableError::Exists(_)));
    }

    #[test]
    fn test_registries_are_independent() {
        let with_dummy = Registry::standard();
        with_dummy.register_dtable(Arc::new(DummyFactory)).unwrap();
        let plain = Registry::standard();
        assert!(plain.lookup_dtable("dummy_dtable").is_none());
    }

    #[test]
    fn test_default_factory_methods_report_unsupported() {
        // A factory that only opens cannot create.
        let factory = DummyFactory;
        let registry = Registry::standard();
        let tmp = tempfile::TempDir::new().unwrap();
        let env = crate::env::Env::open_with_registry(tmp.path().join("store"), registry).unwrap();
        let config = Params::new();
        let source = crate::dtable::memory::MemoryDtable::new(crate::value::KeyType::U32, false);
        let mut iter: Box<dyn DtableIter> = source.iterate().unwrap();

        assert!(matches!(
            factory.create(
                env.ctx(),
                tmp.path(),
                &config,
                iter.as_mut(),
                None,
                None
            ),
            Err(DtableError::Unsupported(_))
        ));
        assert!(matches!(
            factory.create_empty(env.ctx(), tmp.path(), &config, crate::value::KeyType::U32),
            Err(DtableError::Unsupported(_))
        ));
    }
}
