//! Tests which token sessions a configuration ends up with.

use std::sync::Arc;

use hsmcred::{Error, factory::CredentialSpec, test::MockTokenLibrary};

mod common;

#[test]
fn slot_range_loads_available_indexes_only() {
    common::init_logging();

    let library = Arc::new(MockTokenLibrary::new());
    library.add_slot(0, &["sign"]);
    library.add_slot(1, &["sign"]);

    let config = common::token_config(
        r#"
        [token]
        library = "/usr/lib/hsm/libmock.so"
        name = "Test"
        slot_list_index = 0
        slot_list_index_max_range = 3
        pin = "1234"
        "#,
    );

    let provider = common::factory(config, &library).create_provider().unwrap();
    assert_eq!(vec!["Test-0", "Test-1"], provider.provider_names());
    assert_eq!(vec![Some(0), Some(1), Some(2)], library.opened_indexes());
}

#[test]
fn single_slot_keeps_the_configured_name() {
    let library = Arc::new(MockTokenLibrary::new());
    library.add_slot(7, &["sign"]);

    let config = common::token_config(
        r#"
        [token]
        library = "/usr/lib/hsm/libmock.so"
        name = "  My Hsm "
        slot = 7
        pin = "1234"
        "#,
    );

    let provider = common::factory(config, &library).create_provider().unwrap();
    assert_eq!(vec!["MyHsm"], provider.provider_names());
}

#[test]
fn missing_single_slot_fails_to_load() {
    let library = Arc::new(MockTokenLibrary::new());
    library.add_slot(0, &["sign"]);

    let config = common::token_config(
        r#"
        [token]
        library = "/usr/lib/hsm/libmock.so"
        name = "Test"
        slot_list_index = 4
        "#,
    );

    let err = common::factory(config, &library).create_provider().unwrap_err();
    assert!(matches!(err, Error::ProviderLoad(_)));
}

#[test]
fn external_configs_open_one_session_each() {
    let library = Arc::new(MockTokenLibrary::new());
    library.add_slot(0, &["sign"]);
    library.add_slot(1, &["sign"]);

    let dir = tempfile::tempdir().unwrap();
    let first = common::write_file(
        dir.path(),
        "first.cfg",
        b"library=/usr/lib/hsm/libmock.so\nname=First\nslotListIndex=0\n",
    );
    let second = common::write_file(
        dir.path(),
        "second.cfg",
        b"library=/usr/lib/hsm/libmock.so\nname=Second\nslotListIndex=1\n",
    );

    let mut config = common::token_config(
        r#"
        [token]
        library = "/ignored/when/external.so"
        name = "Ignored"
        pin = "1234"
        "#,
    );
    config.external_configs = Some(vec![first, second]);

    let credential = common::factory(config, &library)
        .create_credential(CredentialSpec::new("sign").with_certificate(common::certificate("sign")))
        .unwrap();
    assert_eq!(vec!["First", "Second"], credential.sessions());
}

#[test]
fn nothing_configured_gives_a_credential_without_key() {
    let library = Arc::new(MockTokenLibrary::new());
    library.add_slot(0, &["sign"]);

    let config = common::token_config("log_level = \"info\"\n");
    let factory = common::factory(config, &library);

    let provider = factory.create_provider().unwrap();
    assert!(provider.is_absent());
    assert!(provider.provider_names().is_empty());

    let credential = factory
        .create_credential(CredentialSpec::new("sign").with_certificate(common::certificate("sign")))
        .unwrap();
    assert!(credential.certificate().is_some());
    assert!(matches!(credential.resolve_key(), Err(Error::KeyUnavailable(_))));
    assert_eq!(0, library.open_count());
}

#[test]
fn key_missing_everywhere_is_unavailable() {
    let library = Arc::new(MockTokenLibrary::new());
    library.add_slot(0, &["other"]);
    library.add_slot(1, &["other"]);

    let config = common::token_config(
        r#"
        [token]
        library = "/usr/lib/hsm/libmock.so"
        name = "Test"
        slot_list_index_max_range = 2
        pin = "1234"
        "#,
    );

    let err = common::factory(config, &library)
        .create_credential(CredentialSpec::new("sign").with_certificate(common::certificate("sign")))
        .unwrap_err();
    assert!(matches!(err, Error::KeyUnavailable(_)));
}
