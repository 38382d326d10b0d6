use vpnclient::config::CredentialBackend;
use vpnclient::config::CredentialsConfig;
use vpnclient::credentials::Credentials;
use vpnclient::credentials::open_store;

fn file_config(dir: &std::path::Path) -> CredentialsConfig {
    CredentialsConfig {
        backend: CredentialBackend::File,
        dir: Some(dir.to_path_buf()),
    }
}

#[test]
fn file_store_persists_across_instances() {
    let temp = tempfile::tempdir().unwrap();
    let mut creds = Credentials::new("alice", "s3cret");
    creds.extra.insert("psk".to_string(), "shared".to_string());

    {
        let store = open_store(&file_config(temp.path()));
        assert_eq!(store.name(), "file");
        store.store("office", &creds).unwrap();
    }

    let store = open_store(&file_config(temp.path()));
    assert_eq!(store.retrieve("office").unwrap(), Some(creds));
    assert_eq!(store.retrieve("home").unwrap(), None);

    assert!(store.delete("office").unwrap());
    assert!(!store.delete("office").unwrap());
    assert_eq!(store.retrieve("office").unwrap(), None);
}

#[test]
fn file_store_keeps_services_apart() {
    let temp = tempfile::tempdir().unwrap();
    let store = open_store(&file_config(temp.path()));

    store.store("office", &Credentials::new("alice", "one")).unwrap();
    store.store("home", &Credentials::new("bob", "two")).unwrap();
    store.store("office", &Credentials::new("alice", "three")).unwrap();

    let office = store.retrieve("office").unwrap().unwrap();
    let home = store.retrieve("home").unwrap().unwrap();
    assert_eq!(office.password, "three");
    assert_eq!(home.username, "bob");
}

#[test]
fn file_store_never_writes_plaintext() {
    let temp = tempfile::tempdir().unwrap();
    let store = open_store(&file_config(temp.path()));
    store
        .store("office", &Credentials::new("alice", "very-distinctive-password"))
        .unwrap();

    for entry in std::fs::read_dir(temp.path()).unwrap() {
        let bytes = std::fs::read(entry.unwrap().path()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("very-distinctive-password"));
        assert!(!text.contains("alice"));
    }
}
