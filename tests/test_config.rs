use std::io::Write;

use ironbpm::cli::{IronBpmConfig, StoreKind};
use tempfile::NamedTempFile;

#[test]
fn load_valid_config_all_fields() {
    let yaml = r#"
host: "127.0.0.1"
port: 8080
store_dir: "custom/state"
store: memory
max_body: 2097152
max_auto_steps: 500
"#;

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = IronBpmConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.store_dir.as_deref(), Some("custom/state"));
    assert_eq!(cfg.store, Some(StoreKind::Memory));
    assert_eq!(cfg.max_body, Some(2097152));
    assert_eq!(cfg.max_auto_steps, Some(500));
}

#[test]
fn load_partial_config() {
    let yaml = r#"
port: 9090
"#;

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = IronBpmConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.store_dir.is_none());
    assert!(cfg.store.is_none());
    assert!(cfg.max_body.is_none());
    assert!(cfg.max_auto_steps.is_none());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = IronBpmConfig::load(Some(std::path::Path::new("/nonexistent/ironbpm.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn empty_file_gives_defaults() {
    let f = NamedTempFile::new().unwrap();
    let cfg = IronBpmConfig::load(Some(f.path())).unwrap();
    assert!(cfg.host.is_none());
    assert!(cfg.port.is_none());
    assert!(cfg.store.is_none());
}

#[test]
fn invalid_yaml_returns_error() {
    let yaml = "port: [this is not valid yaml for a u16";

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let result = IronBpmConfig::load(Some(f.path()));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file")
    );
}

#[test]
fn unknown_store_kind_is_rejected() {
    let result = IronBpmConfig::from_yaml("store: postgres\n");
    assert!(result.is_err());
}

#[test]
fn store_kind_defaults_to_json() {
    assert_eq!(StoreKind::default(), StoreKind::Json);
    let cfg = IronBpmConfig::from_yaml("store: json\n").unwrap();
    assert_eq!(cfg.store, Some(StoreKind::Json));
}

#[test]
fn unknown_keys_are_ignored() {
    let yaml = r#"
port: 4000
unknown_setting: true
another_random_key: "hello"
"#;

    let cfg = IronBpmConfig::from_yaml(yaml).unwrap();
    assert_eq!(cfg.port, Some(4000));
}
