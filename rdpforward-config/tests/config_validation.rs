use rdpforward_config::Config;
use std::path::PathBuf;

fn get_test_config_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("test_configs");
    path.push(filename);
    path
}

#[test]
fn test_basic_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_basic.json"))
        .expect("Failed to load basic config");

    assert_eq!(config.listen, ":3389");
    assert_eq!(config.target, "10.20.0.5:3389");
    assert!(config.sni_whitelist.is_empty());
    assert!(config.client_whitelist.is_empty());
    assert!(!config.debug);
    assert!(config.log_file.is_none());
}

#[test]
fn test_full_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_full.json"))
        .expect("Failed to load full config");

    assert_eq!(config.listen, "0.0.0.0:13389");
    assert_eq!(config.target, "rdp.internal:3389");

    assert_eq!(config.sni_whitelist.len(), 2);
    assert!(config.sni_whitelist.contains("gw.example.com"));
    assert!(config.sni_whitelist.contains("gw2.example.com"));

    assert_eq!(config.client_whitelist.len(), 1);
    assert!(config.client_whitelist.contains("WORK-PC"));

    assert!(config.debug);
    assert!(config.log_file.is_some());
}

#[test]
fn test_whitelist_entries_are_trimmed() {
    let config = Config::from_file(&get_test_config_path("test_whitespace.json"))
        .expect("Failed to load whitespace config");

    assert_eq!(config.sni_whitelist.len(), 2);
    assert!(config.sni_whitelist.contains("a.example"));
    assert!(config.sni_whitelist.contains("b.example"));
}

#[test]
fn test_missing_file_is_an_error() {
    let result = Config::from_file(&get_test_config_path("does_not_exist.json"));
    assert!(result.is_err());
}

#[test]
fn test_malformed_file_is_an_error() {
    let result = Config::from_file(&get_test_config_path("test_malformed.json"));
    assert!(result.is_err());
}
