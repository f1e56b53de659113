//! Layered configuration loading. Environment variables are process-wide, so
//! every scenario that sets them lives in this one test.

use std::io::Write;
use zanzibar_core::*;

#[test]
fn test_environment_overrides_file_and_defaults() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[check]\nmax_depth = 7\n\n[watch]\nhistory_limit = 64").unwrap();

    std::env::set_var("ZANZIBAR__CHECK__MAX_DEPTH", "25");
    std::env::set_var("ZANZIBAR__CHECK__MEMOIZE", "false");
    let config = EngineConfig::load(Some(file.path()));

    std::env::set_var("ZANZIBAR__WATCH__BATCH_SIZE", "0");
    let invalid = EngineConfig::load(None);

    std::env::remove_var("ZANZIBAR__CHECK__MAX_DEPTH");
    std::env::remove_var("ZANZIBAR__CHECK__MEMOIZE");
    std::env::remove_var("ZANZIBAR__WATCH__BATCH_SIZE");

    let config = config.unwrap();
    assert_eq!(config.check.max_depth, 25);
    assert!(!config.check.memoize);
    assert_eq!(config.watch.history_limit, 64);
    assert_eq!(config.check.max_fanout, CheckConfig::default().max_fanout);
    assert_eq!(config.watch.batch_size, WatchConfig::default().batch_size);

    assert!(matches!(invalid, Err(ZanzibarError::Configuration(_))));
}
