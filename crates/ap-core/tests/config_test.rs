use std::io::{Seek, Write};

use ap_core::config::{Config, ConfigError, ConfigHandle, FileSource};
use ap_core::types::PipelineStatus;

fn write_config(file: &mut tempfile::NamedTempFile, text: &str) {
    let handle = file.as_file_mut();
    handle.set_len(0).expect("truncate config");
    handle.rewind().expect("rewind config");
    handle.write_all(text.as_bytes()).expect("write config");
    handle.flush().expect("flush config");
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write_config(
        &mut file,
        r#"
[general]
project_name = "widgets"
log_format = "json"

[integrations]
github_owner = "acme"
github_repo = "widgets"
project_number = 7
"#,
    );

    let cfg = Config::load_from(file.path()).expect("load config");
    assert_eq!(cfg.general.project_name, "widgets");
    assert_eq!(cfg.general.log_format, "json");
    assert_eq!(cfg.integrations.github_owner.as_deref(), Some("acme"));
    assert_eq!(cfg.integrations.project_number, Some(7));
    assert_eq!(cfg.integrations.github_token_env, "GITHUB_TOKEN");
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = Config::load_from(dir.path().join("absent.toml")).expect_err("should fail");
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn duplicate_agent_across_stages_fails_validation() {
    let err = Config::from_toml(
        r#"
[pipeline.agent_mappings]
Backlog = ["specify"]
Ready = ["Specify", "plan"]
"#,
    )
    .expect_err("duplicate agent");
    assert!(err.to_string().contains("more than once"));
}

#[test]
fn agent_names_with_table_characters_fail_validation() {
    for bad in ["\"a|b\"", "\"[plan]\"", "\"`x`\"", "\"  \""] {
        let text = format!("[pipeline.agent_mappings]\nReady = [{bad}]\n");
        let err = Config::from_toml(&text).expect_err("invalid agent name");
        assert!(matches!(err, ConfigError::Validation(_)), "{bad}: {err}");
    }
}

#[test]
fn file_handle_picks_up_edits_and_ignores_broken_ones() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write_config(&mut file, "[polling]\ninterval_secs = 30\n");

    let handle = ConfigHandle::new(FileSource::new(file.path())).expect("initial load");
    let first = handle.current();
    assert_eq!(first.generation, 1);
    assert_eq!(first.config.polling.interval_secs, 30);

    write_config(
        &mut file,
        "[polling]\ninterval_secs = 10\n\n[pipeline.agent_mappings]\nReady = [\"plan\"]\n",
    );
    let second = handle.refresh();
    assert_eq!(second.generation, 2);
    assert_eq!(second.config.polling.interval_secs, 10);
    assert_eq!(
        second.mapping.agents_for(PipelineStatus::Ready),
        ["plan".to_string()]
    );
    assert!(second.mapping.agents_for(PipelineStatus::Backlog).is_empty());

    write_config(&mut file, "[polling]\ninterval_secs = \"soon\"\n");
    let third = handle.refresh();
    assert_eq!(third.generation, 2);
    assert_eq!(third.config.polling.interval_secs, 10);
}

#[test]
fn file_source_without_file_serves_defaults() {
    let dir = tempfile::tempdir().expect("temp dir");
    let handle =
        ConfigHandle::new(FileSource::new(dir.path().join("config.toml"))).expect("defaults");
    assert_eq!(handle.current().config, Config::default());
}
