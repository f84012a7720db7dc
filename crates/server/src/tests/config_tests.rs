use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn unique_temp_root(label: &str) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("chat_server_{label}_{suffix}"))
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn blank_database_url_falls_back_to_default() {
    assert_eq!(
        normalize_database_url("   "),
        Settings::default().database_url
    );
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn memory_url_has_no_parent_directory() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert!(sqlite_path("sqlite::memory:").is_none());
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = unique_temp_root("prepare");
    let db_path = temp_root.join("data").join("test.db");

    prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(temp_root.join("data").exists());

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let temp_root = unique_temp_root("open");
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare");
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn file_settings_accept_strings_and_integers() {
    let file_cfg: toml::Table = r#"
        bind_addr = "0.0.0.0:9000"
        heartbeat_interval_secs = 5
        typing_timeout_ms = 1500
        connection_queue_capacity = 32
    "#
    .parse()
    .expect("toml");

    let mut settings = Settings::default();
    apply_file_settings(&mut settings, &file_cfg);

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(settings.typing_timeout, Duration::from_millis(1500));
    assert_eq!(settings.connection_queue_capacity, 32);
    assert_eq!(settings.keepalive_interval, DEFAULT_KEEPALIVE_INTERVAL);
}

#[test]
fn app_prefixed_env_vars_win_over_plain_ones() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("SERVER_BIND", "127.0.0.1:1"),
        ("APP__BIND_ADDR", "127.0.0.1:2"),
        ("DATABASE_URL", "sqlite://plain.db"),
        ("APP__KEEPALIVE_INTERVAL_SECS", "3"),
        ("APP__CONNECTION_QUEUE_CAPACITY", "not-a-number"),
    ]);

    let mut settings = Settings::default();
    apply_env_settings(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.database_url, "sqlite://plain.db");
    assert_eq!(settings.keepalive_interval, Duration::from_secs(3));
    assert_eq!(settings.connection_queue_capacity, DEFAULT_QUEUE_CAPACITY);
}

#[test]
fn zero_intervals_are_raised_to_a_floor() {
    let mut settings = Settings::default();
    apply_env_settings(&mut settings, |key| {
        (key == "APP__KEEPALIVE_INTERVAL_SECS").then(|| "0".to_string())
    });
    assert!(settings.keepalive_interval > Duration::ZERO);
    assert_eq!(
        settings.presence_config().liveness_timeout(),
        chrono::Duration::seconds(40)
    );
}

#[test]
fn unclaimed_attachment_ttl_reads_from_file_and_env() {
    assert_eq!(
        Settings::default().unclaimed_attachment_ttl,
        DEFAULT_UNCLAIMED_ATTACHMENT_TTL
    );

    let file_cfg: toml::Table = "unclaimed_attachment_ttl_secs = 120".parse().expect("toml");
    let mut settings = Settings::default();
    apply_file_settings(&mut settings, &file_cfg);
    assert_eq!(settings.unclaimed_attachment_ttl, Duration::from_secs(120));

    apply_env_settings(&mut settings, |key| {
        (key == "APP__UNCLAIMED_ATTACHMENT_TTL_SECS").then(|| "30".to_string())
    });
    assert_eq!(settings.unclaimed_attachment_ttl, Duration::from_secs(30));
}
