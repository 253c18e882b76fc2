use chatclass_core::{Database, Message, Role};
use chrono::{TimeZone, Utc};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("chatclass/data.db")
    }

    fn config_dir(&self) -> PathBuf {
        self.xdg_config.join("chatclass")
    }

    fn write_config(&self, content: &str) -> PathBuf {
        let dir = self.config_dir();
        fs::create_dir_all(&dir).expect("failed to create config dir");
        let path = dir.join("config.toml");
        fs::write(&path, content).expect("failed to write config");
        path
    }

    /// Two sessions: s1 has a user and an assistant message, s2 one user message
    fn seed_messages(&self) {
        let db_path = self.db_path();
        fs::create_dir_all(db_path.parent().expect("missing db parent"))
            .expect("failed to create data dir");
        let db = Database::open(&db_path).expect("failed to open db");
        db.migrate().expect("failed to migrate db");

        let at = |secs: i64| Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap();
        let message = |id: i64, session: &str, role: Role, secs: i64, text: &str| Message {
            id,
            session_id: session.to_string(),
            role,
            content: Some(text.to_string()),
            timestamp: at(secs),
        };
        db.insert_messages(&[
            message(1, "s1", Role::User, 10, "where is my invoice"),
            message(2, "s1", Role::Assistant, 20, "checking"),
            message(3, "s2", Role::User, 30, "reset my password"),
        ])
        .expect("failed to seed messages");
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str], api_key: Option<&str>) -> Output {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("chatclass"));

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .env_remove("OPENAI_API_KEY")
        .env_remove("AZURE_OPENAI_API_KEY")
        .env_remove("ANTHROPIC_API_KEY");
    match api_key {
        Some(key) => command.env("CHATCLASS_API_KEY", key),
        None => command.env_remove("CHATCLASS_API_KEY"),
    };

    command
        .output()
        .unwrap_or_else(|e| panic!("failed to execute chatclass: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "chatclass {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.status,
        stdout,
        stderr
    );
}

#[test]
fn help_lists_pipeline_flags() {
    let env = CliTestEnv::new();
    let output = run_bin(&env, &["--help"], None);
    assert_success(&["--help"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--roles",
        "--since",
        "--limit",
        "--no-session",
        "--no-messages",
        "--reclassify-existing-messages",
        "--per-session-message-batch-size",
        "--log-level",
    ] {
        assert!(stdout.contains(flag), "missing {flag} in help:\n{stdout}");
    }
}

#[test]
fn dry_run_lists_candidates_as_json() {
    let env = CliTestEnv::new();
    env.seed_messages();

    let args = ["--dry-run", "--format", "json"];
    let output = run_bin(&env, &args, None);
    assert_success(&args, &output);

    let candidates: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("dry run output should be JSON");
    let ids: Vec<&str> = candidates
        .as_array()
        .expect("expected a JSON array")
        .iter()
        .map(|c| c["session_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["s1", "s2"]);
    assert_eq!(candidates[0]["message_count"], 2);
    assert_eq!(candidates[0]["unclassified_messages"], 1);
    assert!(candidates[0]["processed_upto"].is_null());

    let db = Database::open(&env.db_path()).expect("failed to open db");
    assert_eq!(db.count_message_classifications().unwrap(), 0);
}

#[test]
fn dry_run_honors_since_and_limit() {
    let env = CliTestEnv::new();
    env.seed_messages();

    let args = [
        "--dry-run",
        "--since",
        "2025-01-01T00:00:15Z",
        "--limit",
        "1",
        "--log-level",
        "ERROR",
    ];
    let output = run_bin(&env, &args, None);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 candidate session(s)"), "got:\n{stdout}");
    assert!(stdout.contains("s1"));
    assert!(!stdout.contains("s2"));
}

#[test]
fn run_with_nothing_enabled_reports_empty_summary() {
    let env = CliTestEnv::new();
    env.seed_messages();

    let args = ["--no-session", "--no-messages", "--format", "json"];
    let output = run_bin(&env, &args, Some("test-key"));
    assert_success(&args, &output);

    let summary: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("summary should be JSON");
    assert_eq!(summary["sessions_considered"], 0);
    assert_eq!(summary["messages_classified"], 0);
    assert_eq!(summary["cancelled"], false);
}

#[test]
fn missing_instructions_abort_with_non_zero_exit() {
    let env = CliTestEnv::new();
    env.seed_messages();

    let output = run_bin(&env, &[], Some("test-key"));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("instructions"),
        "expected instructions error, got:\n{stderr}"
    );

    let db = Database::open(&env.db_path()).expect("failed to open db");
    assert_eq!(db.count_message_classifications().unwrap(), 0);
}

#[test]
fn missing_api_key_is_rejected() {
    let env = CliTestEnv::new();
    env.seed_messages();
    fs::create_dir_all(env.config_dir()).unwrap();
    fs::write(env.config_dir().join("session_instructions.md"), "Classify.").unwrap();
    fs::write(env.config_dir().join("message_instructions.md"), "Classify.").unwrap();

    let output = run_bin(&env, &[], None);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("api_key"), "got:\n{stderr}");
}

#[test]
fn invalid_taxonomy_is_rejected() {
    let env = CliTestEnv::new();
    let config = env.write_config(
        r#"
[taxonomy]
categories = ["billing", "account"]
fallback_category = "other"
"#,
    );

    let config_arg = config.to_string_lossy().into_owned();
    let output = run_bin(&env, &["--config", &config_arg, "--dry-run"], None);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid configuration"), "got:\n{stderr}");
}

#[test]
fn database_flag_overrides_default_location() {
    let env = CliTestEnv::new();
    let custom = env.home.join("custom/chat.db");
    let custom_arg = custom.to_string_lossy().into_owned();

    let args = ["--database", custom_arg.as_str(), "--dry-run"];
    let output = run_bin(&env, &args, None);
    assert_success(&args, &output);

    assert!(custom.exists(), "expected database at {}", custom.display());
    assert!(!env.db_path().exists());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0 candidate session(s)"));
}
