use std::process::Command;
use tempfile::TempDir;

#[test]
fn test_init_command() {
    let temp_dir = TempDir::new().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_watchmux"))
        .arg("init")
        .current_dir(temp_dir.path())
        .output()
        .expect("Failed to run init command");
    assert!(output.status.success());

    let config_path = temp_dir.path().join(".watchmux/settings.toml");
    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("version = 1"));
    assert!(content.contains("[watcher]"));
    assert!(content.contains("coalesce_ms = 50"));

    // A second init without --force refuses to overwrite
    let again = Command::new(env!("CARGO_BIN_EXE_watchmux"))
        .arg("init")
        .current_dir(temp_dir.path())
        .output()
        .unwrap();
    assert!(!again.status.success());

    let forced = Command::new(env!("CARGO_BIN_EXE_watchmux"))
        .args(["init", "--force"])
        .current_dir(temp_dir.path())
        .output()
        .unwrap();
    assert!(forced.status.success());
}

#[test]
fn test_config_command_uses_custom_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("custom.toml");
    std::fs::write(&config_path, "[watcher]\ncoalesce_ms = 123\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_watchmux"))
        .args(["config", "--config"])
        .arg(&config_path)
        .current_dir(temp_dir.path())
        .env_remove("WATCHMUX_WATCHER__COALESCE_MS")
        .output()
        .expect("Failed to run config command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("coalesce_ms = 123"), "{stdout}");
}

#[test]
fn test_serve_answers_over_stdio() {
    use std::io::Write;
    use std::process::Stdio;

    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().canonicalize().unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_watchmux"))
        .arg("serve")
        .current_dir(temp_dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    {
        let mut stdin = child.stdin.take().unwrap();
        let request = serde_json::json!({
            "id": 1,
            "method": "watchFileChanges2",
            "params": { "clientId": 1, "uri": root.to_string_lossy() },
        });
        writeln!(stdin, "{request}").unwrap();
        writeln!(stdin, r#"{{"id":2,"method":"unwatchFileChanges2","params":{{"watcherId":1}}}}"#)
            .unwrap();
    }

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());

    let replies: Vec<serde_json::Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(replies[0], serde_json::json!({"id": 1, "result": 1}));
    assert_eq!(replies[1], serde_json::json!({"id": 2, "result": null}));
}
