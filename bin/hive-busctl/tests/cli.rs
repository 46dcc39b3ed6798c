//! ---
//! hive_section: "05-networking-external-interfaces"
//! hive_subsection: "tests"
//! hive_type: "source"
//! hive_scope: "code"
//! hive_description: "Command-line contract of the bus operator CLI."
//! hive_version: "v0.1.0"
//! hive_owner: "messaging"
//! ---
use std::io::Write;

use assert_cmd::Command;

fn busctl() -> Command {
    let mut cmd = Command::cargo_bin("hive-busctl").expect("binary built");
    for var in [
        "HIVE_BUS_CONFIG",
        "HIVE_BUS_URL",
        "HIVE_BUS_EXCHANGE",
        "HIVE_BUS_CLIENT_ID",
        "HIVE_BUS_RECONNECT_MS",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn stderr_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("run hive-busctl");
    assert!(!output.status.success());
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn help_lists_subcommands() {
    let output = busctl().arg("--help").output().expect("run hive-busctl");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("publish"));
    assert!(stdout.contains("listen"));
}

#[test]
fn publish_rejects_invalid_payload() {
    let stderr = stderr_of(busctl().args([
        "--url",
        "amqp://127.0.0.1:1",
        "--client-id",
        "cli",
        "publish",
        "--payload",
        "{not json",
    ]));
    assert!(stderr.contains("--payload must be valid JSON"));
}

#[test]
fn publish_rejects_unknown_kind() {
    let output = busctl()
        .args(["publish", "--kind", "SHOUT", "--payload", "{}"])
        .output()
        .expect("run hive-busctl");
    assert!(!output.status.success());
}

#[test]
fn missing_url_is_reported() {
    let stderr = stderr_of(busctl().args(["--client-id", "cli", "publish", "--payload", "{}"]));
    assert!(stderr.contains("--url"));
}

#[test]
fn config_file_is_validated() {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    writeln!(
        file,
        "url = \"amqp://127.0.0.1:1\"\nclient_id = \"broadcast\""
    )
    .expect("write config");

    let stderr = stderr_of(busctl().arg("--config").arg(file.path()).args([
        "publish",
        "--payload",
        "{}",
    ]));
    assert!(stderr.contains("broadcast"));
}
