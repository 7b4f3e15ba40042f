//! Integration tests for the CLI contract and the virtual-card workflow.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("sdlink");
    cmd.env_remove("SDLINK_PORT")
        .env_remove("SDLINK_BAUD")
        .env("NO_COLOR", "1");
    cmd
}

/// Format a small FAT16 image for `--virtual`.
fn format_image(path: &Path) {
    cli_cmd()
        .args(["format", "--size-mb", "2", "--fat16", "--cluster-blocks", "1"])
        .arg(path)
        .assert()
        .success();
}

fn virtual_cmd(image: &Path) -> assert_cmd::Command {
    let mut cmd = cli_cmd();
    cmd.arg("--virtual").arg(image).arg("--non-interactive");
    cmd
}

// ============================================================================
// Help, version, usage errors
// ============================================================================

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sdlink").and(predicate::str::contains("Usage")))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sdlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn unknown_flag_suggests_similar() {
    cli_cmd()
        .args(["list-ports", "--jason"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("json"));
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd().arg("--help").output().unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(!stdout.contains("\x1b["));
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sdlink"));
}

#[test]
fn completions_without_shell_is_a_usage_error() {
    cli_cmd().arg("completions").assert().failure().code(2);
}

// ============================================================================
// Ports and configuration
// ============================================================================

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd().args(["list-ports", "--json"]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(parsed.is_array());
}

#[test]
fn invalid_local_config_only_warns() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("sdlink.toml"), "invalid toml [[[").unwrap();

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "stderr: {stderr}");
}

#[test]
fn exit_code_three_for_missing_config_file() {
    let dir = tempdir().unwrap();
    cli_cmd()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("list-ports")
        .assert()
        .failure()
        .code(3);
}

#[test]
fn virtual_conflicts_with_port() {
    cli_cmd()
        .args(["--virtual", "card.img", "-p", "/dev/ttyUSB0", "ls"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn opening_a_missing_port_fails() {
    cli_cmd()
        .args(["--non-interactive", "-p", "INVALID_PORT_NAME_XYZ", "ls"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

// ============================================================================
// Virtual card workflow
// ============================================================================

#[test]
fn format_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    cli_cmd()
        .args(["format", "--size-mb", "2", "--fat16"])
        .arg(&image)
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn fresh_image_lists_empty_json() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);

    let output = virtual_cmd(&image).args(["ls", "--json"]).output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
}

#[test]
fn import_export_round_trip() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);

    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let source = dir.path().join("Long File Name.bin");
    fs::write(&source, &data).unwrap();

    virtual_cmd(&image)
        .arg("import")
        .arg(&source)
        .arg("/")
        .assert()
        .success();

    let output = virtual_cmd(&image).args(["ls", "--json"]).output().unwrap();
    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries[0]["name"], "Long File Name.bin");
    assert_eq!(entries[0]["size"], 3000);

    let out_dir = dir.path().join("out");
    fs::create_dir(&out_dir).unwrap();
    virtual_cmd(&image)
        .args(["export", "/Long File Name.bin"])
        .arg(&out_dir)
        .assert()
        .success();
    assert_eq!(fs::read(out_dir.join("Long File Name.bin")).unwrap(), data);
}

#[test]
fn rm_without_yes_fails_in_non_interactive_mode() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    virtual_cmd(&image)
        .arg("import")
        .arg(dir.path().join("a.txt"))
        .arg("/")
        .assert()
        .success();

    virtual_cmd(&image)
        .args(["rm", "/a.txt"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--yes"));

    virtual_cmd(&image).args(["rm", "--yes", "/a.txt"]).assert().success();
    virtual_cmd(&image)
        .arg("ls")
        .assert()
        .success()
        .stdout(predicate::str::contains("a.txt").not());
}

#[test]
fn rm_of_missing_file_fails() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    virtual_cmd(&image)
        .args(["rm", "--yes", "/nothing.txt"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("nothing.txt"));
}

#[test]
fn mv_renames_an_entry() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    fs::write(dir.path().join("old.txt"), b"x").unwrap();
    virtual_cmd(&image)
        .arg("import")
        .arg(dir.path().join("old.txt"))
        .arg("/")
        .assert()
        .success();

    virtual_cmd(&image).args(["mv", "/old.txt", "new.txt"]).assert().success();
    virtual_cmd(&image)
        .arg("ls")
        .assert()
        .success()
        .stdout(predicate::str::contains("new.txt").and(predicate::str::contains("old.txt").not()));

    virtual_cmd(&image)
        .args(["mv", "/new.txt", "sub/new.txt"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn label_set_and_show() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);

    virtual_cmd(&image).args(["label", "SDCARD"]).assert().success();
    virtual_cmd(&image)
        .arg("label")
        .assert()
        .success()
        .stdout(predicate::str::contains("SDCARD"));
}

#[test]
fn sketches_json_lists_hex_files() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    fs::write(dir.path().join("BLINK.HEX"), vec![0x0C; 300]).unwrap();
    fs::write(dir.path().join("notes.txt"), b"not a sketch").unwrap();
    virtual_cmd(&image)
        .arg("import")
        .arg(dir.path().join("BLINK.HEX"))
        .arg(dir.path().join("notes.txt"))
        .arg("/")
        .assert()
        .success();

    let output = virtual_cmd(&image).args(["sketches", "--json"]).output().unwrap();
    assert!(output.status.success());
    let sketches: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let sketches = sketches.as_array().unwrap();
    assert_eq!(sketches.len(), 1);
    assert_eq!(sketches[0]["name"], "BLINK");
    assert_eq!(sketches[0]["size"], 300);
}

#[test]
fn info_json_reports_the_virtual_device() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);

    let output = virtual_cmd(&image).args(["info", "--json"]).output().unwrap();
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["name"], "SDLINK_1");
    assert_eq!(info["signature"], "1E 98 01");
    assert_eq!(info["volume"]["fat_type"], "Fat16");
}

#[test]
fn settings_reset_requires_yes() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);

    virtual_cmd(&image)
        .args(["settings", "--reset"])
        .assert()
        .failure()
        .code(2);

    let output = virtual_cmd(&image)
        .args(["settings", "--reset", "--yes", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let settings: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(settings["load_sketch"], false);
}

#[test]
fn upload_program_rejects_an_empty_image() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    let program = dir.path().join("empty.bin");
    fs::write(&program, b"").unwrap();

    virtual_cmd(&image)
        .arg("upload-program")
        .arg(&program)
        .assert()
        .failure()
        .code(2);
}

#[test]
fn upload_program_to_the_virtual_device() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    let program = dir.path().join("app.bin");
    fs::write(&program, vec![0xAB; 600]).unwrap();

    virtual_cmd(&image)
        .arg("upload-program")
        .arg(&program)
        .args(["-a", "0x100"])
        .assert()
        .success();
}

#[test]
fn regs_read_unknown_register_fails() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    virtual_cmd(&image)
        .args(["regs", "read", "NOPE"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("NOPE"));
}

#[test]
fn regs_write_then_read() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("card.img");
    format_image(&image);
    virtual_cmd(&image)
        .args(["regs", "write", "PORTB=0x20"])
        .assert()
        .success();
    // Register RAM is not part of the card image, so only the format is checked.
    let output = virtual_cmd(&image)
        .args(["regs", "read", "PORTB", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let values: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(values[0]["name"], "PORTB");
}
