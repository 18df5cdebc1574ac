use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novel-translator");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("translate"))
        .stdout(predicate::str::contains("restore"))
        .stdout(predicate::str::contains("retranslate"))
        .stdout(predicate::str::contains("test-connection"));
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let missing = temp.path().join("none.epub");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novel-translator");
    cmd.env("RUST_LOG", "debug")
        .args(["chapters", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsed cli"))
        .stderr(predicate::str::contains("open epub"));
    Ok(())
}

#[test]
fn verbose_flag_enables_debug_without_rust_log() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let missing = temp.path().join("none.epub");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novel-translator");
    cmd.env_remove("RUST_LOG")
        .args(["-v", "chapters", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsed cli"));

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novel-translator");
    cmd.env_remove("RUST_LOG")
        .args(["chapters", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsed cli").not());
    Ok(())
}
