//! CLI tests for `convey deploy` and `convey extract`.
//!
//! Spawns the convey binary and checks exit codes plus the files it leaves
//! behind.

#![cfg(unix)]

use std::fs;
use std::process::Command;

use convey::core::service_message::ServiceMessage;
use convey::core::variables::Variables;
use convey::exit_codes;
use convey::test_support::TestPackage;

fn convey() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_convey"));
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn deploy_runs_scripts_and_writes_output_variables() {
    let publish = ServiceMessage::set_variable("Build.Number", "7", false).to_line();
    let script = format!("test \"$CONVEY_APP_ENV\" = prod || exit 9\necho \"{publish}\"\n");
    let package = TestPackage::new("web.zip", &[("Deploy.sh", script.as_str())]).expect("package");
    let out = package.dir.path().join("out.json");

    let status = convey()
        .current_dir(package.dir.path())
        .args(["deploy", "--package"])
        .arg(&package.path)
        .args(["--var", "App.Env=prod", "--output-variables"])
        .arg(&out)
        .status()
        .expect("convey deploy");
    assert_eq!(status.code(), Some(exit_codes::OK));

    let written: Variables =
        serde_json::from_str(&fs::read_to_string(&out).expect("read out")).expect("parse out");
    assert_eq!(written.get("Build.Number"), Some("7"));
    assert_eq!(written.get("App.Env"), Some("prod"));
    assert!(package.staging_root().join("web").join("Deploy.sh").exists());
}

#[test]
fn failing_script_exits_with_failure_and_still_writes_variables() {
    let package =
        TestPackage::new("web.zip", &[("PreDeploy.sh", "exit 3\n")]).expect("package");
    let out = package.dir.path().join("out.json");

    let output = convey()
        .current_dir(package.dir.path())
        .args(["deploy", "--package"])
        .arg(&package.path)
        .arg("--output-variables")
        .arg(&out)
        .output()
        .expect("convey deploy");

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    assert!(String::from_utf8_lossy(&output.stderr).contains("exit code 3"));
    assert!(out.exists());
}

#[test]
fn extract_unpacks_into_destination() {
    let package = TestPackage::new("site.zip", &[("index.html", "<p>hi</p>"), ("css/app.css", "p{}")])
        .expect("package");
    let destination = package.dir.path().join("unpacked");

    let status = convey()
        .current_dir(package.dir.path())
        .args(["extract", "--package"])
        .arg(&package.path)
        .arg("--destination")
        .arg(&destination)
        .status()
        .expect("convey extract");

    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(
        fs::read_to_string(destination.join("css/app.css")).expect("read"),
        "p{}"
    );
}

#[test]
fn unknown_package_kind_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let package = temp.path().join("web.rpm");
    fs::write(&package, "not an archive").expect("write");

    let status = convey()
        .current_dir(temp.path())
        .args(["extract", "--package"])
        .arg(&package)
        .args(["--destination", "out"])
        .status()
        .expect("convey extract");

    assert_eq!(status.code(), Some(exit_codes::FAILED));
}
