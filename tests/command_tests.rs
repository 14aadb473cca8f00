//! Command handler tests: report, checksum, remove-on-failure, config.

mod helpers;

use helpers::{write_file, FailPoint, FakeHost, TestEnv};
use rootimg::commands::build::{cmd_build, BuildArgs};
use rootimg::commands::verify::{cmd_verify, VerifyArgs};
use rootimg::config::Config;
use rootimg::{BuildError, CancelFlag, FsKind};
use serial_test::serial;
use std::fs;

fn config_for(env: &TestEnv) -> Config {
    Config {
        size_mib: 2,
        mount_base: env.mount_base.clone(),
        ..Config::default()
    }
}

fn args_for(env: &TestEnv, name: &str) -> BuildArgs {
    BuildArgs {
        source: env.source.clone(),
        output: env.out_dir.join(name),
        ..Default::default()
    }
}

#[test]
fn test_report_and_checksum_written_on_success() {
    let env = TestEnv::new();
    write_file(&env.source, "etc/hostname", "box1", 0o644);
    let host = env.host();
    let report_path = env.out_dir.join("report.json");
    let args = BuildArgs {
        checksum: true,
        report: Some(report_path.clone()),
        ..args_for(&env, "rootfs.img")
    };

    cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap();

    let sidecar = fs::read_to_string(env.out_dir.join("rootfs.img.sha256")).unwrap();
    assert!(sidecar.ends_with("  rootfs.img\n"));

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["stage"], "cleaned");
    assert_eq!(json["fs_kind"], "ext4");
    assert_eq!(json["size_bytes"], 2 * 1024 * 1024);
    assert_eq!(json["copied"]["files"], 1);
    assert_eq!(json["sha256"].as_str().unwrap(), &sidecar[..64]);
    assert!(json["error"].is_null());
}

#[test]
fn test_report_written_on_failure() {
    let env = TestEnv::new();
    let host = FakeHost::failing(&env.store, FailPoint::Mount);
    let report_path = env.store.join("report.json");
    let args = BuildArgs {
        report: Some(report_path.clone()),
        ..args_for(&env, "rootfs.img")
    };

    let err = cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap_err();

    let build_err = err.downcast_ref::<BuildError>().unwrap();
    assert_eq!(build_err.exit_code(), 72);
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(json["stage"], "attached");
    assert!(json["error"].as_str().unwrap().contains("mount"));
}

#[test]
fn test_report_written_when_failure_precedes_output_dir() {
    let env = TestEnv::new();
    let host = FakeHost::unprivileged(&env.store);
    let report_path = env.out_dir.join("report.json");
    let args = BuildArgs {
        report: Some(report_path.clone()),
        ..args_for(&env, "rootfs.img")
    };

    let err = cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap_err();

    let build_err = err.downcast_ref::<BuildError>().unwrap();
    assert!(matches!(build_err, BuildError::PermissionDenied(_)));
    assert_eq!(build_err.exit_code(), 77);
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert!(json["stage"].is_null());
    assert!(!args.output.exists());
}

#[test]
fn test_unwritable_report_keeps_build_error() {
    let env = TestEnv::new();
    let host = FakeHost::failing(&env.store, FailPoint::Mount);
    // A directory cannot be written as a report file
    let args = BuildArgs {
        report: Some(env.store.clone()),
        ..args_for(&env, "rootfs.img")
    };

    let err = cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap_err();

    let build_err = err.downcast_ref::<BuildError>().unwrap();
    assert!(matches!(build_err, BuildError::MountFailed { .. }), "{build_err}");
    assert_eq!(build_err.exit_code(), 72);
}

#[test]
fn test_failed_image_kept_by_default() {
    let env = TestEnv::new();
    let host = FakeHost::failing(&env.store, FailPoint::Attach);
    let args = args_for(&env, "rootfs.img");

    cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap_err();

    assert_eq!(fs::metadata(&args.output).unwrap().len(), 2 * 1024 * 1024);
}

#[test]
fn test_remove_on_failure_deletes_image() {
    let env = TestEnv::new();
    let host = FakeHost::failing(&env.store, FailPoint::Attach);
    let args = BuildArgs {
        remove_on_failure: true,
        ..args_for(&env, "rootfs.img")
    };

    cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap_err();

    assert!(!args.output.exists());
}

#[test]
fn test_remove_on_failure_spares_preexisting_file_when_nothing_was_built() {
    let env = TestEnv::new();
    fs::create_dir_all(&env.out_dir).unwrap();
    let output = env.out_dir.join("rootfs.img");
    fs::write(&output, "previous image").unwrap();
    let host = FakeHost::unprivileged(&env.store);
    let args = BuildArgs {
        remove_on_failure: true,
        ..args_for(&env, "rootfs.img")
    };

    let err = cmd_build(&host, &args, &config_for(&env), &CancelFlag::new()).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::PermissionDenied(_))
    ));
    assert_eq!(fs::read_to_string(&output).unwrap(), "previous image");
}

#[test]
fn test_verify_command_fails_on_difference() {
    let env = TestEnv::new();
    write_file(&env.source, "etc/hostname", "box1", 0o644);
    let host = env.host();
    let config = config_for(&env);
    let args = args_for(&env, "rootfs.img");
    cmd_build(&host, &args, &config, &CancelFlag::new()).unwrap();

    let verify = VerifyArgs {
        image: args.output.clone(),
        fs_kind: Some(FsKind::Ext4),
        against: Some(env.source.clone()),
    };
    cmd_verify(&host, &verify, &config, &CancelFlag::new()).unwrap();

    write_file(&env.source, "etc/motd", "hello", 0o644);
    let err = cmd_verify(&host, &verify, &config, &CancelFlag::new()).unwrap_err();
    assert!(err.to_string().contains("1 difference"));
}

#[test]
#[serial]
fn test_config_load_reads_environment() {
    std::env::set_var("ROOTIMG_SIZE_MB", "32");
    std::env::set_var("ROOTIMG_FS_TYPE", "vfat");
    let config = Config::load();
    std::env::remove_var("ROOTIMG_SIZE_MB");
    std::env::remove_var("ROOTIMG_FS_TYPE");

    let config = config.unwrap();
    assert_eq!(config.size_mib, 32);
    assert_eq!(config.fs_kind, FsKind::Vfat);
}

#[test]
#[serial]
fn test_config_load_rejects_bad_environment() {
    std::env::set_var("ROOTIMG_FS_TYPE", "zfs");
    let result = Config::load();
    std::env::remove_var("ROOTIMG_FS_TYPE");

    assert!(result.is_err());
}
