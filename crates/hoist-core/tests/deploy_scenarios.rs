//! End-to-end deploys through the command layer against a fake nix host.

mod support;

use std::sync::Arc;
use std::time::Duration;

use hoist_core::commands::{DeployCommand, DeployOptions};
use hoist_core::config::HoistConfig;
use hoist_core::deploy::{DeployOutcome, JournalStore};
use hoist_core::error::{DeployError, Phase};
use hoist_core::process::{CancelToken, Interrupt};
use hoist_core::profile::RemoveOutcome;
use hoist_core::types::{PackageReference, StorePath, Target};
use tempfile::TempDir;

use support::{FOO_V1, FOO_V2, FakeNix};

const FOO: &str = ".#packages.x86_64-linux.foo";

fn command(temp: &TempDir, nix: &FakeNix) -> DeployCommand {
    DeployCommand::new(
        temp.path().join("state"),
        HoistConfig::new(),
        Arc::new(nix.clone()),
    )
}

fn options() -> DeployOptions {
    DeployOptions::new("deploy@bot.example.org").with_attr("foo")
}

fn gcroots(temp: &TempDir) -> usize {
    std::fs::read_dir(temp.path().join("state").join("gcroots"))
        .map(|dir| dir.count())
        .unwrap_or(0)
}

#[test]
fn first_deploy_installs_fresh_entry() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_build(FOO, FOO_V1, "foo");

    let report = command(&temp, &nix)
        .execute(&options(), &CancelToken::new())
        .unwrap();

    assert!(report.is_done(), "{:?}", report.error());
    assert_eq!(report.removed, Some(RemoveOutcome::Absent));
    assert_eq!(report.previous, None);
    assert_eq!(nix.profile().get("foo").map(String::as_str), Some(FOO_V1));
    // Known-absent entries are not removed remotely.
    assert_eq!(
        nix.remote_commands(),
        vec![
            "nix profile list --json".to_string(),
            format!("nix profile install {FOO_V1}")
        ]
    );
    assert_eq!(gcroots(&temp), 0, "GC root must be released after the deploy");
}

#[test]
fn redeploy_replaces_active_entry() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new()
        .with_build(FOO, FOO_V2, "foo")
        .with_active("foo", FOO_V1);

    let report = command(&temp, &nix)
        .execute(&options(), &CancelToken::new())
        .unwrap();

    assert!(report.is_done());
    assert_eq!(report.removed, Some(RemoveOutcome::Removed));
    assert_eq!(report.previous, Some(StorePath::new(FOO_V1)));
    assert_eq!(nix.profile().get("foo").map(String::as_str), Some(FOO_V2));
    assert_eq!(nix.profile().len(), 1);
}

#[test]
fn transfer_failure_leaves_remote_profile_untouched() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new()
        .with_build(FOO, FOO_V2, "foo")
        .with_active("foo", FOO_V1)
        .with_active("htop", "/nix/store/a1-htop-3.3.0");
    let before = nix.profile();
    nix.fail_copy("ssh: connect to host bot.example.org port 22: Network is unreachable");

    let report = command(&temp, &nix)
        .execute(&options(), &CancelToken::new())
        .unwrap();

    let err = report.error().unwrap();
    assert_eq!(err.phase(), Phase::Transferring);
    assert!(err.to_string().starts_with("transfer failed"));
    assert!(err.to_string().contains("Network is unreachable"));
    assert!(!err.is_degraded());
    assert_eq!(nix.profile(), before);
    assert!(nix.remote_commands().is_empty());
}

#[test]
fn build_failure_touches_nothing_remote() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_active("foo", FOO_V1);

    let report = command(&temp, &nix)
        .execute(&options(), &CancelToken::new())
        .unwrap();

    let err = report.error().unwrap();
    assert!(matches!(err, DeployError::Build(_)));
    assert!(err.to_string().contains("does not provide attribute"));
    assert!(nix.calls().iter().all(|c| c.args.first().map(String::as_str) != Some("copy")));
    assert!(nix.remote_commands().is_empty());
    assert_eq!(report.phases, vec![Phase::Building]);
}

#[test]
fn failed_remove_aborts_and_keeps_old_entry() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new()
        .with_build(FOO, FOO_V2, "foo")
        .with_active("foo", FOO_V1);
    let before = nix.profile();
    nix.fail_remove("error: opening lock file 'profile.lock': Permission denied");

    let report = command(&temp, &nix)
        .execute(&options(), &CancelToken::new())
        .unwrap();

    let err = report.error().unwrap();
    assert_eq!(err.phase(), Phase::Removing);
    assert!(err.to_string().starts_with("remove failed"), "{err}");
    assert!(err.to_string().contains("Permission denied"));
    assert!(!err.is_degraded());
    assert!(
        !nix.remote_commands()
            .iter()
            .any(|c| c.starts_with("nix profile install"))
    );
    assert_eq!(nix.profile(), before);
    assert_eq!(
        report.phases,
        vec![Phase::Building, Phase::Transferring, Phase::Removing]
    );
}

#[test]
fn install_failure_after_remove_is_degraded_and_names_previous() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new()
        .with_build(FOO, FOO_V2, "foo")
        .with_active("foo", FOO_V1);
    nix.fail_install("error: writing to file: No space left on device");

    let report = command(&temp, &nix)
        .execute(&options(), &CancelToken::new())
        .unwrap();

    let err = report.error().unwrap();
    assert!(err.is_degraded());
    assert!(err.to_string().starts_with("install failed"));
    assert!(err.to_string().contains("No space left on device"));
    assert!(err.to_string().contains(FOO_V1));
    assert!(nix.profile().get("foo").is_none());

    let journal = JournalStore::new(&temp.path().join("state")).load().unwrap();
    let record = journal
        .find(&Target::new("deploy@bot.example.org"), &PackageReference::new(FOO))
        .unwrap();
    assert!(matches!(
        record.outcome,
        DeployOutcome::Aborted {
            phase: Phase::Installing,
            degraded: true,
            ..
        }
    ));
    assert_eq!(record.last_good, Some(StorePath::new(FOO_V1)));
}

#[test]
fn journal_supplies_previous_when_profile_cannot_be_listed() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_build(FOO, FOO_V1, "foo");
    let cmd = command(&temp, &nix);
    assert!(cmd.execute(&options(), &CancelToken::new()).unwrap().is_done());

    nix.set_build(FOO, FOO_V2, "foo");
    nix.fail_list("error: unrecognised flag '--json'");
    nix.fail_install("error: cannot connect to daemon");

    let report = cmd.execute(&options(), &CancelToken::new()).unwrap();
    let err = report.error().unwrap();
    assert!(err.is_degraded());
    assert_eq!(err.rollback_candidate(), Some(&StorePath::new(FOO_V1)));
    // Without a listing the remove runs unconditionally.
    assert!(nix
        .remote_commands()
        .contains(&"nix profile remove foo".to_string()));
}

#[test]
fn repeated_deploy_of_same_build_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_build(FOO, FOO_V1, "foo");
    let cmd = command(&temp, &nix);

    for _ in 0..2 {
        let report = cmd.execute(&options(), &CancelToken::new()).unwrap();
        assert!(report.is_done());
    }
    assert_eq!(nix.profile().get("foo").map(String::as_str), Some(FOO_V1));
    assert_eq!(nix.remote_store().len(), 1);
}

#[test]
fn package_name_is_stable_across_builds() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_build(FOO, FOO_V1, "foo");
    let cmd = command(&temp, &nix);

    let first = cmd.execute(&options(), &CancelToken::new()).unwrap();
    nix.set_build(FOO, FOO_V2, "foo");
    let second = cmd.execute(&options(), &CancelToken::new()).unwrap();

    assert_eq!(first.package_name, second.package_name);
    assert_ne!(first.store_path, second.store_path);
    assert_eq!(nix.profile().len(), 1);
}

#[test]
fn cancelled_deploy_stops_before_remote_work() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new()
        .with_build(FOO, FOO_V2, "foo")
        .with_active("foo", FOO_V1);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = command(&temp, &nix).execute(&options(), &cancel).unwrap();
    assert!(matches!(
        report.error(),
        Some(DeployError::Interrupted {
            phase: Phase::Transferring,
            reason: Interrupt::Cancelled
        })
    ));
    assert_eq!(nix.profile().get("foo").map(String::as_str), Some(FOO_V1));
}

#[test]
fn expired_timeout_is_reported_as_deadline() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_build(FOO, FOO_V1, "foo");
    let cancel = CancelToken::with_timeout(Duration::ZERO);

    let report = command(&temp, &nix)
        .execute(&options().with_timeout(Duration::from_secs(60)), &cancel)
        .unwrap();
    assert!(matches!(
        report.error(),
        Some(DeployError::Interrupted {
            reason: Interrupt::DeadlineExpired,
            ..
        })
    ));
}

#[test]
fn build_time_does_not_count_against_timeout() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new()
        .with_build(FOO, FOO_V2, "foo")
        .with_active("foo", FOO_V1);
    nix.slow_build(Duration::from_millis(400));

    let report = command(&temp, &nix)
        .execute(
            &options().with_timeout(Duration::from_millis(200)),
            &CancelToken::new(),
        )
        .unwrap();

    assert!(report.is_done(), "{:?}", report.error());
    assert_eq!(nix.profile().get("foo").map(String::as_str), Some(FOO_V2));
}

#[test]
fn non_ssh_target_is_rejected_at_transfer() {
    let temp = TempDir::new().unwrap();
    let nix = FakeNix::new().with_build(FOO, FOO_V1, "foo");

    let report = command(&temp, &nix)
        .execute(
            &DeployOptions::new("s3://bucket").with_attr("foo"),
            &CancelToken::new(),
        )
        .unwrap();
    let err = report.error().unwrap();
    assert_eq!(err.phase(), Phase::Transferring);
    assert!(err.to_string().contains("s3"));
}
