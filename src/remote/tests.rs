//! Tests for SSH argument construction and transport error mapping.

use std::time::Duration;

use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};

#[fixture]
fn settings() -> SshSettings {
    SshSettings {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        user: String::from("root"),
        port: 2222,
        identity_file: Some(String::from("/keys/id_ed25519")),
        batch_mode: true,
        strict_host_key_checking: false,
        known_hosts_file: String::from("/dev/null"),
        connect_timeout: Duration::from_secs(30),
        command_timeout: Duration::from_secs(300),
    }
}

const CONNECTION_OPTIONS: &str =
    "-o ConnectTimeout=30 -o ServerAliveInterval=15 -o ServerAliveCountMax=4";

#[fixture]
fn target() -> RemoteTarget {
    RemoteTarget {
        instance_id: String::from("srv-1"),
        host: String::from("srv-1.pub.example"),
    }
}

fn executor(settings: SshSettings, runner: &ScriptedRunner) -> SshExecutor<ScriptedRunner> {
    SshExecutor::new(settings, "/root/stratus", runner.clone()).expect("settings should validate")
}

#[rstest]
fn copy_uses_scp_with_capital_port_flag(settings: SshSettings, target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_success();

    executor(settings, &runner)
        .copy(Utf8Path::new("/opt/stratus/bin/stratus"), &target)
        .expect("copy should succeed");

    let invocations = runner.invocations();
    let invocation = invocations.first().expect("one scp invocation");
    assert_eq!(invocation.program, "scp");
    assert_eq!(
        invocation.command_string(),
        format!(
            "scp -P 2222 {CONNECTION_OPTIONS} -i /keys/id_ed25519 -o BatchMode=yes \
             -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null \
             /opt/stratus/bin/stratus root@srv-1.pub.example:/root/stratus"
        )
    );
}

#[rstest]
fn exec_wraps_script_in_bash(settings: SshSettings, target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "started", "");

    let output = executor(settings, &runner)
        .exec("echo 'hi'\nnohup app &", &target)
        .expect("exec should succeed");

    assert!(output.is_success());
    assert_eq!(output.stdout, "started");
    let invocations = runner.invocations();
    let invocation = invocations.first().expect("one ssh invocation");
    let args: Vec<String> = invocation
        .args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    assert_eq!(args.first().map(String::as_str), Some("-p"));
    assert_eq!(
        args.get(args.len().saturating_sub(2)).map(String::as_str),
        Some("root@srv-1.pub.example")
    );
    assert_eq!(
        args.last().map(String::as_str),
        Some("timeout 300 bash -c 'echo '\\''hi'\\''\nnohup app &'")
    );
}

#[rstest]
fn exec_reports_script_failures_as_output(settings: SshSettings, target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(3), "", "unzip: not found");

    let output = executor(settings, &runner)
        .exec("unzip app.zip", &target)
        .expect("non-zero script exit is not a transport error");

    assert_eq!(output.exit_status, Some(3));
    assert_eq!(output.stderr, "unzip: not found");
}

#[rstest]
fn exec_maps_ssh_connection_failures(settings: SshSettings, target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(255), "", "Connection refused");

    let err = executor(settings, &runner)
        .exec("true", &target)
        .expect_err("status 255 is a transport failure");

    assert_eq!(
        err,
        RemoteExecError::Transport {
            program: String::from("ssh"),
            host: String::from("srv-1.pub.example"),
            status_text: String::from("255"),
            stderr: String::from("Connection refused"),
        }
    );
}

#[rstest]
fn copy_failure_surfaces_stderr(settings: SshSettings, target: RemoteTarget) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(1), "", "Permission denied (publickey)");

    let err = executor(settings, &runner)
        .copy(Utf8Path::new("stratus"), &target)
        .expect_err("copy should fail");

    assert!(err.to_string().contains("Permission denied"), "{err}");
}

#[rstest]
fn spawn_errors_propagate(settings: SshSettings, target: RemoteTarget) {
    let runner = ScriptedRunner::new();

    let err = executor(settings, &runner)
        .exec("true", &target)
        .expect_err("no scripted response");

    assert!(matches!(err, RemoteExecError::Spawn { .. }), "{err}");
}

#[rstest]
fn optional_flags_are_omitted(mut settings: SshSettings, target: RemoteTarget) {
    settings.identity_file = None;
    settings.batch_mode = false;
    settings.strict_host_key_checking = true;
    settings.known_hosts_file = String::new();
    settings.command_timeout = Duration::ZERO;
    let runner = ScriptedRunner::new();
    runner.push_success();

    executor(settings, &runner)
        .exec("true", &target)
        .expect("exec should succeed");

    let invocations = runner.invocations();
    let command = invocations.first().expect("invocation").command_string();
    assert_eq!(
        command,
        format!("ssh -p 2222 {CONNECTION_OPTIONS} root@srv-1.pub.example bash -c true")
    );
}

#[rstest]
fn stalled_connections_are_bounded(mut settings: SshSettings, target: RemoteTarget) {
    settings.connect_timeout = Duration::from_secs(45);
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_success();
    let ssh = executor(settings, &runner);

    ssh.copy(Utf8Path::new("stratus"), &target)
        .expect("copy should succeed");
    ssh.exec("true", &target).expect("exec should succeed");

    for invocation in runner.invocations() {
        let command = invocation.command_string();
        assert!(command.contains("-o ConnectTimeout=45"), "{command}");
        assert!(command.contains("-o ServerAliveInterval=15"), "{command}");
        assert!(command.contains("-o ServerAliveCountMax=4"), "{command}");
    }
    let exec = runner.invocations().pop().expect("ssh invocation");
    assert!(exec.command_string().ends_with("timeout 300 bash -c true"));
}

#[rstest]
fn rejects_blank_user(mut settings: SshSettings) {
    settings.user = String::from(" ");

    let err = SshExecutor::new(settings, "/root/stratus", ScriptedRunner::new())
        .expect_err("user is required");

    assert!(err.to_string().contains("STRATUS_SSH_USER"), "{err}");
}
