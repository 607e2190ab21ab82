//! Container lifecycle over the loopback provider.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{CapturedOutput, LoopbackProvider};
use silo::vmm::VirtualMachineProvider;
use silo::{Container, Process, ProcessIo, ProcessSpec, RootFs, SiloError};
use silo_shared::protocol::StatisticsCategory;

fn provider() -> Arc<dyn VirtualMachineProvider> {
    Arc::new(LoopbackProvider)
}

fn shared_rootfs(dir: &Path) -> RootFs {
    RootFs::share(dir.display().to_string(), vec![])
}

fn container(dir: &Path, arguments: &[&str]) -> Container {
    Container::new("test", shared_rootfs(dir), provider(), |config| {
        config.process = ProcessSpec::new(arguments.iter().copied());
    })
    .unwrap()
}

#[tokio::test]
async fn test_true_exits_zero() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/true"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    let status = container.wait(None).await.unwrap();
    assert_eq!(status.code(), 0);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_false_exits_one() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/false"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 1);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_shell_exit_code_propagates() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/sh", "-c", "exit 42"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 42);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_stdout_reaches_user_sink() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/sh", "-c", "echo hello from the guest"]);
    let (captured, sink) = CapturedOutput::new();
    let io = ProcessIo {
        stdout: Some(sink),
        ..ProcessIo::null()
    };
    container.create(io).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 0);
    container.stop().await.unwrap();
    assert_eq!(captured.text(), "hello from the guest\n");
}

#[tokio::test]
async fn test_stdin_flows_to_process() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/cat"]);
    let (captured, sink) = CapturedOutput::new();
    let io = ProcessIo {
        stdin: Some(Box::new(std::io::Cursor::new(b"echoed bytes".to_vec()))),
        stdout: Some(sink),
        stderr: None,
    };
    container.create(io).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 0);
    container.stop().await.unwrap();
    assert_eq!(captured.text(), "echoed bytes");
}

#[tokio::test]
async fn test_wait_timeout_leaves_process_running() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/sleep", "30"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();

    let err = container
        .wait(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"));

    // The process is still there; a kill resolves the next wait.
    container.signal(libc::SIGKILL).await.unwrap();
    let status = container.wait(None).await.unwrap();
    assert_eq!(status.code(), 128 + libc::SIGKILL);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_waiters_see_same_status() {
    let tmp = tempfile::tempdir().unwrap();
    let container = Arc::new(container(tmp.path(), &["/bin/sh", "-c", "sleep 0.2; exit 7"]));
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..5 {
        let container = Arc::clone(&container);
        waiters.push(tokio::spawn(async move {
            container.wait(None).await.unwrap().code()
        }));
    }
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), 7);
    }
    container.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_execs() {
    let tmp = tempfile::tempdir().unwrap();
    let container = Arc::new(container(tmp.path(), &["/bin/sleep", "1000"]));
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();

    let mut children = Vec::new();
    for _ in 0..81 {
        let container = Arc::clone(&container);
        children.push(tokio::spawn(async move {
            let handle = container
                .exec(ProcessSpec::new(["/bin/true"]), ProcessIo::null())
                .await?;
            let status = handle.wait(None).await?;
            handle.delete().await?;
            Ok::<i32, SiloError>(status.code())
        }));
    }
    for child in children {
        assert_eq!(child.await.unwrap().unwrap(), 0);
    }

    container.signal(libc::SIGKILL).await.unwrap();
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_exec_delete_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/sleep", "30"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();

    let handle = container
        .exec(ProcessSpec::new(["/bin/true"]), ProcessIo::null())
        .await
        .unwrap();
    assert_eq!(handle.wait(None).await.unwrap().code(), 0);
    handle.delete().await.unwrap();
    handle.delete().await.unwrap();
    handle.delete().await.unwrap();

    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_container_reusable() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/true"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    container.wait(None).await.unwrap();

    container.stop().await.unwrap();
    container.stop().await.unwrap();

    // Same controller, same id, fresh VM.
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 0);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_binary_fails_start_but_stop_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["no-such-binary-anywhere"]);
    container.create(ProcessIo::null()).await.unwrap();

    let err = container.start().await.unwrap_err();
    assert!(
        err.to_string().contains("failed to find target executable"),
        "unexpected error: {}",
        err
    );

    // A failed start leaves the controller recoverable.
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_resolv_conf_written_with_read_only_rootfs() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs = RootFs::share(tmp.path().display().to_string(), vec!["ro".into()]);
    let resolv_path = tmp.path().join("etc/resolv.conf");
    let resolv_arg = resolv_path.display().to_string();

    let container = Container::new("dns-test", rootfs, provider(), |config| {
        config.process = ProcessSpec::new(["/bin/cat", resolv_arg.as_str()]);
        config.dns = Some(silo::Dns {
            nameservers: vec!["8.8.8.8".into(), "8.8.4.4".into()],
            ..Default::default()
        });
    })
    .unwrap();

    let (captured, sink) = CapturedOutput::new();
    let io = ProcessIo {
        stdout: Some(sink),
        ..ProcessIo::null()
    };
    container.create(io).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 0);
    container.stop().await.unwrap();

    let output = captured.text();
    assert!(output.contains("8.8.8.8"), "resolv.conf: {}", output);
    assert!(output.contains("8.8.4.4"), "resolv.conf: {}", output);
}

#[tokio::test]
async fn test_copy_in_out_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/sleep", "30"]);
    container.create(ProcessIo::null()).await.unwrap();

    // 3 MiB patterned payload: several protocol chunks.
    let payload: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    let source = tmp.path().join("source.bin");
    std::fs::write(&source, &payload).unwrap();

    let guest_path = tmp.path().join("guest-copy.bin");
    container.copy_in(&source, &guest_path).await.unwrap();

    let returned = tmp.path().join("returned.bin");
    container.copy_out(&guest_path, &returned).await.unwrap();

    assert_eq!(std::fs::read(&returned).unwrap(), payload);
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_boot_log_captured() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/true"]);
    let (captured, sink) = CapturedOutput::new();
    container.set_boot_log(sink);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    container.wait(None).await.unwrap();
    container.stop().await.unwrap();
    assert!(captured.text().contains("boot complete"));
}

#[tokio::test]
async fn test_statistics_report_running_processes() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/sleep", "30"]);
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();

    let report = container
        .statistics(vec![
            StatisticsCategory::Process,
            StatisticsCategory::MemoryEvents,
        ])
        .await
        .unwrap();
    assert_eq!(report.process.unwrap().running, 1);
    // Embedded agent has no cgroup: zeroed section, not an error.
    assert_eq!(report.memory_events.unwrap().oom_kill, 0);

    container.signal(libc::SIGKILL).await.unwrap();
    container.stop().await.unwrap();
}

#[tokio::test]
async fn test_operations_before_create_are_state_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let container = container(tmp.path(), &["/bin/true"]);
    assert!(matches!(
        container.start().await.unwrap_err(),
        SiloError::InvalidState(_)
    ));
    assert!(matches!(
        container.wait(None).await.unwrap_err(),
        SiloError::InvalidState(_)
    ));
    // Stop before create is simply a no-op.
    container.stop().await.unwrap();
}
