//! Purpose: End-to-end proxy scenarios against a fake ser2net console.
//! Exports: None (integration test module).
//! Role: Validate start/stop lifecycle, fan-out, write arbitration and the TCP session listener.
//! Invariants: Everything runs on loopback with ephemeral ports.
//! Invariants: Bounded waits avoid test flakiness.

mod common;

use std::sync::Arc;

use common::{FakeDevice, TestResult, WAIT, read_bytes, read_device, test_settings, wait_for};
use labctl::api::{
    DetachReason, ErrorKind, Grant, HubLimits, MemoryRegistry, ProxySettings, REFUSED_PREFIX,
    Role, SessionLogConfig, SubmitOutcome, Supervisor, WritePolicy, list_journals, list_segments,
    read_segment,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn supervisor(settings: ProxySettings) -> Supervisor {
    Supervisor::new(settings, Arc::new(MemoryRegistry::new()))
}

#[tokio::test]
async fn fan_out_reaches_every_session_in_order() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(test_settings());
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let mut upstream = device.accept().await?;

    let mut writer = handle.attach(Role::Writer, "test")?;
    let mut reader = handle.attach(Role::Reader, "test")?;
    assert_eq!(sup.status("rpi4")?.session_count, 2);

    let boot = b"U-Boot 2024.01\r\nStarting kernel ...\r\n".to_vec();
    upstream.write_all(&boot[..10]).await?;
    upstream.write_all(&boot[10..]).await?;

    assert_eq!(read_bytes(&mut writer, boot.len()).await?, boot);
    assert_eq!(read_bytes(&mut reader, boot.len()).await?, boot);

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn lifecycle_errors_are_distinct() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(test_settings());
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let _upstream = device.accept().await?;

    let err = sup
        .start("rpi4", device.endpoint(), None)
        .await
        .err()
        .ok_or("second start should fail")?;
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    let mut session = handle.attach(Role::Writer, "test")?;
    sup.stop("rpi4").await?;

    let end = tokio::time::timeout(WAIT, session.recv()).await?;
    assert!(end.is_none());
    assert_eq!(session.detach_reason(), Some(DetachReason::ProxyStopped));

    let err = sup.stop("rpi4").await.err().ok_or("stop should fail")?;
    assert_eq!(err.kind(), ErrorKind::NotRunning);
    let err = sup.attach("rpi4", Role::Reader, "test").err().ok_or("attach should fail")?;
    assert_eq!(err.kind(), ErrorKind::NotRunning);
    assert!(sup.list().is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_upstream_leaves_no_entry() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let endpoint = device.endpoint();
    device.power_off().await;

    let sup = supervisor(test_settings());
    let err = sup.start("rpi4", endpoint.clone(), None).await.err().ok_or("start should fail")?;
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(err.board(), Some("rpi4"));
    assert!(sup.list().is_empty());

    device.power_on().await?;
    sup.start("rpi4", endpoint, None).await?;
    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn registry_lookup_failures_surface_as_not_found() -> TestResult<()> {
    let sup = supervisor(test_settings());
    let err = sup
        .start_from_registry("ghost", None)
        .await
        .err()
        .ok_or("lookup should fail")?;
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn first_writer_wins_until_it_detaches() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(test_settings());
    let handle = sup.start("rpi4", device.endpoint(), Some(WritePolicy::FirstWriterWins)).await?;
    let mut upstream = device.accept().await?;

    let first = handle.attach(Role::Writer, "first")?;
    let second = handle.attach(Role::Writer, "second")?;
    assert_eq!(first.grant(), Grant::Holder);
    assert_eq!(second.grant(), Grant::Downgraded);
    assert_eq!(sup.status("rpi4")?.write_holder, Some(first.id()));

    let err = second.submit(b"reboot\n").await.err().ok_or("second should be rejected")?;
    assert_eq!(err.kind(), ErrorKind::NotWriteHolder);
    assert_eq!(first.submit(b"ls\n").await?, SubmitOutcome::Forwarded);
    assert_eq!(read_device(&mut upstream, 3).await?, b"ls\n");

    let err = second.request_write().err().ok_or("lock is held")?;
    assert_eq!(err.kind(), ErrorKind::NotWriteHolder);

    first.detach();
    assert_eq!(sup.status("rpi4")?.write_holder, None);
    second.request_write()?;
    assert!(second.can_write());
    second.submit(b"uname -a\n").await?;
    assert_eq!(read_device(&mut upstream, 9).await?, b"uname -a\n");

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn readers_are_never_forwarded() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(test_settings());
    let handle = sup.start("rpi4", device.endpoint(), Some(WritePolicy::Open)).await?;
    let _upstream = device.accept().await?;

    let reader = handle.attach(Role::Reader, "watch")?;
    assert_eq!(reader.grant(), Grant::ReadOnly);
    let err = reader.submit(b"x").await.err().ok_or("reader cannot write")?;
    assert_eq!(err.kind(), ErrorKind::NotWriteHolder);
    let err = reader.request_write().err().ok_or("reader cannot request")?;
    assert_eq!(err.kind(), ErrorKind::Usage);

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn capacity_is_enforced_without_queueing() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        limits: HubLimits {
            max_sessions: 2,
            session_buffer: 16,
        },
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let _upstream = device.accept().await?;

    let first = handle.attach(Role::Reader, "a")?;
    let _second = handle.attach(Role::Reader, "b")?;
    let err = handle.attach(Role::Reader, "c").err().ok_or("third should be refused")?;
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

    drop(first);
    assert_eq!(sup.status("rpi4")?.session_count, 1);
    let _third = handle.attach(Role::Reader, "c")?;

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn idle_sessions_are_evicted() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        idle_timeout: Some(std::time::Duration::from_millis(200)),
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let _upstream = device.accept().await?;

    let mut session = handle.attach(Role::Writer, "quiet")?;
    let end = tokio::time::timeout(WAIT, session.recv()).await?;
    assert!(end.is_none());
    assert_eq!(session.detach_reason(), Some(DetachReason::Idle));
    assert_eq!(sup.status("rpi4")?.write_holder, None);

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn tcp_listener_bridges_a_terminal_client() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(test_settings());
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let mut upstream = device.accept().await?;

    let client = TcpStream::connect(handle.listen_addr()).await?;
    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half);
    let mut banner = String::new();
    tokio::time::timeout(WAIT, lines.read_line(&mut banner)).await??;
    assert_eq!(banner, "[labctl: connected to rpi4 (write access)]\r\n");

    upstream.write_all(b"login: ").await?;
    let mut prompt = [0u8; 7];
    tokio::time::timeout(WAIT, lines.read_exact(&mut prompt)).await??;
    assert_eq!(&prompt, b"login: ");

    write_half.write_all(b"root\n").await?;
    assert_eq!(read_device(&mut upstream, 5).await?, b"root\n");

    // Ctrl-] q detaches.
    write_half.write_all(&[0x1d, b'q']).await?;
    wait_for("session detach", || {
        sup.status("rpi4").map(|status| status.session_count == 0).unwrap_or(false)
    })
    .await?;

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn tcp_listener_reports_rejected_input_once() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(test_settings());
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let _upstream = device.accept().await?;
    let _holder = handle.attach(Role::Writer, "holder")?;

    let client = TcpStream::connect(handle.listen_addr()).await?;
    let (read_half, mut write_half) = client.into_split();
    let mut lines = BufReader::new(read_half);
    let mut banner = String::new();
    tokio::time::timeout(WAIT, lines.read_line(&mut banner)).await??;
    assert!(banner.contains("(read-only)"), "banner: {banner}");

    write_half.write_all(b"a").await?;
    let mut blank = String::new();
    tokio::time::timeout(WAIT, lines.read_line(&mut blank)).await??;
    let mut notice = String::new();
    tokio::time::timeout(WAIT, lines.read_line(&mut notice)).await??;
    assert!(notice.starts_with("[labctl: input ignored:"), "notice: {notice}");

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_tcp_client_is_evicted_and_its_connection_task_ends() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        limits: HubLimits {
            max_sessions: 4,
            session_buffer: 2,
        },
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let mut upstream = device.accept().await?;
    let metrics = tokio::runtime::Handle::current().metrics();
    let baseline = metrics.num_alive_tasks();

    // Connected but never read from.
    let _stalled = TcpStream::connect(handle.listen_addr()).await?;
    wait_for("tcp session attach", || {
        sup.status("rpi4").map(|status| status.session_count == 1).unwrap_or(false)
    })
    .await?;
    assert!(metrics.num_alive_tasks() > baseline);

    let chunk = vec![b'x'; 4096];
    let deadline = tokio::time::Instant::now() + WAIT;
    while sup.status("rpi4")?.session_count > 0 {
        if tokio::time::Instant::now() > deadline {
            return Err("stalled client was never evicted".into());
        }
        upstream.write_all(&chunk).await?;
        tokio::task::yield_now().await;
    }

    wait_for("connection task to end", || metrics.num_alive_tasks() <= baseline).await?;
    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn tcp_listener_refusal_names_the_error_kind() -> TestResult<()> {
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        limits: HubLimits {
            max_sessions: 1,
            session_buffer: 16,
        },
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let _upstream = device.accept().await?;
    let _only = handle.attach(Role::Reader, "only")?;

    let mut client = TcpStream::connect(handle.listen_addr()).await?;
    let mut refusal = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut refusal)).await??;
    assert!(refusal.starts_with(REFUSED_PREFIX));
    let text = String::from_utf8(refusal)?;
    assert!(text.contains("CapacityExceeded: session limit of 1 reached]"), "refusal: {text}");

    sup.stop("rpi4").await?;
    Ok(())
}

#[tokio::test]
async fn session_log_reproduces_the_device_stream() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        session_log: Some(SessionLogConfig {
            dir: temp_dir.path().to_path_buf(),
            max_segment_bytes: 16,
            max_segment_age: std::time::Duration::from_secs(3600),
            compress: true,
            retention: None,
        }),
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let mut upstream = device.accept().await?;
    let mut session = handle.attach(Role::Reader, "watch")?;

    let stream: Vec<u8> = (0..5)
        .flat_map(|line| format!("[{line:>4}] kernel message\r\n").into_bytes())
        .collect();
    upstream.write_all(&stream).await?;
    read_bytes(&mut session, stream.len()).await?;

    sup.stop("rpi4").await?;
    let segments = list_segments(temp_dir.path(), "rpi4")?;
    assert!(segments.len() > 1, "expected rotation, got {segments:?}");
    let mut replay = Vec::new();
    for segment in &segments {
        replay.extend(read_segment(segment)?);
    }
    assert_eq!(replay, stream);
    Ok(())
}

#[tokio::test]
async fn forwarded_input_is_journaled_per_session() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        session_log: Some(SessionLogConfig {
            dir: temp_dir.path().to_path_buf(),
            max_segment_bytes: 1024,
            max_segment_age: std::time::Duration::from_secs(3600),
            compress: false,
            retention: None,
        }),
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let mut upstream = device.accept().await?;
    let holder = handle.attach(Role::Writer, "alice")?;
    let bystander = handle.attach(Role::Writer, "bob")?;

    upstream.write_all(b"login: ").await?;
    holder.submit(b"root\n").await?;
    assert_eq!(read_device(&mut upstream, 5).await?, b"root\n");
    assert!(bystander.submit(b"reboot\n").await.is_err());
    let holder_id = holder.id();
    sup.stop("rpi4").await?;

    let replay: Vec<u8> = list_segments(temp_dir.path(), "rpi4")?
        .iter()
        .map(read_segment)
        .collect::<Result<Vec<_>, _>>()?
        .concat();
    assert_eq!(replay, b"login: ");
    let journals = list_journals(temp_dir.path(), "rpi4")?;
    assert_eq!(journals.len(), 1);
    let journal = std::fs::read_to_string(&journals[0])?;
    assert_eq!(journal.lines().count(), 1, "rejected input is not journaled: {journal}");
    assert!(journal.contains(&format!(" {holder_id} \"root\\n\"")), "journal: {journal}");
    Ok(())
}

#[tokio::test]
async fn logger_failure_does_not_interrupt_sessions() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let blocker = temp_dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"")?;

    let mut device = FakeDevice::start().await?;
    let sup = supervisor(ProxySettings {
        session_log: Some(SessionLogConfig {
            dir: blocker,
            max_segment_bytes: 1024,
            max_segment_age: std::time::Duration::from_secs(3600),
            compress: false,
            retention: None,
        }),
        ..test_settings()
    });
    let handle = sup.start("rpi4", device.endpoint(), None).await?;
    let mut upstream = device.accept().await?;
    let mut session = handle.attach(Role::Reader, "watch")?;

    upstream.write_all(b"still here\r\n").await?;
    assert_eq!(read_bytes(&mut session, 12).await?, b"still here\r\n");
    wait_for("logger error in status", || {
        sup.status("rpi4")
            .ok()
            .and_then(|status| status.log)
            .is_some_and(|log| log.last_error.is_some())
    })
    .await?;
    assert_eq!(sup.status("rpi4")?.state.as_str(), "running");

    sup.stop("rpi4").await?;
    Ok(())
}
