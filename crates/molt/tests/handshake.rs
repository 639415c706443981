//! Cross-process control-channel handshake.
//!
//! The parent half of each test re-executes this test binary with an
//! environment marker; the re-executed process finds its control pipes on
//! the inherited fds 3 and 4, exactly as a real worker child would.

use std::time::Duration;

use molt::{ChildCmd, ControlFrame, FramedPipe};

const CHILD_ENV: &str = "MOLT_TEST_HANDSHAKE_CHILD";

/// Child-side entry point. A plain test run (no marker) skips immediately.
#[tokio::test]
async fn handshake_child_entry() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let pipe = FramedPipe::from_raw_fds(3, 4).expect("inherited control fds");
    pipe.write(ControlFrame::ReadyOk.as_bytes())
        .await
        .expect("report ready");
    pipe.read(|frame| ControlFrame::parse(frame) != Some(ControlFrame::Exit))
        .await
        .expect("await exit request");
    pipe.write(ControlFrame::Exit.as_bytes())
        .await
        .expect("acknowledge drain");
}

#[tokio::test]
async fn spawned_child_completes_the_exit_handshake() {
    if std::env::var_os(CHILD_ENV).is_some() {
        return;
    }

    let exe = std::env::current_exe().expect("test binary path");
    let child_args = vec![
        "--exact".to_string(),
        "handshake_child_entry".to_string(),
        "--nocapture".to_string(),
    ];
    let mut cmd =
        ChildCmd::new(exe.to_str().expect("utf-8 path"), &child_args).expect("build child");
    cmd.env(CHILD_ENV, "1");
    let mut process = cmd.start().expect("spawn child");

    let handshake = async {
        let mut ready = false;
        cmd.read(|frame| match ControlFrame::parse(frame) {
            Some(ControlFrame::ReadyOk) => {
                ready = true;
                false
            }
            Some(ControlFrame::ReadyError) => false,
            _ => true,
        })
        .await
        .expect("read readiness verdict");
        assert!(ready, "child did not report ready");

        cmd.write(ControlFrame::Exit.as_bytes())
            .await
            .expect("request drain");

        let mut acked = false;
        cmd.read(|frame| {
            if ControlFrame::parse(frame) == Some(ControlFrame::Exit) {
                acked = true;
                false
            } else {
                true
            }
        })
        .await
        .expect("read drain acknowledgment");
        assert!(acked, "child did not acknowledge the drain");
    };
    tokio::time::timeout(Duration::from_secs(60), handshake)
        .await
        .expect("handshake timed out");

    let status = tokio::time::timeout(Duration::from_secs(60), process.wait())
        .await
        .expect("child did not exit")
        .expect("wait on child");
    assert!(status.success(), "child exited with {status}");
    cmd.close().await;
}

#[tokio::test]
async fn readiness_read_sees_eof_when_the_child_dies() {
    if std::env::var_os(CHILD_ENV).is_some() {
        return;
    }

    // A child that never touches the control channel: the parent's readiness
    // read must end cleanly at EOF with no verdict.
    let mut cmd = ChildCmd::new("/bin/true", &[]).expect("build child");
    let mut process = cmd.start().expect("spawn child");

    let mut verdicts = 0;
    let read = async {
        cmd.read(|_| {
            verdicts += 1;
            true
        })
        .await
        .expect("EOF is not an error");
    };
    tokio::time::timeout(Duration::from_secs(60), read)
        .await
        .expect("read did not terminate");
    assert_eq!(verdicts, 0);

    let status = process.wait().await.expect("wait on child");
    assert!(status.success());
    cmd.close().await;
}
