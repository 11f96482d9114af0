//! End-to-end tests against a real child process: spawns the
//! `spawnpool-echo-worker` fixture binary and speaks the framed protocol
//! over its stdio, the same way the supervisor's proxy does.

use serde_json::{Value, json};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};

use spawnpool_proto::{
    Command, CompressConfig, FrameReader, FrameWriter, Reply, RequestEnvelope, ResponseBody,
    ResponseType, ServerInfo, WorkerBootConfig, status,
};

struct ChildHarness {
    child: Child,
    writer: FrameWriter<ChildStdin>,
    reader: FrameReader<ChildStdout>,
}

fn spawn_echo_worker() -> ChildHarness {
    let mut child = ProcessCommand::new(env!("CARGO_BIN_EXE_spawnpool-echo-worker"))
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("echo worker fixture must spawn");
    let stdin = child.stdin.take().expect("child stdin must be piped");
    let stdout = child.stdout.take().expect("child stdout must be piped");
    ChildHarness {
        child,
        writer: FrameWriter::new(stdin),
        reader: FrameReader::new(stdout),
    }
}

fn startup_cmd() -> Command {
    Command::Startup {
        config: WorkerBootConfig {
            script: None,
            request_timeout_sec: 0,
            compress: CompressConfig::default(),
            extra: Value::Null,
        },
        server: ServerInfo {
            hostname: "test-host".into(),
            ip: "127.0.0.1".into(),
            uncatch: false,
        },
    }
}

async fn handshake(h: &mut ChildHarness) {
    h.writer.send(&startup_cmd()).await.unwrap();
    let reply: Reply = h.reader.next().await.unwrap().unwrap();
    assert!(matches!(reply, Reply::StartupComplete));
}

#[tokio::test]
async fn test_real_child_startup_and_clean_exit() {
    let mut h = spawn_echo_worker();
    handshake(&mut h).await;

    h.writer.send(&Command::Shutdown).await.unwrap();
    let eof: Option<Reply> = h.reader.next().await.unwrap();
    assert!(eof.is_none());

    let exit = h.child.wait().await.unwrap();
    assert_eq!(exit.code(), Some(0));
}

#[tokio::test]
async fn test_real_child_request_roundtrip() {
    let mut h = spawn_echo_worker();
    handshake(&mut h).await;

    h.writer
        .send(&Command::Request(Box::new(RequestEnvelope {
            id: "r1".into(),
            method: "GET".into(),
            uri: "/echo/me".into(),
            params: json!({"width": 640}),
            raw: Some(bytes::Bytes::from_static(b"\x00\x01\x02")),
            ..Default::default()
        })))
        .await
        .unwrap();

    let Reply::Response(env) = h.reader.next().await.unwrap().unwrap() else {
        panic!("expected a response frame");
    };
    assert_eq!(env.id, "r1");
    assert_eq!(env.status, status::OK);
    let ResponseBody::Text(body) = &env.body else {
        panic!("expected text body");
    };
    let parsed: Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["uri"], "/echo/me");
    assert_eq!(parsed["params"]["width"], 640);
    assert_eq!(parsed["raw_len"], 3);
    assert_eq!(parsed["pid"], h.child.id().unwrap());

    h.writer.send(&Command::Shutdown).await.unwrap();
    let exit = h.child.wait().await.unwrap();
    assert_eq!(exit.code(), Some(0));
}

#[tokio::test]
async fn test_real_child_custom_roundtrip() {
    let mut h = spawn_echo_worker();
    handshake(&mut h).await;

    h.writer
        .send(&Command::Custom {
            id: "c1".into(),
            params: json!({"test": 1234}),
        })
        .await
        .unwrap();

    let Reply::Response(env) = h.reader.next().await.unwrap().unwrap() else {
        panic!("expected a response frame");
    };
    assert_eq!(env.body_type, ResponseType::Passthrough);
    let ResponseBody::Text(body) = &env.body else {
        panic!("expected text body");
    };
    let parsed: Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["code"], 0);
    assert_eq!(parsed["params"]["test"], 1234);
    assert_eq!(parsed["pid"], h.child.id().unwrap());

    h.writer.send(&Command::Shutdown).await.unwrap();
    h.child.wait().await.unwrap();
}

#[tokio::test]
async fn test_real_child_sse_stream() {
    let mut h = spawn_echo_worker();
    handshake(&mut h).await;

    h.writer
        .send(&Command::Request(Box::new(RequestEnvelope {
            id: "s1".into(),
            method: "GET".into(),
            uri: "/events".into(),
            query: [("mode".to_string(), "sse".to_string())].into(),
            ..Default::default()
        })))
        .await
        .unwrap();

    let mut chunks = Vec::new();
    loop {
        match h.reader.next::<Reply>().await.unwrap().unwrap() {
            Reply::Sse { id, chunk } => {
                assert_eq!(id, "s1");
                chunks.push(chunk);
            }
            Reply::Response(env) => {
                assert_eq!(env.body_type, ResponseType::Sse);
                break;
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
    assert_eq!(chunks, vec!["tick 0", "tick 1", "tick 2"]);

    h.writer.send(&Command::Shutdown).await.unwrap();
    h.child.wait().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_child_sigterm_exits_one() {
    let mut h = spawn_echo_worker();
    handshake(&mut h).await;

    let pid = h.child.id().unwrap() as i32;
    // SAFETY: sending SIGTERM to the child we just spawned.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let exit = h.child.wait().await.unwrap();
    assert_eq!(exit.code(), Some(1));
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_child_ignores_sigint() {
    let mut h = spawn_echo_worker();
    handshake(&mut h).await;

    let pid = h.child.id().unwrap() as i32;
    // SAFETY: sending SIGINT to the child we just spawned.
    unsafe {
        libc::kill(pid, libc::SIGINT);
    }

    // Still serving after SIGINT.
    h.writer
        .send(&Command::Custom {
            id: "c2".into(),
            params: json!({"probe": true}),
        })
        .await
        .unwrap();
    let Reply::Response(env) = h.reader.next().await.unwrap().unwrap() else {
        panic!("expected a response frame");
    };
    assert_eq!(env.status, status::OK);

    h.writer.send(&Command::Shutdown).await.unwrap();
    let exit = h.child.wait().await.unwrap();
    assert_eq!(exit.code(), Some(0));
}
