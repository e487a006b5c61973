//! End-to-end tests driving a [`navigator::worker::ProbeWorker`]
//! against an in-process fake control channel and a minimal fake
//! SOCKS5 listener standing in for the overlay client's SOCKS port.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};

use navigator::control::ControlClient;
use navigator::dest::DestAllocator;
use navigator::http::BW_EXPECTED_BYTES;
use navigator::node::{Fingerprint, Node, NetworkStatus, Path, RelayFlags, ServerDescriptor};
use navigator::record::{CircStatus, TimingSample};
use navigator::worker::{ProbeWorker, WorkerShared};

const FP_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
const FP_B: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
const FP_C: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC";
const TTFB_HOST: &str = "ttfb-test.navigator.invalid";
const BW_HOST: &str = "bw-test.navigator.invalid";

/// Whether the fake overlay should report the sampled circuit as
/// having built successfully or failed.
#[derive(Clone, Copy, PartialEq)]
enum BuildOutcome {
    Built,
    Failed,
}

/// Bring up a fake control channel scripted for one FINDPATH + one
/// EXTENDCIRCUIT lifecycle, and a fake SOCKS5 listener that accepts
/// exactly one CONNECT and always replies with "general SOCKS server
/// failure" (an RTT-probe-acceptable outcome).
async fn spawn_fake_overlay(outcome: BuildOutcome) -> (ControlClient, u16) {
    let control_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    let socks_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let socks_port = socks_listener.local_addr().unwrap().port();

    // Channel the SOCKS task uses to ask the control task to emit a
    // `STREAM NEW` event for a given target, and to learn when the
    // control task has seen the matching ATTACHSTREAM.
    let (stream_req_tx, mut stream_req_rx) = mpsc::unbounded_channel::<String>();
    let (attached_tx, mut attached_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        let (socket, _) = control_listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let write_half = Arc::new(Mutex::new(write_half));
        let mut lines = BufReader::new(read_half).lines();
        use tokio::io::AsyncBufReadExt;

        // Relay STREAM-NEW requests from the SOCKS task onto the
        // control wire, and forward ATTACHSTREAM completions back.
        {
            let write_half = write_half.clone();
            let attached_tx = attached_tx.clone();
            tokio::spawn(async move {
                while let Some(target) = stream_req_rx.recv().await {
                    let mut w = write_half.lock().await;
                    let _ = w
                        .write_all(format!("650 STREAM 501 NEW 1 {target} PURPOSE=USER\r\n").as_bytes())
                        .await;
                    drop(w);
                    let _ = attached_tx; // kept alive for the ATTACHSTREAM branch below
                }
            });
        }

        while let Ok(Some(line)) = lines.next_line().await {
            let mut w = write_half.lock().await;
            if line == "GETINFO status/enough-dir-info" {
                w.write_all(b"250-status/enough-dir-info=1\r\n250 OK\r\n").await.unwrap();
            } else if line == "DUMPGUARDS" {
                w.write_all(b"250 OK\r\n").await.unwrap();
            } else if line == "FINDPATH" {
                w.write_all(format!("250 {FP_A},{FP_B},{FP_C}\r\n").as_bytes()).await.unwrap();
            } else if line == format!("GETINFO ns/id/{FP_A}") {
                w.write_all(b"250-Running Valid Guard Bandwidth=1000\r\n250 OK\r\n").await.unwrap();
            } else if line == format!("GETINFO desc/id/{FP_A}") {
                w.write_all(b"250-platform Tor 0.4.8.1 on Linux\r\n250-reject *:*\r\n250 OK\r\n").await.unwrap();
            } else if line == format!("GETINFO ns/id/{FP_B}") {
                w.write_all(b"250-Running Valid Bandwidth=900\r\n250 OK\r\n").await.unwrap();
            } else if line == format!("GETINFO desc/id/{FP_B}") {
                w.write_all(b"250-platform Tor 0.4.8.1 on Linux\r\n250-reject *:*\r\n250 OK\r\n").await.unwrap();
            } else if line == format!("GETINFO ns/id/{FP_C}") {
                w.write_all(b"250-Running Valid Bandwidth=800\r\n250 OK\r\n").await.unwrap();
            } else if line == format!("GETINFO desc/id/{FP_C}") {
                w.write_all(b"250-platform Tor 0.4.8.1 on Linux\r\n250-accept *:80\r\n250 OK\r\n").await.unwrap();
            } else if line.starts_with("EXTENDCIRCUIT") {
                w.write_all(b"250 OK\r\n").await.unwrap();
                drop(w);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut w = write_half.lock().await;
                w.write_all(b"650 CIRC 1 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\r\n").await.unwrap();
                drop(w);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut w = write_half.lock().await;
                match outcome {
                    BuildOutcome::Built => {
                        w.write_all(b"650 INFO circuit_send_next_onion_skin(): circuit 1 built in 250msec\r\n").await.unwrap();
                        w.write_all(format!("650 CIRC 1 BUILT BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL $*{FP_A}~a,$*{FP_B}~b,$*{FP_C}~c\r\n").as_bytes()).await.unwrap();
                    }
                    BuildOutcome::Failed => {
                        w.write_all(b"650 CIRC 1 FAILED REASON=TIMEOUT BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\r\n").await.unwrap();
                    }
                }
            } else if line.starts_with("ATTACHSTREAM") {
                w.write_all(b"250 OK\r\n").await.unwrap();
                drop(w);
                let _ = attached_tx.send(());
            } else if line.starts_with("CLOSECIRCUIT") {
                w.write_all(b"250 OK\r\n").await.unwrap();
                drop(w);
                tokio::time::sleep(Duration::from_millis(10)).await;
                let mut w = write_half.lock().await;
                w.write_all(b"650 CIRC 1 CLOSED REASON=REQUESTED\r\n").await.unwrap();
            } else if line.starts_with("GETINFO circuit-status") {
                w.write_all(b"250-circuit-status=\r\n250 OK\r\n").await.unwrap();
            }
        }
    });

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = socks_listener.accept().await else { return };
            let stream_req_tx = stream_req_tx.clone();
            let mut attached_rx_clone = None::<mpsc::UnboundedReceiver<()>>;
            std::mem::swap(&mut attached_rx_clone, &mut None);
            tokio::spawn(handle_socks_connection(socket, stream_req_tx));
        }
    });

    // `attached_rx` is consumed inside the per-connection handler via a
    // shared channel; re-expose it through a static so the handler
    // below can await on the same stream. For this harness a single
    // in-flight SOCKS connection is assumed.
    ATTACHED.with_rx(attached_rx).await;

    let control = ControlClient::connect("127.0.0.1", control_addr.port())
        .await
        .unwrap();
    (control, socks_port)
}

mod attached_signal {
    use tokio::sync::{mpsc, Mutex};

    /// Process-wide slot carrying the single "attach completed" signal
    /// for this test harness's one active SOCKS connection.
    pub struct AttachedSignal(pub Mutex<Option<mpsc::UnboundedReceiver<()>>>);

    impl AttachedSignal {
        pub async fn with_rx(&self, rx: mpsc::UnboundedReceiver<()>) {
            *self.0.lock().await = Some(rx);
        }

        pub async fn wait(&self) {
            let mut guard = self.0.lock().await;
            if let Some(rx) = guard.as_mut() {
                let _ = rx.recv().await;
            }
        }
    }
}
use attached_signal::AttachedSignal;

static ATTACHED: AttachedSignal = AttachedSignal(tokio::sync::Mutex::const_new(None));

async fn handle_socks_connection(mut socket: TcpStream, stream_req_tx: mpsc::UnboundedSender<String>) {
    // Greeting: VER NMETHODS METHODS...
    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await.unwrap();
    let nmethods = buf[1] as usize;
    let mut methods = vec![0u8; nmethods];
    socket.read_exact(&mut methods).await.unwrap();
    socket.write_all(&[0x05, 0x00]).await.unwrap();

    // CONNECT request: VER CMD RSV ATYP ADDR PORT
    let mut head = [0u8; 4];
    socket.read_exact(&mut head).await.unwrap();
    let atyp = head[3];
    let target = match atyp {
        0x01 => {
            let mut addr = [0u8; 4];
            socket.read_exact(&mut addr).await.unwrap();
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        0x03 => {
            let mut len_buf = [0u8; 1];
            socket.read_exact(&mut len_buf).await.unwrap();
            let mut name = vec![0u8; len_buf[0] as usize];
            socket.read_exact(&mut name).await.unwrap();
            String::from_utf8_lossy(&name).to_string()
        }
        _ => panic!("unexpected SOCKS address type {atyp}"),
    };
    let mut port_buf = [0u8; 2];
    socket.read_exact(&mut port_buf).await.unwrap();
    let port = u16::from_be_bytes(port_buf);

    let _ = stream_req_tx.send(format!("{target}:{port}"));
    ATTACHED.wait().await;

    // REP=0x01 (general SOCKS server failure), BND.ADDR/PORT zeroed.
    socket
        .write_all(&[0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
}

/// Fake overlay tailored to the TTFB/BW phases: every external-host
/// stream the SOCKS listener asks about gets a bogus `PURPOSE=GENERAL`
/// `STREAM NEW` event injected onto the control wire immediately before
/// the real `PURPOSE=USER` one, and every stream id that actually
/// receives `ATTACHSTREAM` is recorded in the returned `Vec`, so a test
/// can assert the bogus ids are never attached.
///
/// Stream ids are handed out in `(bogus, real)` pairs counting up from
/// 600, so the bogus half of every pair is always even and the real
/// half always odd.
async fn spawn_fake_overlay_for_http_probe(outcome: BuildOutcome) -> (ControlClient, u16, Arc<Mutex<Vec<String>>>) {
    let control_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let control_addr = control_listener.local_addr().unwrap();
    let socks_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let socks_port = socks_listener.local_addr().unwrap().port();

    let (stream_req_tx, mut stream_req_rx) =
        mpsc::unbounded_channel::<(String, oneshot::Sender<()>)>();
    let attached_ids = Arc::new(Mutex::new(Vec::<String>::new()));

    {
        let attached_ids = attached_ids.clone();
        tokio::spawn(async move {
            let (socket, _) = control_listener.accept().await.unwrap();
            let (read_half, write_half) = socket.into_split();
            let write_half = Arc::new(Mutex::new(write_half));
            let mut lines = BufReader::new(read_half).lines();
            use tokio::io::AsyncBufReadExt;

            let pending: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>> =
                Arc::new(Mutex::new(HashMap::new()));

            {
                let write_half = write_half.clone();
                let pending = pending.clone();
                tokio::spawn(async move {
                    let mut next_id = 600u32;
                    while let Some((target, attached_tx)) = stream_req_rx.recv().await {
                        let bogus_id = next_id.to_string();
                        next_id += 1;
                        let real_id = next_id.to_string();
                        next_id += 1;

                        let mut w = write_half.lock().await;
                        let _ = w
                            .write_all(
                                format!("650 STREAM {bogus_id} NEW 1 {target} PURPOSE=GENERAL\r\n")
                                    .as_bytes(),
                            )
                            .await;
                        drop(w);
                        tokio::time::sleep(Duration::from_millis(5)).await;

                        pending.lock().await.insert(real_id.clone(), attached_tx);
                        let mut w = write_half.lock().await;
                        let _ = w
                            .write_all(
                                format!("650 STREAM {real_id} NEW 1 {target} PURPOSE=USER\r\n")
                                    .as_bytes(),
                            )
                            .await;
                    }
                });
            }

            while let Ok(Some(line)) = lines.next_line().await {
                let mut w = write_half.lock().await;
                if line == "GETINFO status/enough-dir-info" {
                    w.write_all(b"250-status/enough-dir-info=1\r\n250 OK\r\n").await.unwrap();
                } else if line == "DUMPGUARDS" {
                    w.write_all(b"250 OK\r\n").await.unwrap();
                } else if line == "FINDPATH" {
                    w.write_all(format!("250 {FP_A},{FP_B},{FP_C}\r\n").as_bytes()).await.unwrap();
                } else if line == format!("GETINFO ns/id/{FP_A}") {
                    w.write_all(b"250-Running Valid Guard Bandwidth=1000\r\n250 OK\r\n").await.unwrap();
                } else if line == format!("GETINFO desc/id/{FP_A}") {
                    w.write_all(b"250-platform Tor 0.4.8.1 on Linux\r\n250-reject *:*\r\n250 OK\r\n").await.unwrap();
                } else if line == format!("GETINFO ns/id/{FP_B}") {
                    w.write_all(b"250-Running Valid Bandwidth=900\r\n250 OK\r\n").await.unwrap();
                } else if line == format!("GETINFO desc/id/{FP_B}") {
                    w.write_all(b"250-platform Tor 0.4.8.1 on Linux\r\n250-reject *:*\r\n250 OK\r\n").await.unwrap();
                } else if line == format!("GETINFO ns/id/{FP_C}") {
                    w.write_all(b"250-Running Valid Bandwidth=800\r\n250 OK\r\n").await.unwrap();
                } else if line == format!("GETINFO desc/id/{FP_C}") {
                    w.write_all(b"250-platform Tor 0.4.8.1 on Linux\r\n250-accept *:80\r\n250 OK\r\n").await.unwrap();
                } else if line.starts_with("EXTENDCIRCUIT") {
                    w.write_all(b"250 OK\r\n").await.unwrap();
                    drop(w);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let mut w = write_half.lock().await;
                    w.write_all(b"650 CIRC 1 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\r\n").await.unwrap();
                    drop(w);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let mut w = write_half.lock().await;
                    match outcome {
                        BuildOutcome::Built => {
                            w.write_all(b"650 INFO circuit_send_next_onion_skin(): circuit 1 built in 250msec\r\n").await.unwrap();
                            w.write_all(format!("650 CIRC 1 BUILT BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL $*{FP_A}~a,$*{FP_B}~b,$*{FP_C}~c\r\n").as_bytes()).await.unwrap();
                        }
                        BuildOutcome::Failed => {
                            w.write_all(b"650 CIRC 1 FAILED REASON=TIMEOUT BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\r\n").await.unwrap();
                        }
                    }
                } else if line.starts_with("ATTACHSTREAM") {
                    w.write_all(b"250 OK\r\n").await.unwrap();
                    drop(w);
                    let id = line.split_whitespace().nth(1).unwrap_or_default().to_string();
                    attached_ids.lock().await.push(id.clone());
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(());
                    }
                } else if line.starts_with("CLOSECIRCUIT") {
                    w.write_all(b"250 OK\r\n").await.unwrap();
                    drop(w);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let mut w = write_half.lock().await;
                    w.write_all(b"650 CIRC 1 CLOSED REASON=REQUESTED\r\n").await.unwrap();
                } else if line.starts_with("GETINFO circuit-status") {
                    w.write_all(b"250-circuit-status=\r\n250 OK\r\n").await.unwrap();
                }
            }
        });
    }

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = socks_listener.accept().await else { return };
            tokio::spawn(handle_http_probe_socks_connection(socket, stream_req_tx.clone()));
        }
    });

    let control = ControlClient::connect("127.0.0.1", control_addr.port())
        .await
        .unwrap();
    (control, socks_port, attached_ids)
}

/// Handles one SOCKS5 connection used by the TTFB/BW probes: replies
/// SOCKS success only after the matching stream has been attached (as
/// reported through `stream_req_tx`/the returned oneshot), then either
/// serves a minimal HTTP response or, if the peer drops the connection
/// right after the handshake (`http::measure_connect_time`'s
/// connect-timing-only probe), does nothing further.
async fn handle_http_probe_socks_connection(
    mut socket: TcpStream,
    stream_req_tx: mpsc::UnboundedSender<(String, oneshot::Sender<()>)>,
) {
    let mut buf = [0u8; 2];
    socket.read_exact(&mut buf).await.unwrap();
    let nmethods = buf[1] as usize;
    let mut methods = vec![0u8; nmethods];
    socket.read_exact(&mut methods).await.unwrap();
    socket.write_all(&[0x05, 0x00]).await.unwrap();

    let mut head = [0u8; 4];
    socket.read_exact(&mut head).await.unwrap();
    let atyp = head[3];
    let target = match atyp {
        0x01 => {
            let mut addr = [0u8; 4];
            socket.read_exact(&mut addr).await.unwrap();
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        0x03 => {
            let mut len_buf = [0u8; 1];
            socket.read_exact(&mut len_buf).await.unwrap();
            let mut name = vec![0u8; len_buf[0] as usize];
            socket.read_exact(&mut name).await.unwrap();
            String::from_utf8_lossy(&name).to_string()
        }
        _ => panic!("unexpected SOCKS address type {atyp}"),
    };
    let mut port_buf = [0u8; 2];
    socket.read_exact(&mut port_buf).await.unwrap();
    let port = u16::from_be_bytes(port_buf);

    let (attached_tx, attached_rx) = oneshot::channel();
    let _ = stream_req_tx.send((format!("{target}:{port}"), attached_tx));
    let _ = attached_rx.await;

    // REP=0x00 (succeeded), BND.ADDR/PORT zeroed.
    socket
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut probe_buf = [0u8; 4];
    let n = match socket.read(&mut probe_buf).await {
        Ok(n) => n,
        Err(_) => return,
    };
    if n == 0 {
        // `measure_connect_time` drops its socket right after the SOCKS
        // handshake; there is no HTTP request to answer.
        return;
    }

    let mut request = Vec::from(&probe_buf[..n]);
    let mut byte = [0u8; 1];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => request.push(byte[0]),
        }
    }
    let is_head = request.starts_with(b"HEAD");

    if is_head {
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
    } else {
        let header =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {BW_EXPECTED_BYTES}\r\nConnection: close\r\n\r\n");
        socket.write_all(header.as_bytes()).await.unwrap();
        let body = vec![0u8; BW_EXPECTED_BYTES as usize];
        socket.write_all(&body).await.unwrap();
    }
    let _ = socket.shutdown().await;
}

fn sample_path() -> Path {
    let entry = Node {
        ns: NetworkStatus {
            fingerprint: Fingerprint::parse(FP_A).unwrap(),
            flags: RelayFlags { running: true, valid: true, guard: true, exit: false },
            bandwidth_weight: 1000,
        },
        desc: ServerDescriptor {
            fingerprint: Fingerprint::parse(FP_A).unwrap(),
            exit_policy_permits_http: false,
            version: "0.4.8.1".into(),
        },
    };
    let middle = Node {
        ns: NetworkStatus {
            fingerprint: Fingerprint::parse(FP_B).unwrap(),
            flags: RelayFlags { running: true, valid: true, guard: false, exit: false },
            bandwidth_weight: 900,
        },
        desc: ServerDescriptor {
            fingerprint: Fingerprint::parse(FP_B).unwrap(),
            exit_policy_permits_http: false,
            version: "0.4.8.1".into(),
        },
    };
    let exit = Node {
        ns: NetworkStatus {
            fingerprint: Fingerprint::parse(FP_C).unwrap(),
            flags: RelayFlags { running: true, valid: true, guard: false, exit: true },
            bandwidth_weight: 800,
        },
        desc: ServerDescriptor {
            fingerprint: Fingerprint::parse(FP_C).unwrap(),
            exit_policy_permits_http: true,
            version: "0.4.8.1".into(),
        },
    };
    Path::new(entry, middle, exit).unwrap()
}

fn worker_shared(control: ControlClient, socks_port: u16, archive_tx: mpsc::UnboundedSender<navigator::record::Probe>) -> Arc<WorkerShared> {
    Arc::new(WorkerShared {
        control,
        launch_lock: Arc::new(tokio::sync::Mutex::new(())),
        perf_lock: Arc::new(Semaphore::new(1)),
        bw_lock: Arc::new(Semaphore::new(1)),
        socks_addr: (Ipv4Addr::new(127, 0, 0, 1), socks_port),
        dest_allocator: Arc::new(DestAllocator::new(1)),
        archive_tx,
        rtt_iterations: 1,
        ttfb_iterations: 0,
        bw_iterations: 0,
        probesleep: Duration::ZERO,
        ttfb_url: "http://ttfb.navigator.invalid/".into(),
        bw_url: "http://bw.navigator.invalid/bulk".into(),
    })
}

fn worker_shared_http(
    control: ControlClient,
    socks_port: u16,
    archive_tx: mpsc::UnboundedSender<navigator::record::Probe>,
    ttfb_iterations: u32,
    bw_iterations: u32,
) -> Arc<WorkerShared> {
    Arc::new(WorkerShared {
        control,
        launch_lock: Arc::new(tokio::sync::Mutex::new(())),
        perf_lock: Arc::new(Semaphore::new(1)),
        bw_lock: Arc::new(Semaphore::new(1)),
        socks_addr: (Ipv4Addr::new(127, 0, 0, 1), socks_port),
        dest_allocator: Arc::new(DestAllocator::new(1)),
        archive_tx,
        rtt_iterations: 0,
        ttfb_iterations,
        bw_iterations,
        probesleep: Duration::ZERO,
        ttfb_url: format!("http://{TTFB_HOST}/"),
        bw_url: format!("http://{BW_HOST}/bulk"),
    })
}

#[tokio::test]
async fn ttfb_and_bw_probes_ignore_non_user_purpose_streams() {
    let (control, socks_port, attached_ids) =
        spawn_fake_overlay_for_http_probe(BuildOutcome::Built).await;
    let (archive_tx, mut archive_rx) = mpsc::unbounded_channel();
    let shared = worker_shared_http(control, socks_port, archive_tx, 1, 1);
    let worker = ProbeWorker::new(shared);

    tokio::time::timeout(Duration::from_secs(10), worker.run(sample_path()))
        .await
        .expect("worker timed out")
        .expect("worker failed");

    let probe = archive_rx.recv().await.expect("no probe archived");

    assert_eq!(probe.perf.len(), 1);
    assert!(
        matches!(probe.perf[0], TimingSample::Timing { .. }),
        "ttfb probe did not succeed: {:?}",
        probe.perf[0]
    );
    assert_eq!(probe.bw.len(), 1);
    assert!(
        matches!(probe.bw[0], TimingSample::Timing { .. }),
        "bw probe did not succeed: {:?}",
        probe.bw[0]
    );
    // TTFB/BW streams target an external host, never this circuit's own
    // `dest`, so they must never be recorded into `probe.streams`.
    assert!(probe.streams.is_empty());

    // Every bogus PURPOSE=GENERAL stream id handed out by the fake
    // overlay is even; every real PURPOSE=USER one is odd. Only the
    // latter may ever have been attached.
    let ids = attached_ids.lock().await;
    assert!(!ids.is_empty(), "no stream was ever attached");
    assert!(
        ids.iter().all(|id| id.parse::<u32>().unwrap() % 2 == 1),
        "a non-USER-purpose stream was attached: {ids:?}"
    );

    assert!(probe.check_invariants().is_ok());
}

#[tokio::test]
async fn happy_path_builds_probes_and_tears_down() {
    let (control, socks_port) = spawn_fake_overlay(BuildOutcome::Built).await;
    let (archive_tx, mut archive_rx) = mpsc::unbounded_channel();
    let shared = worker_shared(control, socks_port, archive_tx);
    let worker = ProbeWorker::new(shared);

    tokio::time::timeout(Duration::from_secs(5), worker.run(sample_path()))
        .await
        .expect("worker timed out")
        .expect("worker failed");

    let probe = archive_rx.recv().await.expect("no probe archived");
    assert_eq!(probe.circuit_id(), Some("1"));
    assert_eq!(probe.cbt, Some(250));
    assert!(probe.circs.iter().any(|e| e.status == CircStatus::Built));
    assert!(probe.circs.iter().any(|e| e.status == CircStatus::Closed));
    assert_eq!(probe.streams.len(), 1);
    assert!(probe.check_invariants().is_ok());
}

#[tokio::test]
async fn build_failure_skips_probe_phases() {
    let (control, socks_port) = spawn_fake_overlay(BuildOutcome::Failed).await;
    let (archive_tx, mut archive_rx) = mpsc::unbounded_channel();
    let shared = worker_shared(control, socks_port, archive_tx);
    let worker = ProbeWorker::new(shared);

    tokio::time::timeout(Duration::from_secs(5), worker.run(sample_path()))
        .await
        .expect("worker timed out")
        .expect("worker failed");

    let probe = archive_rx.recv().await.expect("no probe archived");
    assert!(probe.circs.iter().any(|e| e.status == CircStatus::Failed));
    assert!(probe.streams.is_empty());
    assert!(probe.cbt.is_none());
    assert!(probe.check_invariants().is_ok());
}
