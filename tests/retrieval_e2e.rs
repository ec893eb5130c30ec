//! End-to-end retrieval scenarios against an in-process coordinator.
//!
//! One HTTP/3 server plays both roles the client talks to: the scheduler
//! (JSON-RPC at `/rpc/v0`, push streams at `/rpc/streams/v0/push/<uuid>`)
//! and the edge gateway (`/ipfs/<cid>`). Everything rides real QUIC over
//! loopback, so the full pipeline runs: discovery, admission with liveness
//! probes, the range dispatcher, and the encrypted workload submission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Request, Response, StatusCode};
use rsa::pkcs8::EncodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::io::AsyncReadExt;

use titan_client::{Client, Config, WorkloadReport};

/// Deterministic file content: byte at offset `i` is `i % 251`.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct NetState {
    base_url: String,
    addr: SocketAddr,
    file: Vec<u8>,
    scheduler_key_pem: String,
    /// Remaining injected failures per range start.
    fail_plan: Mutex<HashMap<u64, u32>>,
    /// Range starts that should park until the client goes away.
    stall_at: Mutex<Vec<u64>>,
    /// Ciphertexts received on the push path, keyed by request uuid.
    pushed: Mutex<HashMap<String, Vec<u8>>>,
    /// UUIDs bound via `titan.SubmitUserWorkloadReport`.
    bound: Mutex<Vec<String>>,
}

struct TestNet {
    state: Arc<NetState>,
    private_key: RsaPrivateKey,
}

impl TestNet {
    async fn spawn(file_len: usize) -> Self {
        let private_key =
            RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).expect("rsa key generation");
        let scheduler_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .expect("pem encode");

        let key_pair = rcgen::KeyPair::generate().expect("tls key");
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .expect("cert params")
            .self_signed(&key_pair)
            .expect("self sign");
        let cert_der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
            rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        );

        let mut tls = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("tls versions")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .expect("tls cert");
        tls.alpn_protocols = vec![b"h3".to_vec()];

        let server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls).expect("quic tls"),
        ));
        let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap())
            .expect("server bind");
        let addr = endpoint.local_addr().expect("local addr");

        let state = Arc::new(NetState {
            base_url: format!("https://{}/rpc/v0", addr),
            addr,
            file: pattern(file_len),
            scheduler_key_pem,
            fail_plan: Mutex::new(HashMap::new()),
            stall_at: Mutex::new(Vec::new()),
            pushed: Mutex::new(HashMap::new()),
            bound: Mutex::new(Vec::new()),
        });

        {
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let Ok(conn) = incoming.await else { return };
                        let Ok(mut h3_conn) = h3::server::Connection::<_, Bytes>::new(
                            h3_quinn::Connection::new(conn),
                        )
                        .await
                        else {
                            return;
                        };
                        while let Ok(Some((req, stream))) = h3_conn.accept().await {
                            let state = state.clone();
                            tokio::spawn(async move {
                                let _ = handle_request(state, req, stream).await;
                            });
                        }
                    });
                }
            });
        }

        Self { state, private_key }
    }

    /// Scheduler base URL for client configuration (without `/rpc/v0`).
    fn locator_url(&self) -> String {
        format!("https://{}", self.state.addr)
    }

    fn fail_range(&self, start: u64, times: u32) {
        self.state.fail_plan.lock().unwrap().insert(start, times);
    }

    fn stall_range(&self, start: u64) {
        self.state.stall_at.lock().unwrap().push(start);
    }

    fn bound_uuids(&self) -> Vec<String> {
        self.state.bound.lock().unwrap().clone()
    }

    /// Decrypt every pushed report with the scheduler's private key.
    fn decrypted_reports(&self) -> Vec<Vec<WorkloadReport>> {
        let pushed = self.state.pushed.lock().unwrap();
        pushed
            .values()
            .map(|ciphertext| {
                let block = self.private_key.size();
                let mut plain = Vec::new();
                for chunk in ciphertext.chunks(block) {
                    plain.extend_from_slice(
                        &self
                            .private_key
                            .decrypt(Oaep::new::<Sha256>(), chunk)
                            .expect("report must decrypt with the scheduler key"),
                    );
                }
                serde_json::from_slice(&plain).expect("report list decodes")
            })
            .collect()
    }
}

type ServerStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

async fn handle_request(
    state: Arc<NetState>,
    req: Request<()>,
    mut stream: ServerStream,
) -> Result<(), h3::Error> {
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        let n = chunk.remaining();
        body.extend_from_slice(&chunk.copy_to_bytes(n));
    }

    let path = req.uri().path().to_string();
    let (status, headers, resp_body) = if path == "/rpc/v0" {
        rpc_response(&state, &body)
    } else if let Some(rest) = path.strip_prefix("/ipfs/") {
        ipfs_response(&state, rest, &req).await
    } else if path.starts_with("/rpc/streams/v0/push/") {
        push_response(&state, &path, req.method(), body.freeze())
    } else {
        (StatusCode::NOT_FOUND, Vec::new(), Bytes::new())
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let resp = builder.body(()).expect("response build");

    stream.send_response(resp).await?;
    if !resp_body.is_empty() {
        stream.send_data(resp_body).await?;
    }
    stream.finish().await
}

fn rpc_ok(result: serde_json::Value) -> (StatusCode, Vec<(String, String)>, Bytes) {
    let envelope = serde_json::json!({"jsonrpc": "2.0", "id": "1", "result": result});
    (
        StatusCode::OK,
        vec![("content-type".to_string(), "application/json".to_string())],
        Bytes::from(serde_json::to_vec(&envelope).unwrap()),
    )
}

fn rpc_response(state: &NetState, body: &[u8]) -> (StatusCode, Vec<(String, String)>, Bytes) {
    let request: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, Vec::new(), Bytes::new()),
    };

    match request["method"].as_str().unwrap_or_default() {
        "titan.GetUserAccessPoint" => rpc_ok(serde_json::json!({
            "AreaID": "test-area",
            "SchedulerURLs": [state.base_url],
        })),
        // No candidates: the client classifies as Unknown and proceeds.
        "titan.GetCandidateURLsForDetectNat" => rpc_ok(serde_json::json!([])),
        "titan.EdgeDownloadInfos" => {
            let edge = |node: &str, token: &str| {
                serde_json::json!({
                    "Address": state.addr.to_string(),
                    "Tk": {"ID": token, "CipherText": "opaque", "Sign": "sig"},
                    "NodeID": node,
                    "NatType": "NoNAT",
                })
            };
            rpc_ok(serde_json::json!([{
                "Infos": [edge("edge-1", "token-1"), edge("edge-2", "token-2")],
                "SchedulerURL": state.base_url,
                "SchedulerKey": state.scheduler_key_pem,
            }]))
        }
        "titan.Version" => rpc_ok(serde_json::json!("test-net")),
        "titan.SubmitUserWorkloadReport" => {
            if let Some(info) = request["params"][0]["Info"].as_str() {
                state.bound.lock().unwrap().push(info.to_string());
            }
            rpc_ok(serde_json::Value::Null)
        }
        _ => rpc_ok(serde_json::Value::Null),
    }
}

async fn ipfs_response(
    state: &NetState,
    _cid_and_query: &str,
    req: &Request<()>,
) -> (StatusCode, Vec<(String, String)>, Bytes) {
    let total = state.file.len() as u64;

    let range = req
        .headers()
        .get("range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    let Some((start, end)) = range else {
        // Whole-file fetch: 200 without a Content-Range header.
        return (
            StatusCode::OK,
            Vec::new(),
            Bytes::from(state.file.clone()),
        );
    };

    if state.stall_at.lock().unwrap().contains(&start) {
        tokio::time::sleep(Duration::from_secs(30)).await;
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new(), Bytes::new());
    }

    {
        let mut plan = state.fail_plan.lock().unwrap();
        if let Some(remaining) = plan.get_mut(&start) {
            if *remaining > 0 {
                *remaining -= 1;
                return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new(), Bytes::new());
            }
        }
    }

    let end = end.min(total);
    let start = start.min(end);
    let slice = state.file[start as usize..end as usize].to_vec();
    let content_range = format!("bytes {}-{}/{}", start, end.saturating_sub(1), total);

    (
        StatusCode::PARTIAL_CONTENT,
        vec![("content-range".to_string(), content_range)],
        Bytes::from(slice),
    )
}

/// Parse `bytes=start-end` with an exclusive end, the dialect the range
/// dispatcher speaks.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn push_response(
    state: &NetState,
    path: &str,
    method: &Method,
    body: Bytes,
) -> (StatusCode, Vec<(String, String)>, Bytes) {
    let uuid = path.rsplit('/').next().unwrap_or_default().to_string();
    if method == Method::HEAD {
        (StatusCode::OK, Vec::new(), Bytes::new())
    } else if method == Method::POST {
        state.pushed.lock().unwrap().insert(uuid, body.to_vec());
        (StatusCode::OK, Vec::new(), Bytes::new())
    } else {
        (StatusCode::METHOD_NOT_ALLOWED, Vec::new(), Bytes::new())
    }
}

fn client_config(net: &TestNet) -> Config {
    Config::new(net.locator_url())
        .listen_addr("127.0.0.1:0")
        .range_size(2000)
        .concurrency(4)
}

#[tokio::test]
async fn downloads_and_reports_across_ranges() {
    let net = TestNet::spawn(5000).await;
    let client = Client::new(client_config(&net)).await.expect("client bind");

    let (size, mut reader) = client.get_file("bafytest").await.expect("get_file");
    assert_eq!(size, 5000);

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.expect("stream read");
    assert_eq!(body, pattern(5000), "reassembled bytes match the file");

    // EOF implies the ledger was flushed: one encrypted report batch was
    // pushed and bound, decryptable only by this scheduler.
    let reports = net.decrypted_reports();
    assert_eq!(reports.len(), 1, "one batch for one scheduler");
    let batch = &reports[0];
    assert!(!batch.is_empty() && batch.len() <= 2, "at most one entry per token");
    let mut tokens: Vec<&str> = batch.iter().map(|r| r.token_id.as_str()).collect();
    tokens.sort_unstable();
    tokens.dedup();
    assert_eq!(tokens.len(), batch.len(), "token entries are merged");
    let delivered: i64 = batch.iter().map(|r| r.workload.download_size).sum();
    assert!(delivered >= 5000, "measurements cover at least the file bytes");

    assert_eq!(net.bound_uuids().len(), 1, "push bound via RPC");

    // The reachable table was cleared at end-of-file.
    assert_eq!(client.reachable_edge_count(), 0);
}

#[tokio::test]
async fn transient_edge_errors_are_retried() {
    let net = TestNet::spawn(6000).await;
    // The middle range fails twice before both edges' retries succeed.
    net.fail_range(2000, 2);

    let client = Client::new(client_config(&net)).await.expect("client bind");
    let (size, mut reader) = client.get_file("bafyretry").await.expect("get_file");
    assert_eq!(size, 6000);

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.expect("stream read");
    assert_eq!(body, pattern(6000));
}

#[tokio::test]
async fn second_download_readmits_edges() {
    let net = TestNet::spawn(3000).await;
    let client = Client::new(client_config(&net)).await.expect("client bind");

    let (_, mut reader) = client.get_file("bafyone").await.expect("first get_file");
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.expect("first read");
    assert_eq!(client.reachable_edge_count(), 0, "table cleared after EOF");

    // A different CID on the same client re-runs admission.
    let (size, mut reader) = client.get_file("bafytwo").await.expect("second get_file");
    assert_eq!(size, 3000);
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.expect("second read");
    assert_eq!(body, pattern(3000));

    assert_eq!(net.bound_uuids().len(), 2, "each download submitted a report");
}

#[tokio::test]
async fn cancelled_download_still_flushes_reports() {
    let net = TestNet::spawn(64_000).await;
    // Every range past the first parks forever; the download cannot finish.
    for start in (2000..64_000).step_by(2000) {
        net.stall_range(start);
    }

    let client = Client::new(client_config(&net)).await.expect("client bind");
    let (_, reader) = client.get_file("bafystall").await.expect("get_file");

    // Give a worker time to get stuck, then abandon the download.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(reader);

    // The cancellation path flushes best-effort and clears the table.
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.reachable_edge_count() != 0 || net.bound_uuids().is_empty() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("cancel must flush reports and clear the table");
}

#[tokio::test]
async fn get_block_fetches_raw_bytes() {
    let net = TestNet::spawn(1500).await;
    let client = Client::new(client_config(&net)).await.expect("client bind");

    let block = client.get_block("bafyblock").await.expect("get_block");
    assert_eq!(block.as_ref(), pattern(1500).as_slice());
}
