//! # Workload Ledger
//!
//! Collects per-fetch measurements, aggregates them per token, and submits
//! the signed totals to each scheduler at end-of-file.
//!
//! ## Aggregation
//!
//! One report per token: a new measurement for a token that already has an
//! entry merges into it (earliest start, latest end, summed size, averaged
//! speed). The per-scheduler list shape only exists at flush time.
//!
//! ## Submission
//!
//! Reports are too large for a single JSON-RPC body, so each scheduler gets
//! a two-phase streaming upload:
//!
//! 1. serialize the report list and encrypt it with the scheduler's RSA key
//!    (OAEP-SHA256, chunked),
//! 2. HEAD-probe `<scheduler>/rpc/streams/v0/push/<uuid>` following 302
//!    relocations, treating 204 as a silent cancel,
//! 3. POST the ciphertext,
//! 4. bind the push with `titan.SubmitUserWorkloadReport`.
//!
//! The push is started before the binding RPC; schedulers are flushed
//! concurrently with respect to each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::crypto;
use crate::error::{Error, Result};
use crate::messages::{ReaderStream, Workload, WorkloadReport};
use crate::rpc::RpcCaller;
use crate::transport::HttpConnector;

/// Redirect budget for the HEAD probe loop.
const MAX_PUSH_REDIRECTS: usize = 8;

/// One successful fetch, as observed by the data path.
#[derive(Clone, Debug)]
pub struct Measurement {
    pub token_id: String,
    pub node_id: String,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: i64,
    /// Wall-clock duration of the fetch in nanoseconds.
    pub elapsed_ns: i64,
    pub download_size: i64,
    pub scheduler_url: String,
    pub scheduler_key: String,
}

#[derive(Clone, Debug)]
struct ProofEntry {
    report: WorkloadReport,
    scheduler_url: String,
    scheduler_key: String,
}

/// Reports destined for one scheduler, with the key to seal them.
#[derive(Clone, Debug)]
pub struct SchedulerBatch {
    pub scheduler_url: String,
    pub scheduler_key: String,
    pub reports: Vec<WorkloadReport>,
}

/// Token-keyed measurement store. Writers are the fetcher tasks; the
/// end-of-file flusher drains it.
#[derive(Default)]
pub struct Ledger {
    entries: Mutex<HashMap<String, ProofEntry>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful fetch, merging into the token's existing entry
    /// when present.
    pub fn record(&self, m: Measurement) {
        // Nanosecond timing can legitimately round to zero on coarse clocks.
        let elapsed = m.elapsed_ns.max(1);
        let speed = m.download_size / elapsed;

        let incoming = Workload {
            start_time: m.start_time,
            end_time: m.end_time,
            download_speed: speed,
            download_size: m.download_size,
        };

        let mut entries = self.entries.lock().expect("ledger poisoned");
        match entries.get_mut(&m.token_id) {
            Some(entry) => {
                let prev = &entry.report.workload;
                entry.report.workload = Workload {
                    start_time: prev.start_time.min(incoming.start_time),
                    end_time: prev.end_time.max(incoming.end_time),
                    download_speed: (prev.download_speed + incoming.download_speed) / 2,
                    download_size: prev.download_size + incoming.download_size,
                };
            }
            None => {
                entries.insert(
                    m.token_id.clone(),
                    ProofEntry {
                        report: WorkloadReport {
                            token_id: m.token_id,
                            node_id: m.node_id,
                            workload: incoming,
                        },
                        scheduler_url: m.scheduler_url,
                        scheduler_key: m.scheduler_key,
                    },
                );
            }
        }
    }

    /// Take all entries, grouped by scheduler. A second drain with nothing
    /// recorded in between returns no batches, which is what makes
    /// end-of-file idempotent.
    pub fn drain(&self) -> Vec<SchedulerBatch> {
        let entries: Vec<ProofEntry> = {
            let mut guard = self.entries.lock().expect("ledger poisoned");
            guard.drain().map(|(_, v)| v).collect()
        };

        let mut groups: HashMap<String, SchedulerBatch> = HashMap::new();
        for entry in entries {
            groups
                .entry(entry.scheduler_url.clone())
                .or_insert_with(|| SchedulerBatch {
                    scheduler_url: entry.scheduler_url.clone(),
                    scheduler_key: entry.scheduler_key.clone(),
                    reports: Vec::new(),
                })
                .reports
                .push(entry.report);
        }

        groups.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("ledger poisoned").is_empty()
    }
}

/// Encrypt a batch's report list for its scheduler.
pub fn seal_batch(batch: &SchedulerBatch) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&batch.reports)
        .map_err(|e| Error::encrypt(format!("serialize reports: {}", e)))?;
    let key = crypto::decode_public_key(&batch.scheduler_key)?;
    crypto::encrypt(&payload, &key)
}

/// Derive the push URL `<scheduler>/rpc/streams/v0/push/<uuid>` from the
/// scheduler's RPC endpoint, normalizing websocket schemes.
pub fn push_url(scheduler_url: &str, request_id: &Uuid) -> Result<String> {
    let mut url = Url::parse(scheduler_url)
        .map_err(|e| Error::submit(format!("invalid scheduler url {}: {}", scheduler_url, e)))?;

    match url.scheme() {
        "ws" => {
            let _ = url.set_scheme("http");
        }
        "wss" => {
            let _ = url.set_scheme("https");
        }
        _ => {}
    }

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::submit(format!("scheduler url has no path: {}", scheduler_url)))?;
        // .../rpc/v0 -> .../rpc/streams/v0/push/<uuid>
        segments.pop_if_empty().pop();
        segments
            .push("streams")
            .push("v0")
            .push("push")
            .push(&request_id.to_string());
    }

    Ok(url.to_string())
}

/// Flush all accumulated reports. Schedulers are submitted concurrently;
/// per-scheduler failures are logged and the first one is returned so the
/// caller can decide how loudly to complain.
pub async fn flush(rpc: &RpcCaller, ledger: &Ledger) -> Result<()> {
    let batches = ledger.drain();
    if batches.is_empty() {
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for batch in batches {
        let rpc = rpc.clone();
        tasks.spawn(async move {
            let scheduler = batch.scheduler_url.clone();
            let result = submit_batch(&rpc, batch).await;
            (scheduler, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((scheduler, Ok(()))) => {
                debug!(scheduler = %scheduler, "workload report submitted");
            }
            Ok((scheduler, Err(e))) => {
                warn!(scheduler = %scheduler, error = %e, "workload report submission failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                warn!(error = %e, "submission task panicked");
                first_error.get_or_insert(Error::submit(e.to_string()));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn submit_batch(rpc: &RpcCaller, batch: SchedulerBatch) -> Result<()> {
    let ciphertext = seal_batch(&batch)?;
    let request_id = Uuid::new_v4();
    let target = push_url(&batch.scheduler_url, &request_id)?;

    // Push first, bind second. The push runs while the binding RPC is in
    // flight; its outcome is checked afterwards.
    let connector = rpc.connector().clone();
    let push = tokio::spawn(push_stream(connector, target, Bytes::from(ciphertext)));

    rpc.submit_workload_report(&batch.scheduler_url, &ReaderStream::push(request_id.to_string()))
        .await?;

    match push.await {
        Ok(result) => result,
        Err(e) => Err(Error::submit(format!("push task failed: {}", e))),
    }
}

/// Two-phase streaming upload: HEAD-probe (following relocations) then POST
/// the ciphertext. A `204 No Content` means the server-side reader closed
/// before consuming anything; the upload is silently dropped.
async fn push_stream(connector: Arc<HttpConnector>, mut target: String, body: Bytes) -> Result<()> {
    for _ in 0..MAX_PUSH_REDIRECTS {
        let head = Request::builder()
            .method(Method::HEAD)
            .uri(target.as_str())
            .header("content-type", "application/octet-stream")
            .body(())
            .map_err(|e| Error::submit(format!("invalid push url {}: {}", target, e)))?;

        let resp = connector
            .request(head, None)
            .await
            .map_err(|e| Error::submit(e.to_string()))?;

        match resp.status.as_u16() {
            // 302: the server relocated the upload to a different shard.
            302 => {
                let location = resp
                    .header("location")
                    .ok_or_else(|| Error::submit("302 without location".to_string()))?;
                debug!(from = %target, to = %location, "push stream relocated");
                target = location.to_string();
            }
            // 204: the server-side reader closed before consuming anything.
            204 => {
                debug!(target = %target, "push stream cancelled by server");
                return Ok(());
            }
            200 => {
                let post = Request::builder()
                    .method(Method::POST)
                    .uri(target.as_str())
                    .header("content-type", "application/octet-stream")
                    .body(())
                    .map_err(|e| Error::submit(format!("invalid push url {}: {}", target, e)))?;

                let resp = connector
                    .request(post, Some(body.clone()))
                    .await
                    .map_err(|e| Error::submit(e.to_string()))?;

                if resp.status != StatusCode::OK {
                    return Err(Error::submit(format!(
                        "push rejected with HTTP {}",
                        resp.status
                    )));
                }
                return Ok(());
            }
            other => {
                return Err(Error::submit(format!(
                    "push probe returned HTTP {}",
                    other
                )));
            }
        }
    }

    Err(Error::submit("push stream redirect loop".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement(token: &str, scheduler: &str) -> Measurement {
        Measurement {
            token_id: token.to_string(),
            node_id: format!("node-{}", token),
            start_time: 1_700_000_000,
            end_time: 1_700_000_010,
            elapsed_ns: 10_000,
            download_size: 40_000,
            scheduler_url: scheduler.to_string(),
            scheduler_key: "key".to_string(),
        }
    }

    #[test]
    fn measurements_merge_per_token() {
        let ledger = Ledger::new();

        let mut first = measurement("t1", "https://s1/rpc/v0");
        first.start_time = 100;
        first.end_time = 110;
        first.elapsed_ns = 1_000;
        first.download_size = 4_000;
        ledger.record(first);

        let mut second = measurement("t1", "https://s1/rpc/v0");
        second.start_time = 90;
        second.end_time = 130;
        second.elapsed_ns = 2_000;
        second.download_size = 6_000;
        ledger.record(second);

        let batches = ledger.drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reports.len(), 1, "entries for one token merge");

        let w = &batches[0].reports[0].workload;
        assert_eq!(w.start_time, 90, "earliest start wins");
        assert_eq!(w.end_time, 130, "latest end wins");
        assert_eq!(w.download_size, 10_000, "sizes sum");
        // speeds: 4000/1000=4, 6000/2000=3, averaged (4+3)/2=3
        assert_eq!(w.download_speed, 3);
    }

    #[test]
    fn distinct_tokens_stay_distinct() {
        let ledger = Ledger::new();
        ledger.record(measurement("t1", "https://s1/rpc/v0"));
        ledger.record(measurement("t2", "https://s1/rpc/v0"));

        let batches = ledger.drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].reports.len(), 2);
    }

    #[test]
    fn batches_partition_by_scheduler() {
        let ledger = Ledger::new();
        ledger.record(measurement("t1", "https://s1/rpc/v0"));
        ledger.record(measurement("t2", "https://s2/rpc/v0"));

        let mut batches = ledger.drain();
        batches.sort_by(|a, b| a.scheduler_url.cmp(&b.scheduler_url));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].scheduler_url, "https://s1/rpc/v0");
        assert_eq!(batches[1].scheduler_url, "https://s2/rpc/v0");
        assert_eq!(batches[0].reports.len(), 1);
        assert_eq!(batches[1].reports.len(), 1);
    }

    #[test]
    fn drain_is_idempotent() {
        let ledger = Ledger::new();
        ledger.record(measurement("t1", "https://s1/rpc/v0"));

        assert_eq!(ledger.drain().len(), 1);
        assert!(ledger.drain().is_empty(), "second drain is a no-op");
        assert!(ledger.is_empty());
    }

    #[test]
    fn zero_elapsed_does_not_divide_by_zero() {
        let ledger = Ledger::new();
        let mut m = measurement("t1", "https://s1/rpc/v0");
        m.elapsed_ns = 0;
        m.download_size = 1234;
        ledger.record(m);

        let batches = ledger.drain();
        assert_eq!(batches[0].reports[0].workload.download_speed, 1234);
    }

    #[test]
    fn push_url_derivation() {
        let id = Uuid::nil();
        assert_eq!(
            push_url("https://sched.example:3456/rpc/v0", &id).unwrap(),
            format!("https://sched.example:3456/rpc/streams/v0/push/{}", id)
        );
        assert_eq!(
            push_url("wss://sched.example:3456/rpc/v0", &id).unwrap(),
            format!("https://sched.example:3456/rpc/streams/v0/push/{}", id)
        );
        assert_eq!(
            push_url("ws://sched.example/rpc/v0", &id).unwrap(),
            format!("http://sched.example/rpc/streams/v0/push/{}", id)
        );
    }

    #[test]
    fn sealed_batch_only_opens_with_own_key() {
        use rsa::pkcs8::EncodePublicKey;
        use rsa::traits::PublicKeyParts;
        use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
        use sha2::Sha256;

        let key_a = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let key_b = RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap();
        let pem_a = RsaPublicKey::from(&key_a)
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let batch = SchedulerBatch {
            scheduler_url: "https://s1/rpc/v0".to_string(),
            scheduler_key: pem_a,
            reports: vec![WorkloadReport {
                token_id: "t1".to_string(),
                node_id: "n1".to_string(),
                workload: Workload {
                    start_time: 1,
                    end_time: 2,
                    download_speed: 3,
                    download_size: 4,
                },
            }],
        };

        let ciphertext = seal_batch(&batch).unwrap();
        let block_size = RsaPublicKey::from(&key_a).size();

        let mut plain = Vec::new();
        for block in ciphertext.chunks(block_size) {
            plain.extend_from_slice(&key_a.decrypt(Oaep::new::<Sha256>(), block).unwrap());
        }
        let decoded: Vec<WorkloadReport> = serde_json::from_slice(&plain).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].token_id, "t1");

        // The other scheduler's key cannot open it.
        assert!(key_b
            .decrypt(Oaep::new::<Sha256>(), &ciphertext[..block_size])
            .is_err());
    }
}
