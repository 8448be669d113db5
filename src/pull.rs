//! Pull delivery service: the remote collector drives the cycle.
//!
//! A request is a fixed 4-byte binary payload, big-endian
//! `(u16 ack_count, u16 requested_size)`. The ack acknowledges records from
//! the *previous* response, so the first call bootstraps with
//! `ack_count = 0`. Processing order is fixed: delete the acked records,
//! flush the cursor, then peek and return the next batch. The protocol has
//! no NACK; malformed requests are logged and dropped and the peer is
//! expected to time out and retry.
//!
//! The endpoint binds UDP on a well-known multicast group/port so
//! collectors can discover devices; an empty request payload returns the
//! device identity.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PullConfig;
use crate::quarantine::{sweep_poisoned, QuarantineStore};
use crate::queue::DurableQueue;
use crate::record::encode_batch;

/// Wire size of a data request.
pub const REQUEST_LEN: usize = 4;

/// A decoded pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
    /// Records from the previous response to acknowledge
    pub ack_count: u16,

    /// Maximum records wanted in this response
    pub requested_size: u16,
}

/// Malformed inbound request.
#[derive(Debug)]
pub enum ProtocolError {
    /// Payload was not exactly [`REQUEST_LEN`] bytes
    WrongLength(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::WrongLength(len) => {
                write!(f, "request payload is {} bytes, expected {}", len, REQUEST_LEN)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Decode the fixed 4-byte request, network byte order.
pub fn decode_request(payload: &[u8]) -> Result<PullRequest, ProtocolError> {
    if payload.len() != REQUEST_LEN {
        return Err(ProtocolError::WrongLength(payload.len()));
    }

    Ok(PullRequest {
        ack_count: u16::from_be_bytes([payload[0], payload[1]]),
        requested_size: u16::from_be_bytes([payload[2], payload[3]]),
    })
}

/// The last answered data request, kept so a retransmission can be
/// re-served without re-applying its ack.
struct ReplayEntry {
    peer: SocketAddr,
    request: PullRequest,
    response: Vec<u8>,
}

/// Serves acknowledgments and batches to a remote collector.
pub struct PullService {
    queue: Arc<DurableQueue>,
    quarantine: Arc<QuarantineStore>,
    device_name: String,
    replay: Mutex<Option<ReplayEntry>>,
}

impl PullService {
    pub fn new(
        queue: Arc<DurableQueue>,
        quarantine: Arc<QuarantineStore>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            quarantine,
            device_name: device_name.into(),
            replay: Mutex::new(None),
        }
    }

    /// Bind the configured endpoint and serve until shutdown.
    pub async fn run(
        self,
        config: &PullConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        let socket = UdpSocket::bind((config.bind.as_str(), config.port)).await?;

        // Multicast membership is for discovery only; unicast service still
        // works without it.
        match config.multicast_group.parse::<Ipv4Addr>() {
            Ok(group) => {
                if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    warn!(group = %group, error = %e, "Could not join multicast group");
                }
            }
            Err(e) => {
                warn!(group = %config.multicast_group, error = %e, "Bad multicast group");
            }
        }

        info!(addr = %socket.local_addr()?, "Pull delivery service listening");
        self.serve(socket, shutdown).await
    }

    /// Serve requests on an already-bound socket.
    ///
    /// One request at a time: queue operations for a request execute with
    /// no concurrent delete races from other pull requests.
    pub async fn serve(
        self,
        socket: UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        let mut buf = [0u8; 1500];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Pull delivery service stopping");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if let Some(response) = self.handle_request(peer, &buf[..len]) {
                            if let Err(e) = socket.send_to(&response, peer).await {
                                warn!(peer = %peer, error = %e, "Failed to send response");
                            }
                        }
                    }
                    Err(e) => {
                        // Transient socket errors must not take delivery
                        // down for the rest of the process lifetime.
                        warn!(error = %e, "Receive failed; retrying");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    /// Process one request payload; `None` means drop without responding.
    ///
    /// The ack is applied before the response is sent, so once a request
    /// has been answered the same request from the same peer is treated as
    /// a retransmission of a lost reply and re-served from cache. Applying
    /// the ack again would delete the next batch unserved.
    pub fn handle_request(&self, peer: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
        // Discovery: an empty payload asks who we are.
        if payload.is_empty() {
            return serde_json::to_vec(&json!({
                "name": self.device_name,
                "type": "field-logger",
            }))
            .ok();
        }

        let request = match decode_request(payload) {
            Ok(request) => request,
            Err(e) => {
                // No NACK in this protocol; the peer times out and retries.
                warn!(error = %e, "Dropping malformed request");
                return None;
            }
        };

        if let Some(entry) = self.replay_lock().as_ref() {
            if entry.peer == peer && entry.request == request {
                debug!(peer = %peer, "Re-serving response for retransmitted request");
                return Some(entry.response.clone());
            }
        }

        debug!(
            ack = request.ack_count,
            requested = request.requested_size,
            "Received pull request"
        );

        // Fixed order: ack first, make it durable, then serve the next
        // batch.
        let deleted = self.queue.delete(request.ack_count as usize);
        if let Err(e) = self.queue.flush() {
            // The soft delete already happened; withholding the response
            // here would make the peer retry and skip this batch. Keep
            // serving: a crash before the next flush replays the acked
            // records, and duplicates are accepted.
            error!(error = %e, "Failed to flush after ack");
        }

        if let Err(e) = sweep_poisoned(&self.queue, &self.quarantine) {
            error!(error = %e, "Failed to quarantine poison records");
        }

        let size = (request.requested_size as usize).min(self.queue.len());
        let records = self.queue.peek(size);

        debug!(
            acked = deleted,
            returned = records.len(),
            remaining = self.queue.len(),
            "Serving pull response"
        );

        let response = match encode_batch(&records) {
            Ok(bytes) => bytes,
            Err(e) => {
                // A record slipped past the sweep. Serve an empty batch so
                // the ack still reaches the peer; the record is swept on
                // the next cycle.
                error!(error = %e, "Failed to encode response batch");
                b"[]".to_vec()
            }
        };

        *self.replay_lock() = Some(ReplayEntry {
            peer,
            request,
            response: response.clone(),
        });
        Some(response)
    }

    fn replay_lock(&self) -> MutexGuard<'_, Option<ReplayEntry>> {
        self.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Measurement, Record};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_record(sequence: u64) -> Record {
        let mut measurements = BTreeMap::new();
        measurements.insert("small".to_string(), Measurement::new(sequence as f64, "counts"));
        Record::new(Utc::now(), sequence, 0, measurements)
    }

    fn poison_record(sequence: u64) -> Record {
        let mut record = make_record(sequence);
        record
            .measurements
            .insert(String::new(), Measurement::new(0.0, "unitless"));
        record
    }

    fn request_bytes(ack: u16, size: u16) -> Vec<u8> {
        let mut bytes = ack.to_be_bytes().to_vec();
        bytes.extend_from_slice(&size.to_be_bytes());
        bytes
    }

    fn peer() -> SocketAddr {
        "203.0.113.9:40000".parse().unwrap()
    }

    fn make_service(dir: &tempfile::TempDir) -> (PullService, Arc<DurableQueue>) {
        let queue = Arc::new(DurableQueue::open(dir.path().join("data.queue")).unwrap());
        let quarantine =
            Arc::new(QuarantineStore::open(dir.path().join("quarantine.queue")).unwrap());
        let service = PullService::new(queue.clone(), quarantine, "station-1");
        (service, queue)
    }

    fn decode_response(bytes: &[u8]) -> Vec<u64> {
        let records: Vec<Record> = serde_json::from_slice(bytes).unwrap();
        records.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn test_decode_request() {
        let request = decode_request(&[0, 2, 0, 5]).unwrap();
        assert_eq!(request.ack_count, 2);
        assert_eq!(request.requested_size, 5);
    }

    #[test]
    fn test_decode_request_wrong_length() {
        assert!(matches!(
            decode_request(&[1, 2, 3]),
            Err(ProtocolError::WrongLength(3))
        ));
        assert!(matches!(
            decode_request(&[1, 2, 3, 4, 5]),
            Err(ProtocolError::WrongLength(5))
        ));
    }

    #[test]
    fn test_scenario_b_ack_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=5 {
            queue.push(make_record(seq)).unwrap();
        }

        let response = service
            .handle_request(peer(), &request_bytes(2, 2))
            .expect("valid request should get a response");
        assert_eq!(decode_response(&response), vec![3, 4]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_bootstrap_request_acks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=3 {
            queue.push(make_record(seq)).unwrap();
        }

        let response = service.handle_request(peer(), &request_bytes(0, 2)).unwrap();
        assert_eq!(decode_response(&response), vec![1, 2]);
        assert_eq!(queue.len(), 3);

        // Repeating the bootstrap is idempotent: nothing was acked.
        let again = service.handle_request(peer(), &request_bytes(0, 2)).unwrap();
        assert_eq!(decode_response(&again), vec![1, 2]);
    }

    #[test]
    fn test_ack_clamped_to_queue_length() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=3 {
            queue.push(make_record(seq)).unwrap();
        }

        let response = service.handle_request(peer(), &request_bytes(100, 5)).unwrap();
        assert_eq!(decode_response(&response), Vec::<u64>::new());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_empty_queue_returns_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _queue) = make_service(&dir);

        let response = service.handle_request(peer(), &request_bytes(0, 10)).unwrap();
        assert_eq!(response, b"[]");
    }

    #[test]
    fn test_malformed_request_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);
        queue.push(make_record(1)).unwrap();

        assert!(service.handle_request(peer(), &[0, 1, 0]).is_none());
        // Nothing was acked or served.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_empty_payload_returns_identity() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _queue) = make_service(&dir);

        let response = service.handle_request(peer(), &[]).unwrap();
        let identity: serde_json::Value = serde_json::from_slice(&response).unwrap();
        assert_eq!(identity["name"], "station-1");
        assert_eq!(identity["type"], "field-logger");
    }

    #[test]
    fn test_ack_is_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.queue");
        let queue = Arc::new(DurableQueue::open(&path).unwrap());
        let quarantine =
            Arc::new(QuarantineStore::open(dir.path().join("quarantine.queue")).unwrap());
        let service = PullService::new(queue.clone(), quarantine, "station-1");

        for seq in 1..=5 {
            queue.push(make_record(seq)).unwrap();
        }
        service.handle_request(peer(), &request_bytes(2, 1)).unwrap();

        drop(service);
        drop(queue);
        let reopened = DurableQueue::open(&path).unwrap();
        // The flush inside the request made the ack durable.
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.peek(1)[0].sequence, 3);
    }

    #[test]
    fn test_poisoned_head_is_quarantined_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(DurableQueue::open(dir.path().join("data.queue")).unwrap());
        let quarantine =
            Arc::new(QuarantineStore::open(dir.path().join("quarantine.queue")).unwrap());
        let service = PullService::new(queue.clone(), quarantine.clone(), "station-1");

        queue.push(poison_record(1)).unwrap();
        queue.push(make_record(2)).unwrap();

        let response = service.handle_request(peer(), &request_bytes(0, 5)).unwrap();
        assert_eq!(decode_response(&response), vec![2]);
        assert_eq!(quarantine.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retransmitted_request_not_reacked() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=6 {
            queue.push(make_record(seq)).unwrap();
        }

        let response = service.handle_request(peer(), &request_bytes(2, 2)).unwrap();
        assert_eq!(decode_response(&response), vec![3, 4]);

        // The reply is lost in flight; the peer retries the identical
        // request. The ack must not be applied a second time.
        let retry = service.handle_request(peer(), &request_bytes(2, 2)).unwrap();
        assert_eq!(decode_response(&retry), vec![3, 4]);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_flush_failure_still_serves_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=6 {
            queue.push(make_record(seq)).unwrap();
        }

        // Squat on the cursor checkpoint's temp path so the flush inside
        // the request fails.
        std::fs::create_dir(dir.path().join("data.queue.cursor.tmp")).unwrap();

        // The batch is served anyway; withholding it would turn the
        // peer's retry into a skipped batch.
        let response = service.handle_request(peer(), &request_bytes(2, 2)).unwrap();
        assert_eq!(decode_response(&response), vec![3, 4]);

        // And the retry of the same request re-serves it rather than
        // acking records 3 and 4 unserved.
        let retry = service.handle_request(peer(), &request_bytes(2, 2)).unwrap();
        assert_eq!(decode_response(&retry), vec![3, 4]);
    }

    #[test]
    fn test_identical_request_from_other_peer_is_processed() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=6 {
            queue.push(make_record(seq)).unwrap();
        }

        let other: SocketAddr = "203.0.113.10:40000".parse().unwrap();
        let first = service.handle_request(peer(), &request_bytes(2, 2)).unwrap();
        assert_eq!(decode_response(&first), vec![3, 4]);

        // A different collector sending the same bytes is a new request,
        // not a retransmission.
        let second = service.handle_request(other, &request_bytes(2, 2)).unwrap();
        assert_eq!(decode_response(&second), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_serve_over_udp() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = make_service(&dir);

        for seq in 1..=4 {
            queue.push(make_record(seq)).unwrap();
        }

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(service.serve(socket, shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // A malformed datagram is dropped without killing the serve loop.
        client.send_to(&[9u8, 9], addr).await.unwrap();
        client.send_to(&request_bytes(1, 2), addr).await.unwrap();

        let mut buf = [0u8; 1500];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("server should respond")
            .unwrap();
        assert_eq!(decode_response(&buf[..len]), vec![2, 3]);

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), server)
            .await
            .expect("server should stop on shutdown")
            .unwrap()
            .unwrap();
    }
}
