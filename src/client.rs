//! C9: the long-lived TCP client — connection lifecycle, the producer and
//! consumer tasks, the shape-hash correlation table, retries, timeouts, and
//! heartbeat auto-reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::{GivEnergyError, Result};
use crate::framer::ClientFramer;
use crate::pdu::{self, HeartbeatMessage, Pdu, TransparentRequest, TransparentResponse};
use crate::plant::Plant;

const READ_CHUNK_SIZE: usize = 300;

type CorrelationFuture = oneshot::Sender<TransparentResponse>;

struct TxItem {
    bytes: Vec<u8>,
    send_complete: Option<oneshot::Sender<()>>,
}

/// Shared state touched only by the client's three engine tasks: the
/// correlation table and the plant register cache.
struct Shared {
    plant: Mutex<Plant>,
    correlations: Mutex<HashMap<u64, CorrelationFuture>>,
}

/// A long-lived connection to one GivEnergy device.
pub struct Client {
    config: ClientConfig,
    shared: Arc<Shared>,
    tx: Option<mpsc::Sender<TxItem>>,
    producer: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                plant: Mutex::new(Plant::new()),
                correlations: Mutex::new(HashMap::new()),
            }),
            tx: None,
            producer: None,
            consumer: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.tx.is_some()
    }

    /// Opens the TCP connection with `NODELAY` enabled and spawns the
    /// producer/consumer task pair.
    pub async fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!("TCP connecting: {}", addr);

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("TCP connect failed: {} - {}", addr, e);
                return Err(GivEnergyError::connection(format!("failed to connect to {addr}: {e}")));
            }
            Err(_) => {
                warn!("TCP connect timed out: {}", addr);
                return Err(GivEnergyError::Timeout(format!("connect to {addr} timed out")));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }
        info!("TCP connected: {}", addr);

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.tx_queue_capacity);

        self.producer = Some(tokio::spawn(producer_loop(writer, rx, self.config.inter_frame_delay)));
        self.consumer = Some(tokio::spawn(consumer_loop(reader, tx.clone(), self.shared.clone())));
        self.tx = Some(tx);

        Ok(())
    }

    /// Idempotent: cancels the two background tasks, drops the sender (so
    /// the producer exits), and empties the correlation table.
    pub async fn close(&mut self) {
        self.tx = None;
        if let Some(handle) = self.producer.take() {
            handle.abort();
        }
        if let Some(handle) = self.consumer.take() {
            handle.abort();
        }
        self.shared.correlations.lock().await.clear();
    }

    pub async fn plant(&self) -> tokio::sync::MutexGuard<'_, Plant> {
        self.shared.plant.lock().await
    }

    /// Builds the register-read sequence for the current plant state (via
    /// [`crate::composer::Commands`]), executes it, and re-derives battery
    /// count from the refreshed caches. Responses update the plant as they
    /// arrive through the consumer loop; this call's job is purely to drive
    /// the right reads and then re-run battery detection once they land.
    pub async fn refresh_plant(
        &self,
        complete: bool,
        max_batteries: u8,
        response_timeout: Duration,
        retries: u32,
    ) -> Result<()> {
        let requests = {
            let plant = self.plant().await;
            let commands = crate::composer::Commands::new(plant.schema());
            commands.refresh_plant_data(complete, plant.number_batteries as u8, max_batteries)?
        };

        let results = self.execute(requests, response_timeout, retries, true).await?;
        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            warn!("refresh_plant: at least one read failed: {}", err);
        }

        self.plant().await.detect_batteries(max_batteries);
        Ok(())
    }

    /// Enqueues `bytes` for transmission, replacing (and cancelling) any
    /// still-pending correlation entry for `shape_hash`, then awaits the
    /// matching response with `timeout`, retrying up to `retries + 1` times
    /// in total.
    pub async fn send_request_and_await_response(
        &self,
        req: TransparentRequest,
        response_timeout: Duration,
        retries: u32,
    ) -> Result<TransparentResponse> {
        let Some(tx) = self.tx.clone() else {
            return Err(GivEnergyError::NotConnected);
        };
        run_request_retry_loop(&self.config, &tx, &self.shared, req, response_timeout, retries).await
    }

    /// Fans out one task per request and awaits all of them concurrently.
    /// Completion order across requests is not guaranteed.
    pub async fn execute(
        &self,
        requests: Vec<TransparentRequest>,
        response_timeout: Duration,
        retries: u32,
        return_exceptions: bool,
    ) -> Result<Vec<Result<TransparentResponse>>> {
        let Some(tx) = self.tx.clone() else {
            return Err(GivEnergyError::NotConnected);
        };

        let mut tasks = Vec::with_capacity(requests.len());
        for req in requests {
            let config = self.config.clone();
            let tx = tx.clone();
            let shared = self.shared.clone();
            tasks.push(tokio::spawn(async move {
                run_request_retry_loop(&config, &tx, &shared, req, response_timeout, retries).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let result = task.await.unwrap_or_else(|e| {
                Err(GivEnergyError::protocol(format!("request task panicked: {e}")))
            });
            if result.is_err() && !return_exceptions {
                return Err(result.unwrap_err());
            }
            results.push(result);
        }
        Ok(results)
    }
}

/// The retry loop shared by `send_request_and_await_response` and the
/// per-request tasks `execute` spawns: cancel-and-replace the correlation
/// entry, enqueue, await the send completion, then the response, retrying
/// on timeout or an error-flagged response up to `retries + 1` attempts.
async fn run_request_retry_loop(
    config: &ClientConfig,
    tx: &mpsc::Sender<TxItem>,
    shared: &Arc<Shared>,
    req: TransparentRequest,
    response_timeout: Duration,
    retries: u32,
) -> Result<TransparentResponse> {
    let shape_hash = req.shape_hash();
    let encoded = req.encode();

    for attempt in 1..=retries + 1 {
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut correlations = shared.correlations.lock().await;
            if let Some(previous) = correlations.insert(shape_hash, response_tx) {
                // Dropping the sender cancels whatever `send_request_and_await_response`
                // call was still waiting on it.
                drop(previous);
            }
        }

        let (send_complete_tx, send_complete_rx) = oneshot::channel();
        let queue_len = config.tx_queue_capacity - tx.capacity();
        let send_timeout = Duration::from_secs(queue_len as u64 + 1);

        if tx
            .send(TxItem { bytes: encoded.clone(), send_complete: Some(send_complete_tx) })
            .await
            .is_err()
        {
            return Err(GivEnergyError::NotConnected);
        }

        match timeout(send_timeout, send_complete_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // Producer dropped the sender without writing, e.g. the
                // socket died mid-write.
                return Err(GivEnergyError::connection("producer task dropped the send-completion channel"));
            }
            Err(_) => {
                warn!(attempt, "producer did not confirm send within {:?}", send_timeout);
                continue;
            }
        }

        match timeout(response_timeout, response_rx).await {
            Ok(Ok(response)) => {
                if response.error() {
                    warn!(attempt, shape_hash, "device returned an error response, retrying");
                    continue;
                }
                return Ok(response);
            }
            Ok(Err(_)) => {
                // Correlation entry was replaced by a newer request with
                // the same shape; this attempt observes a cancellation.
                return Err(GivEnergyError::Cancelled);
            }
            Err(_) => {
                trace!(attempt, shape_hash, "timed out awaiting response, retrying");
                continue;
            }
        }
    }

    Err(GivEnergyError::Timeout(format!(
        "no response for shape_hash {shape_hash} after {} attempts",
        retries + 1
    )))
}

async fn producer_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<TxItem>,
    inter_frame_delay: Duration,
) {
    while let Some(item) = rx.recv().await {
        if let Err(e) = writer.write_all(&item.bytes).await {
            error!("TCP write failed: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("TCP flush failed: {}", e);
            break;
        }
        trace!("TCP TX: {}B", item.bytes.len());
        if let Some(send_complete) = item.send_complete {
            let _ = send_complete.send(());
        }
        tokio::time::sleep(inter_frame_delay).await;
    }
    debug!("producer task exiting");
}

async fn consumer_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::Sender<TxItem>,
    shared: Arc<Shared>,
) {
    let mut framer = ClientFramer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("TCP EOF, closing consumer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("TCP read failed: {}", e);
                break;
            }
        };
        trace!("TCP RX: {}B", n);

        for frame in framer.feed(&buf[..n]) {
            match frame {
                Ok(Pdu::HeartbeatRequest(req)) => {
                    handle_heartbeat(&req, &tx).await;
                }
                Ok(Pdu::TransparentResponse(response)) => {
                    handle_transparent_response(response, &shared).await;
                }
                Err(e) => {
                    warn!("framer error: {}", e);
                }
            }
        }
    }
    debug!("consumer task exiting");
}

async fn handle_heartbeat(req: &HeartbeatMessage, tx: &mpsc::Sender<TxItem>) {
    let response = req.expected_response();
    let encoded = response.encode();
    if tx.send(TxItem { bytes: encoded, send_complete: None }).await.is_err() {
        warn!("could not enqueue heartbeat response, transmit queue closed");
    }
}

async fn handle_transparent_response(response: TransparentResponse, shared: &Arc<Shared>) {
    if let TransparentResponse::WriteHolding(w) = &response {
        if w.error {
            warn!(register = w.register, "write-holding response carries error flag");
        }
    }

    let shape_hash = response.shape_hash();
    {
        let mut correlations = shared.correlations.lock().await;
        if let Some(waiting) = correlations.remove(&shape_hash) {
            let _ = waiting.send(response.clone());
        }
    }

    shared.plant.lock().await.update(&response);
}

/// Periodically calls `refresh` and re-connects if the last error indicates
/// the connection died, per `GivEnergyError::needs_reconnect`.
pub async fn watch_plant<F, Fut>(client: &mut Client, refresh_period: Duration, mut refresh: F)
where
    F: FnMut(&Client) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        tokio::time::sleep(refresh_period).await;
        if let Err(e) = refresh(client).await {
            warn!("refresh failed: {}", e);
            if e.needs_reconnect() {
                client.close().await;
                if let Err(reconnect_err) = client.connect().await {
                    error!("reconnect failed: {}", reconnect_err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (Client, TcpStream) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = ClientConfig::new(addr.ip().to_string());
        config.port = addr.port();
        config.inter_frame_delay = Duration::from_millis(1);

        let mut client = Client::new(config);
        let (accept, connect) = tokio::join!(listener.accept(), client.connect());
        let (server_stream, _) = accept.unwrap();
        connect.unwrap();
        (client, server_stream)
    }

    // ========== connection lifecycle ==========

    #[tokio::test]
    async fn connect_marks_client_connected() {
        let (client, _server) = loopback_pair().await;
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut client, _server) = loopback_pair().await;
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }

    // ========== heartbeat auto-reply ==========

    #[tokio::test]
    async fn heartbeat_request_gets_auto_reply() {
        let (client, mut server) = loopback_pair().await;
        let hb = HeartbeatMessage::new(0x02);
        server.write_all(&hb.encode()).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = timeout(Duration::from_secs(1), server.read(&mut buf)).await.unwrap().unwrap();
        match pdu::decode(&buf[..n]).unwrap() {
            Pdu::HeartbeatRequest(reply) => assert_eq!(reply.data_adapter_type, 0x02),
            other => panic!("expected heartbeat reply on the wire, got {other:?}"),
        }
        drop(client);
    }

    // ========== send_request_and_await_response ==========

    #[tokio::test]
    async fn request_times_out_when_no_response_arrives() {
        let (client, _server) = loopback_pair().await;
        let req = TransparentRequest::ReadHolding(
            crate::pdu::ReadRegistersRequest::new(0x32, 0, 1).unwrap(),
        );
        let result = client
            .send_request_and_await_response(req, Duration::from_millis(20), 1)
            .await;
        assert!(matches!(result, Err(GivEnergyError::Timeout(_))));
    }

    #[tokio::test]
    async fn matching_response_completes_the_request() {
        let (client, mut server) = loopback_pair().await;
        let req = TransparentRequest::ReadHolding(
            crate::pdu::ReadRegistersRequest::new(0x32, 10, 1).unwrap(),
        );

        let send_fut = client.send_request_and_await_response(req, Duration::from_secs(2), 0);

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert!(n > 0);

        let response_bytes = make_read_holding_response_frame(10, vec![42]);
        server.write_all(&response_bytes).await.unwrap();

        let response = send_fut.await.unwrap();
        match response {
            TransparentResponse::ReadHolding(r) => assert_eq!(r.register_values, vec![42]),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    fn make_read_holding_response_frame(base: u16, values: Vec<u16>) -> Vec<u8> {
        use crate::codec::{append_crc, PayloadEncoder};

        let mut crc_builder = PayloadEncoder::new();
        crc_builder.add_u8(0x32);
        crc_builder.add_u8(3); // read-holding
        crc_builder.add_fixed_string("SA1234G567", 10);
        crc_builder.add_u16(base);
        crc_builder.add_u16(values.len() as u16);
        for v in &values {
            crc_builder.add_u16(*v);
        }
        let mut crc_bytes = crc_builder.into_bytes();
        append_crc(&mut crc_bytes);

        let mut builder = PayloadEncoder::new();
        builder.add_fixed_string("AB1234G567", 10);
        builder.buf_mut().extend_from_slice(&0x0000_0000_0000_0008u64.to_be_bytes());
        builder.buf_mut().extend_from_slice(&crc_bytes);

        let inner = builder.into_bytes();
        let mut frame = Vec::with_capacity(8 + inner.len());
        frame.extend_from_slice(&0x5959u16.to_be_bytes());
        frame.extend_from_slice(&0x0001u16.to_be_bytes());
        frame.extend_from_slice(&((inner.len() + 2) as u16).to_be_bytes());
        frame.push(0x01);
        frame.push(2); // transparent
        frame.extend_from_slice(&inner);
        frame
    }
}
