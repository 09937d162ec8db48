//! Datagram relay between a client conduit and an outbound conduit

use std::sync::Arc;

use tracing::{debug, warn};

use crate::app::metrics::UDP_BYPASSED_TOTAL;
use crate::bypass::Bypass;
use crate::common::{Address, Result};
use crate::transport::PacketConn;

const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Moves datagrams both ways between `client` and `outbound`.
///
/// `client` reports the intended destination with every datagram and
/// accepts the real source on the way back, so one outbound socket serves
/// every destination of the association.
pub struct UdpRelay<A, B> {
    client: A,
    outbound: B,
    bypass: Option<Arc<Bypass>>,
    buffer_size: usize,
}

impl<A: PacketConn, B: PacketConn> UdpRelay<A, B> {
    pub fn new(client: A, outbound: B) -> Self {
        Self {
            client,
            outbound,
            bypass: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    /// Builder: drop datagrams to or from bypassed addresses
    pub fn with_bypass(mut self, bypass: Option<Arc<Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    /// Builder: bound on a single datagram
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.buffer_size = size;
        }
        self
    }

    /// Relay until a receive fails on either side.
    pub async fn run(self) -> Result<()> {
        tokio::select! {
            r = self.forward() => r,
            r = self.backward() => r,
        }
    }

    fn bypassed(&self, addr: &Address, direction: &str) -> bool {
        let Some(bypass) = &self.bypass else {
            return false;
        };
        if !bypass.contains(addr) {
            return false;
        }
        UDP_BYPASSED_TOTAL.with_label_values(&[direction]).inc();
        debug!(bypass = %bypass.name(), addr = %addr, direction, "bypass");
        true
    }

    /// client → outbound
    async fn forward(&self) -> Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (n, dst) = self.client.recv_from(&mut buf).await?;
            if self.bypassed(&dst, "outbound") {
                continue;
            }
            if let Err(e) = self.outbound.send_to(&buf[..n], &dst).await {
                warn!(dst = %dst, "udp relay: {}", e);
            }
        }
    }

    /// outbound → client
    async fn backward(&self) -> Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (n, src) = self.outbound.recv_from(&mut buf).await?;
            if self.bypassed(&src, "inbound") {
                continue;
            }
            if let Err(e) = self.client.send_to(&buf[..n], &src).await {
                warn!(src = %src, "udp relay: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::AddressMatcher;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// In-memory conduit: datagrams pushed on `rx` are received, sends are
    /// recorded on `tx`.
    struct MemConn {
        rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, Address)>>,
        tx: mpsc::UnboundedSender<(Vec<u8>, Address)>,
    }

    type Feed = mpsc::Sender<(Vec<u8>, Address)>;
    type Sink = mpsc::UnboundedReceiver<(Vec<u8>, Address)>;

    fn mem_conn() -> (MemConn, Feed, Sink) {
        let (feed, rx) = mpsc::channel(16);
        let (tx, sink) = mpsc::unbounded_channel();
        (
            MemConn {
                rx: tokio::sync::Mutex::new(rx),
                tx,
            },
            feed,
            sink,
        )
    }

    #[async_trait]
    impl PacketConn for MemConn {
        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
            let (data, from) = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(crate::Error::Closed)?;
            buf[..data.len()].copy_from_slice(&data);
            Ok((data.len(), from))
        }

        async fn send_to(&self, buf: &[u8], target: &Address) -> Result<usize> {
            let _ = self.tx.send((buf.to_vec(), target.clone()));
            Ok(buf.len())
        }

        fn local_addr(&self) -> Result<Address> {
            Ok(Address::unspecified())
        }
    }

    fn addr(s: &str) -> Address {
        Address::Socket(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_bypass_both_directions() {
        let (client, client_feed, mut client_sink) = mem_conn();
        let (outbound, out_feed, mut out_sink) = mem_conn();
        let bypass = Arc::new(Bypass::new(
            "lan",
            AddressMatcher::new(&["192.168.0.0/16"]),
            false,
        ));
        let task = tokio::spawn(
            UdpRelay::new(client, outbound)
                .with_bypass(Some(bypass))
                .run(),
        );

        client_feed.send((b"blocked".to_vec(), addr("192.168.1.1:53"))).await.unwrap();
        client_feed.send((b"allowed".to_vec(), addr("8.8.8.8:53"))).await.unwrap();
        let (data, dst) = tokio::time::timeout(Duration::from_secs(2), out_sink.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"allowed");
        assert_eq!(dst, addr("8.8.8.8:53"));

        out_feed.send((b"spoof".to_vec(), addr("192.168.7.7:53"))).await.unwrap();
        out_feed.send((b"answer".to_vec(), addr("8.8.8.8:53"))).await.unwrap();
        let (data, src) = tokio::time::timeout(Duration::from_secs(2), client_sink.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"answer");
        assert_eq!(src, addr("8.8.8.8:53"));

        // Nothing bypassed ever reached either side
        assert!(out_sink.try_recv().is_err());
        assert!(client_sink.try_recv().is_err());

        drop(client_feed);
        let r = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(r.is_err());
    }
}
