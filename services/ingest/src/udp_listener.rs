//! UDP listener feeding one stream processor.
//!
//! Binds the configured socket with exponential backoff, then hands every
//! datagram to the processor and drives its idle checks until stopped.

use crate::config::StreamConfig;
use crate::stream_processor::StreamProcessor;
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid bind address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("Maximum bind attempts exceeded")]
    MaxBindAttemptsExceeded,

    #[error("Listener stopped before binding")]
    Stopped,
}

/// Statistics for the listener.
#[derive(Debug, Default, Clone)]
pub struct ListenerStats {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub receive_errors: u64,
    pub bind_attempts: u32,
    pub last_datagram_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unbound,
    Binding,
    Listening,
    Stopped,
    Failed,
}

pub struct StreamListener {
    config: StreamConfig,
    processor: Arc<StreamProcessor>,
    state: RwLock<ListenerState>,
    stats: RwLock<ListenerStats>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl StreamListener {
    pub fn new(config: StreamConfig, processor: Arc<StreamProcessor>) -> Self {
        Self {
            config,
            processor,
            state: RwLock::new(ListenerState::Unbound),
            stats: RwLock::new(ListenerStats::default()),
            local_addr: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Address the socket is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Ask the receive loop to exit. The stream itself is not shut down.
    pub fn stop(&self) {
        info!(bind_address = %self.config.bind_address, "Stopping UDP listener");
        self.shutdown.cancel();
    }

    /// Bind and receive until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> Result<(), ListenerError> {
        let socket = self.bind_with_retry().await?;
        self.receive_loop(socket).await;
        Ok(())
    }

    /// Bind the UDP socket with exponential backoff retry.
    async fn bind_with_retry(&self) -> Result<UdpSocket, ListenerError> {
        let address: SocketAddr =
            self.config
                .bind_address
                .parse()
                .map_err(|e: std::net::AddrParseError| ListenerError::InvalidAddress {
                    address: self.config.bind_address.clone(),
                    reason: e.to_string(),
                })?;

        let mut backoff = ExponentialBackoff {
            current_interval: self.config.bind_retry_base_delay(),
            initial_interval: self.config.bind_retry_base_delay(),
            max_interval: self.config.bind_retry_max_delay(),
            max_elapsed_time: None, // Bounded by bind_retry_attempts instead
            ..Default::default()
        };

        let mut attempts = 0u32;
        let max_attempts = self.config.bind_retry_attempts;

        loop {
            if self.shutdown.is_cancelled() {
                *self.state.write() = ListenerState::Stopped;
                return Err(ListenerError::Stopped);
            }
            *self.state.write() = ListenerState::Binding;

            match UdpSocket::bind(address).await {
                Ok(socket) => {
                    let local = socket.local_addr().map_err(ListenerError::BindFailed)?;
                    *self.local_addr.write() = Some(local);
                    *self.state.write() = ListenerState::Listening;
                    self.stats.write().bind_attempts = attempts + 1;
                    info!(address = %local, attempts = attempts + 1, "UDP listener bound");
                    return Ok(socket);
                }
                Err(e) => {
                    attempts += 1;
                    self.stats.write().bind_attempts = attempts;

                    if max_attempts > 0 && attempts >= max_attempts {
                        *self.state.write() = ListenerState::Failed;
                        error!(
                            address = %address,
                            attempts,
                            error = %e,
                            "Max bind attempts exceeded"
                        );
                        return Err(ListenerError::MaxBindAttemptsExceeded);
                    }

                    if let Some(delay) = backoff.next_backoff() {
                        warn!(
                            address = %address,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Bind failed, retrying"
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(delay) => {}
                        }
                    } else {
                        backoff.reset();
                    }
                }
            }
        }
    }

    async fn receive_loop(&self, socket: UdpSocket) {
        let mut buffer = vec![0u8; self.config.receive_buffer_bytes.max(1)];
        let mut idle_ticker = tokio::time::interval(self.idle_check_interval());
        idle_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, sender)) => {
                        {
                            let mut stats = self.stats.write();
                            stats.datagrams_received += 1;
                            stats.bytes_received += len as u64;
                            stats.last_datagram_at = Some(Instant::now());
                        }
                        self.processor.handle_datagram(sender, &buffer[..len]).await;
                    }
                    Err(e) => {
                        self.stats.write().receive_errors += 1;
                        warn!(error = %e, "UDP receive failed");
                    }
                },

                _ = idle_ticker.tick() => self.processor.check_idle().await,
            }
        }

        *self.state.write() = ListenerState::Stopped;
        debug!("UDP receive loop exited");
    }

    fn idle_check_interval(&self) -> Duration {
        let interval = self.processor.settings().idle_check_interval;
        if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::create_test_config;
    use crate::stream_processor::tests::{create_test_processor, create_test_settings};
    use crate::ts::packet::tests::build_packet;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let (processor, _catalog) = create_test_processor(create_test_settings());
        let mut config = create_test_config().stream;
        config.bind_address = "not-an-address".to_string();

        let listener = StreamListener::new(config, processor);
        assert!(matches!(
            listener.run().await,
            Err(ListenerError::InvalidAddress { .. })
        ));
        assert_eq!(listener.state(), ListenerState::Unbound);
    }

    #[tokio::test]
    async fn test_datagrams_reach_processor() {
        let (processor, _catalog) = create_test_processor(create_test_settings());
        processor.start().await.unwrap();

        let listener = Arc::new(StreamListener::new(
            create_test_config().stream,
            processor.clone(),
        ));
        let handle = tokio::spawn({
            let listener = listener.clone();
            async move { listener.run().await }
        });

        wait_for(|| listener.local_addr().is_some()).await;
        let target = listener.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&build_packet(0x100, true, 0, &[0u8; 10]), target)
            .await
            .unwrap();

        wait_for(|| processor.stats().datagrams == 1).await;
        assert_eq!(processor.stats().packets, 1);
        assert_eq!(listener.stats().bytes_received, 188);

        listener.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);

        processor.shutdown().await.unwrap();
    }
}
