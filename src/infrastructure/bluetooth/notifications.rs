//! Notification Pipeline
//!
//! Turns raw notifications from the telemetry characteristic into
//! [`TelemetryFrame`]s. Chunks shorter than the minimum frame length are
//! platform noise: they are counted and dropped, never surfaced as errors.

use crate::domain::models::TelemetryFrame;
use crate::infrastructure::bluetooth::connection::LinkEndpoints;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::TransportEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Inbound frame counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub accepted: u64,
    pub dropped: u64,
}

pub struct NotificationPipeline {
    min_frame_len: usize,
    telemetry: broadcast::Sender<TelemetryFrame>,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl NotificationPipeline {
    pub fn new(min_frame_len: usize, capacity: usize) -> Self {
        let (telemetry, _) = broadcast::channel(capacity.max(1));
        Self {
            min_frame_len,
            telemetry,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.telemetry.subscribe()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Filters, decodes and republishes one chunk.
    pub fn ingest(&self, chunk: &[u8]) -> Option<TelemetryFrame> {
        if chunk.len() < self.min_frame_len {
            trace!("Dropping {}-byte chunk", chunk.len());
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match protocol::decode_frame(chunk) {
            Ok(frame) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                // Nobody listening is not an error
                let _ = self.telemetry.send(frame);
                Some(frame)
            }
            Err(e) => {
                debug!("Dropping undecodable chunk: {}", e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Consumes notifications from the transport until it goes away.
    pub fn spawn(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TransportEvent>,
        endpoints: watch::Receiver<LinkEndpoints>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Notification {
                        characteristic,
                        value,
                    }) => {
                        let subscribed = endpoints
                            .borrow()
                            .endpoints
                            .notify
                            .map(|e| e.characteristic);
                        if subscribed == Some(characteristic) {
                            self.ingest(&value);
                        } else {
                            trace!("Ignoring notification from {}", characteristic);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Telemetry pipeline lagged, {} events lost", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Notification pipeline stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_chunks_dropped() {
        let pipeline = NotificationPipeline::new(protocol::MIN_FRAME_LEN, 8);
        let mut rx = pipeline.subscribe();

        for len in 0..=15 {
            assert!(pipeline.ingest(&vec![0xAB; len]).is_none());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(
            pipeline.stats(),
            FrameStats {
                accepted: 0,
                dropped: 16
            }
        );
    }

    #[test]
    fn test_sixteen_bytes_make_one_frame() {
        let pipeline = NotificationPipeline::new(protocol::MIN_FRAME_LEN, 8);
        let mut rx = pipeline.subscribe();

        let mut chunk = vec![0u8; 12];
        chunk.extend_from_slice(&42i16.to_le_bytes());
        chunk.extend_from_slice(&(-42i16).to_le_bytes());
        let frame = pipeline.ingest(&chunk).unwrap();

        assert_eq!(rx.try_recv().unwrap(), frame);
        assert!(rx.try_recv().is_err());
        assert_eq!(frame.speed_left, 42);
        assert_eq!(frame.speed_right, -42);
        assert_eq!(pipeline.stats().accepted, 1);
    }

    #[test]
    fn test_lower_threshold_still_needs_full_frame() {
        let pipeline = NotificationPipeline::new(4, 8);
        assert!(pipeline.ingest(&[0u8; 8]).is_none());
        assert_eq!(pipeline.stats().dropped, 1);
    }

    #[test]
    fn test_order_preserved() {
        let pipeline = NotificationPipeline::new(protocol::MIN_FRAME_LEN, 8);
        let mut rx = pipeline.subscribe();

        for speed in 1..=3i16 {
            let mut chunk = vec![0u8; 12];
            chunk.extend_from_slice(&speed.to_le_bytes());
            chunk.extend_from_slice(&[0, 0]);
            pipeline.ingest(&chunk);
        }
        let speeds: Vec<i16> = (0..3).map(|_| rx.try_recv().unwrap().speed_left).collect();
        assert_eq!(speeds, vec![1, 2, 3]);
    }
}
