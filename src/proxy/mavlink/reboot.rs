//! Autopilot reboot with heartbeat-drop fallback verification (spec §4.3,
//! §8 scenario 5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::message::{CommandResult, MavMessage, MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN};
use super::MavlinkProxy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebootStatusCode {
    Success,
    Denied,
    Rejected,
    Unsupported,
    TimeoutWithoutDrop,
}

#[derive(Clone, Debug)]
pub struct RebootOutcome {
    pub success: bool,
    pub status_code: RebootStatusCode,
    pub reason: String,
}

impl MavlinkProxy {
    /// Sends `MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN` and waits for a
    /// `COMMAND_ACK`. If none arrives within `timeout`, falls back to
    /// watching `HEARTBEAT` for a drop (no heartbeats for >= 2x the
    /// heartbeat period) followed by resumption, treating that as success
    /// (spec §4.3).
    pub async fn reboot_autopilot(
        &self,
        reboot_onboard_computer: bool,
        timeout: Duration,
    ) -> RebootOutcome {
        let param1 = if reboot_onboard_computer { 3.0 } else { 1.0 };
        let mut params = [0.0f32; 7];
        params[0] = param1;

        let (ack_tx, mut ack_rx) = mpsc::channel::<CommandResult>(4);
        let ack_handler_id = {
            let ack_tx = ack_tx.clone();
            self.handlers.register(
                "77", // COMMAND_ACK
                Arc::new(move |frame| {
                    if let MavMessage::CommandAck { command, result } = &frame.message {
                        if *command == MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN {
                            let _ = ack_tx.try_send(CommandResult::from_wire(*result));
                        }
                    }
                }),
            )
        };

        let heartbeat_seen = Arc::new(AtomicBool::new(false));
        let heartbeat_handler_id = {
            let seen = heartbeat_seen.clone();
            self.handlers.register(
                "0", // HEARTBEAT
                Arc::new(move |_frame| {
                    seen.store(true, Ordering::SeqCst);
                }),
            )
        };

        if let Err(e) = self
            .send(MavMessage::CommandLong {
                command: MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN,
                params,
            })
            .await
        {
            self.handlers.unregister(ack_handler_id);
            self.handlers.unregister(heartbeat_handler_id);
            return RebootOutcome {
                success: false,
                status_code: RebootStatusCode::TimeoutWithoutDrop,
                reason: format!("send failed: {e}"),
            };
        }

        let ack_result = tokio::time::timeout(timeout, ack_rx.recv()).await;
        self.handlers.unregister(ack_handler_id);

        let outcome = match ack_result {
            Ok(Some(CommandResult::Accepted)) => RebootOutcome {
                success: true,
                status_code: RebootStatusCode::Success,
                reason: "command-accepted".to_string(),
            },
            Ok(Some(CommandResult::Denied)) => RebootOutcome {
                success: false,
                status_code: RebootStatusCode::Denied,
                reason: "denied".to_string(),
            },
            Ok(Some(CommandResult::Unsupported)) => RebootOutcome {
                success: false,
                status_code: RebootStatusCode::Unsupported,
                reason: "unsupported".to_string(),
            },
            Ok(Some(CommandResult::TemporarilyRejected)) => RebootOutcome {
                success: false,
                status_code: RebootStatusCode::Rejected,
                reason: "rejected".to_string(),
            },
            Ok(Some(_)) | Ok(None) => {
                self.watch_for_heartbeat_drop_and_resume(timeout * 4).await
            }
            Err(_) => self.watch_for_heartbeat_drop_and_resume(timeout * 4).await,
        };

        self.handlers.unregister(heartbeat_handler_id);
        outcome
    }

    /// Fallback verification path: consider the reboot successful if
    /// heartbeats stop for >= 2x the configured period then resume within
    /// `window` (spec §4.3, §8 scenario 5).
    async fn watch_for_heartbeat_drop_and_resume(&self, window: Duration) -> RebootOutcome {
        let hb_period = Duration::from_secs_f32(1.0 / self.heartbeat_frequency_hz.max(0.1));
        let drop_threshold = hb_period * 2;

        let last_heartbeat = Arc::new(tokio::sync::Mutex::new(Instant::now()));
        let handler_last_heartbeat = last_heartbeat.clone();
        let handler_id = self.handlers.register(
            "0",
            Arc::new(move |_frame| {
                let last_heartbeat = handler_last_heartbeat.clone();
                tokio::spawn(async move {
                    *last_heartbeat.lock().await = Instant::now();
                });
            }),
        );

        let deadline = Instant::now() + window;
        let mut saw_drop = false;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            let elapsed_since_hb = last_heartbeat.lock().await.elapsed();
            if elapsed_since_hb >= drop_threshold {
                saw_drop = true;
            } else if saw_drop {
                // Heartbeats resumed after a drop was observed.
                self.handlers.unregister(handler_id);
                info!("reboot_autopilot: heartbeat drop and resume observed");
                return RebootOutcome {
                    success: true,
                    status_code: RebootStatusCode::Success,
                    reason: "heartbeat-drop-and-resume".to_string(),
                };
            }
        }

        self.handlers.unregister(handler_id);
        warn!("reboot_autopilot: no ack and no heartbeat drop+resume within window");
        RebootOutcome {
            success: false,
            status_code: RebootStatusCode::TimeoutWithoutDrop,
            reason: "timeout-without-drop".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MavlinkConfig, MavlinkEndpoint};
    use crate::proxy::mavlink::message::DecodedFrame;
    use crate::proxy::mavlink::MavlinkProxy;

    fn proxy(heartbeat_frequency_hz: f32) -> Arc<MavlinkProxy> {
        MavlinkProxy::new(MavlinkConfig {
            endpoint: MavlinkEndpoint::Udp {
                host: "127.0.0.1".to_string(),
                port: 14550,
            },
            source_system_id: 1,
            source_component_id: 1,
            worker_threads: 1,
            heartbeat_send_frequency_hz: heartbeat_frequency_hz,
            buffer_capacity: 16,
            startup_timeout: Duration::from_millis(50),
            retry_interval: Duration::from_millis(50),
        })
    }

    fn heartbeat_frame() -> DecodedFrame {
        DecodedFrame {
            source_system: 1,
            source_component: 1,
            message: MavMessage::Other { msg_id: 0 },
        }
    }

    #[tokio::test]
    async fn heartbeat_drop_then_resume_is_success() {
        // 10 Hz heartbeat => 100ms period, drop threshold 200ms.
        let proxy = proxy(10.0);
        let proxy2 = proxy.clone();
        let watcher = tokio::spawn(async move {
            proxy2.watch_for_heartbeat_drop_and_resume(Duration::from_secs(1)).await
        });

        // Keep the link looking alive for a beat, then go silent past the
        // drop threshold, then resume.
        proxy.handlers.dispatch(&heartbeat_frame());
        tokio::time::sleep(Duration::from_millis(250)).await;
        proxy.handlers.dispatch(&heartbeat_frame());

        let outcome = watcher.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status_code, RebootStatusCode::Success);
        assert_eq!(outcome.reason, "heartbeat-drop-and-resume");
    }

    #[tokio::test]
    async fn no_drop_no_resume_times_out() {
        // 50 Hz heartbeat => 20ms period, drop threshold 40ms; keep sending
        // faster than that so no drop is ever observed within the window.
        let proxy = proxy(50.0);
        let keep_alive = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    proxy.handlers.dispatch(&heartbeat_frame());
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let outcome = proxy
            .watch_for_heartbeat_drop_and_resume(Duration::from_millis(200))
            .await;
        keep_alive.await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.status_code, RebootStatusCode::TimeoutWithoutDrop);
    }
}
