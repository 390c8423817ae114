//! Handler registry keyed by MAVLink message-id string (spec §3, §4.3).
//!
//! Callbacks registered for a given id run in registration order, serially,
//! within whichever worker picks up a given frame; different ids may run
//! concurrently on different workers (spec §5's ordering guarantee). The
//! special id `"*"` receives every frame after its specific handlers run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::message::DecodedFrame;

pub type FrameCallback = Arc<dyn Fn(&DecodedFrame) + Send + Sync>;

pub const WILDCARD: &str = "*";

pub struct HandlerRegistry {
    by_id: DashMap<String, Vec<(u64, FrameCallback)>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, msg_id: &str, cb: FrameCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.by_id.entry(msg_id.to_string()).or_default().push((id, cb));
        id
    }

    pub fn unregister(&self, handler_id: u64) {
        for mut entry in self.by_id.iter_mut() {
            entry.value_mut().retain(|(id, _)| *id != handler_id);
        }
    }

    /// Invokes every handler registered for `frame`'s message id, in
    /// registration order, then every wildcard handler.
    pub fn dispatch(&self, frame: &DecodedFrame) {
        let key = frame.dispatch_key();
        if let Some(entry) = self.by_id.get(&key) {
            for (_, cb) in entry.value() {
                cb(frame);
            }
        }
        if key != WILDCARD {
            if let Some(entry) = self.by_id.get(WILDCARD) {
                for (_, cb) in entry.value() {
                    cb(frame);
                }
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mavlink::message::MavMessage;
    use std::sync::Mutex;

    fn frame(id: u32) -> DecodedFrame {
        DecodedFrame {
            source_system: 1,
            source_component: 1,
            message: MavMessage::Other { msg_id: id },
        }
    }

    #[test]
    fn dispatches_in_registration_order() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = calls.clone();
        registry.register("0", Arc::new(move |_| c1.lock().unwrap().push(1)));
        let c2 = calls.clone();
        registry.register("0", Arc::new(move |_| c2.lock().unwrap().push(2)));

        registry.dispatch(&frame(0));
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unregister_stops_future_deliveries() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        let id = registry.register("0", Arc::new(move |_| *c.lock().unwrap() += 1));

        registry.dispatch(&frame(0));
        registry.unregister(id);
        registry.dispatch(&frame(0));

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn wildcard_receives_every_frame_after_specific_handlers() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c1 = calls.clone();
        registry.register("5", Arc::new(move |_| c1.lock().unwrap().push("specific")));
        let c2 = calls.clone();
        registry.register(WILDCARD, Arc::new(move |_| c2.lock().unwrap().push("wildcard")));

        registry.dispatch(&frame(5));
        assert_eq!(*calls.lock().unwrap(), vec!["specific", "wildcard"]);
    }
}
