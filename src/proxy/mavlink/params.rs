//! Windowed, resend-until-confirmed bulk parameter read/write over a lossy
//! MAVLink link (spec §4.3's "lossy-link bulk ops").
//!
//! Both operations share the same shape: keep at most `max_in_flight`
//! requests outstanding, resend anything older than `resend_interval` with
//! retries remaining, and terminate on full confirmation, elapsed
//! `timeout_total`, or retry exhaustion.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

use super::message::{MavMessage, ParamType, ParamValue};
use super::MavlinkProxy;
use crate::proxy::ProxyError;

/// One of the three accepted input shapes for a parameter to set (spec
/// §4.3: "v", "(v, type)", "{value, type}").
#[derive(Clone, Copy, Debug)]
pub enum ParamSpec {
    Bare(ParamValue),
    Typed(ParamValue, ParamType),
}

impl ParamSpec {
    fn value(&self) -> ParamValue {
        match self {
            ParamSpec::Bare(v) => *v,
            ParamSpec::Typed(v, _) => *v,
        }
    }

    fn param_type(&self) -> Option<ParamType> {
        match self {
            ParamSpec::Bare(_) => None,
            ParamSpec::Typed(_, t) => Some(*t),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SetResult {
    pub name: String,
    pub value: ParamValue,
    pub param_type: ParamType,
}

#[derive(Clone, Debug)]
pub struct GetResult {
    pub name: String,
    pub value: ParamValue,
    pub raw: ParamValue,
    pub param_type: ParamType,
    pub count: u16,
    pub index: u16,
}

struct PendingSet {
    spec: ParamSpec,
    resolved_type: ParamType,
    retries_remaining: u32,
    last_send: Instant,
}

struct PendingGet {
    retries_remaining: u32,
    last_send: Instant,
}

/// Float compares use a 1e-5 relative tolerance (spec §4.3); integer
/// compares are exact. This is the one verification rule spec §8's round
/// trip property names directly.
fn values_match(requested: ParamValue, echoed: ParamValue, param_type: ParamType) -> bool {
    if param_type.is_float() {
        let a = requested.as_f64();
        let b = echoed.as_f64();
        let scale = a.abs().max(b.abs()).max(1.0);
        (a - b).abs() <= 1e-5 * scale
    } else {
        match (requested, echoed) {
            (ParamValue::Int(a), ParamValue::Int(b)) => a == b,
            (a, b) => (a.as_f64() - b.as_f64()).abs() < f64::EPSILON,
        }
    }
}

impl MavlinkProxy {
    /// Sets parameters over a lossy link with windowed resend (spec
    /// §4.3). Parameters whose type is unspecified are first read to learn
    /// their on-autopilot type (the get-path), then set.
    pub async fn set_params_bulk_lossy(
        &self,
        params_to_set: HashMap<String, ParamSpec>,
        timeout_total: Duration,
        max_retries: u32,
        max_in_flight: usize,
        resend_interval: Duration,
        verify_ack_value: bool,
    ) -> HashMap<String, SetResult> {
        // Resolve missing types via the get-path first.
        let mut resolved: HashMap<String, ParamSpec> = HashMap::new();
        let mut need_type_lookup = Vec::new();
        for (name, spec) in params_to_set {
            if spec.param_type().is_none() {
                need_type_lookup.push(name.clone());
            }
            resolved.insert(name, spec);
        }
        if !need_type_lookup.is_empty() {
            let learned = self
                .get_params_bulk_lossy(
                    need_type_lookup.clone(),
                    timeout_total,
                    max_retries,
                    max_in_flight,
                    resend_interval,
                )
                .await;
            for name in &need_type_lookup {
                if let Some(got) = learned.get(name) {
                    if let Some(spec) = resolved.get(name).copied() {
                        resolved.insert(name.clone(), ParamSpec::Typed(spec.value(), got.param_type));
                    }
                } else {
                    warn!("could not learn type for parameter {name}; dropping from set request");
                    resolved.remove(name);
                }
            }
        }

        let (ack_tx, mut ack_rx) = mpsc::channel::<(String, ParamValue, ParamType)>(256);
        let handler_id = {
            let ack_tx = ack_tx.clone();
            self.handlers.register(
                "22", // PARAM_VALUE
                std::sync::Arc::new(move |frame| {
                    if let MavMessage::ParamValue {
                        param_id,
                        param_value,
                        param_type,
                        ..
                    } = &frame.message
                    {
                        let _ = ack_tx.try_send((param_id.clone(), *param_value, *param_type));
                    }
                }),
            )
        };

        let mut pending: HashMap<String, PendingSet> = HashMap::new();
        for (name, spec) in &resolved {
            let param_type = spec.param_type().unwrap_or(ParamType::Real32);
            pending.insert(
                name.clone(),
                PendingSet {
                    spec: *spec,
                    resolved_type: param_type,
                    retries_remaining: max_retries,
                    last_send: Instant::now() - resend_interval * 2,
                },
            );
        }

        let mut confirmed: HashMap<String, SetResult> = HashMap::new();
        let deadline = Instant::now() + timeout_total;
        let names: Vec<String> = pending.keys().cloned().collect();
        let mut in_flight: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut cursor = 0usize;
        let mut ticker = interval(Duration::from_millis(50));

        loop {
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }

            // Fill the window.
            while in_flight.len() < max_in_flight && in_flight.len() < pending.len() {
                let Some(name) = names
                    .iter()
                    .cycle()
                    .skip(cursor)
                    .find(|n| pending.contains_key(n.as_str()) && !in_flight.contains(n.as_str()))
                    .cloned()
                else {
                    break;
                };
                cursor += 1;
                let entry = pending.get_mut(&name).unwrap();
                if entry.last_send.elapsed() >= resend_interval {
                    self.send(MavMessage::ParamSet {
                        param_id: name.clone(),
                        param_value: entry.spec.value(),
                        param_type: entry.resolved_type,
                    })
                    .await
                    .ok();
                    entry.last_send = Instant::now();
                    in_flight.insert(name.clone());
                } else {
                    in_flight.insert(name.clone());
                }
            }

            tokio::select! {
                biased;
                ack = ack_rx.recv() => {
                    if let Some((name, echoed, param_type)) = ack {
                        if let Some(entry) = pending.get(&name) {
                            let matches = !verify_ack_value
                                || values_match(entry.spec.value(), echoed, param_type);
                            if matches {
                                confirmed.insert(
                                    name.clone(),
                                    SetResult { name: name.clone(), value: echoed, param_type },
                                );
                                pending.remove(&name);
                                in_flight.remove(&name);
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    let expired: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| p.last_send.elapsed() >= resend_interval)
                        .map(|(n, _)| n.clone())
                        .collect();
                    for name in expired {
                        let should_drop = {
                            let entry = pending.get_mut(&name).unwrap();
                            if entry.retries_remaining == 0 {
                                true
                            } else {
                                self.send(MavMessage::ParamSet {
                                    param_id: name.clone(),
                                    param_value: entry.spec.value(),
                                    param_type: entry.resolved_type,
                                })
                                .await
                                .ok();
                                entry.retries_remaining -= 1;
                                entry.last_send = Instant::now();
                                false
                            }
                        };
                        if should_drop {
                            warn!("param {name} exhausted retries in set_params_bulk_lossy");
                            pending.remove(&name);
                            in_flight.remove(&name);
                        }
                    }
                }
            }
        }

        self.handlers.unregister(handler_id);
        for name in pending.keys() {
            info!("param {name} unconfirmed at end of set_params_bulk_lossy");
        }
        confirmed
    }

    /// Reads parameters over a lossy link with the same windowed resend
    /// discipline as [`Self::set_params_bulk_lossy`] (spec §4.3).
    pub async fn get_params_bulk_lossy(
        &self,
        names: Vec<String>,
        timeout_total: Duration,
        max_retries: u32,
        max_in_flight: usize,
        resend_interval: Duration,
    ) -> HashMap<String, GetResult> {
        let (ack_tx, mut ack_rx) = mpsc::channel::<(String, ParamValue, ParamType, u16, u16)>(256);
        let handler_id = {
            let ack_tx = ack_tx.clone();
            self.handlers.register(
                "22", // PARAM_VALUE
                std::sync::Arc::new(move |frame| {
                    if let MavMessage::ParamValue {
                        param_id,
                        param_value,
                        param_type,
                        param_count,
                        param_index,
                    } = &frame.message
                    {
                        let _ = ack_tx.try_send((
                            param_id.clone(),
                            *param_value,
                            *param_type,
                            *param_count,
                            *param_index,
                        ));
                    }
                }),
            )
        };

        let mut pending: HashMap<String, PendingGet> = HashMap::new();
        for name in &names {
            pending.insert(
                name.clone(),
                PendingGet {
                    retries_remaining: max_retries,
                    last_send: Instant::now() - resend_interval * 2,
                },
            );
        }

        let mut confirmed: HashMap<String, GetResult> = HashMap::new();
        let deadline = Instant::now() + timeout_total;
        let mut in_flight: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut ticker = interval(Duration::from_millis(50));

        loop {
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }

            while in_flight.len() < max_in_flight {
                let Some(name) = pending
                    .keys()
                    .find(|n| !in_flight.contains(n.as_str()))
                    .cloned()
                else {
                    break;
                };
                let entry = pending.get_mut(&name).unwrap();
                if entry.last_send.elapsed() >= resend_interval {
                    self.send(MavMessage::ParamRequestRead {
                        param_id: name.clone(),
                    })
                    .await
                    .ok();
                    entry.last_send = Instant::now();
                }
                in_flight.insert(name.clone());
            }

            tokio::select! {
                biased;
                ack = ack_rx.recv() => {
                    if let Some((name, value, param_type, count, index)) = ack {
                        if pending.remove(&name).is_some() {
                            confirmed.insert(
                                name.clone(),
                                GetResult { name: name.clone(), value, raw: value, param_type, count, index },
                            );
                            in_flight.remove(&name);
                        }
                    }
                }
                _ = ticker.tick() => {
                    let expired: Vec<String> = pending
                        .iter()
                        .filter(|(_, p)| p.last_send.elapsed() >= resend_interval)
                        .map(|(n, _)| n.clone())
                        .collect();
                    for name in expired {
                        let should_drop = {
                            let entry = pending.get_mut(&name).unwrap();
                            if entry.retries_remaining == 0 {
                                true
                            } else {
                                self.send(MavMessage::ParamRequestRead { param_id: name.clone() })
                                    .await
                                    .ok();
                                entry.retries_remaining -= 1;
                                entry.last_send = Instant::now();
                                false
                            }
                        };
                        if should_drop {
                            warn!("param {name} exhausted retries in get_params_bulk_lossy");
                            pending.remove(&name);
                            in_flight.remove(&name);
                        }
                    }
                }
            }
        }

        self.handlers.unregister(handler_id);
        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_tolerance_allows_rounding_noise() {
        assert!(values_match(
            ParamValue::Float(2.0),
            ParamValue::Float(2.0000001),
            ParamType::Real32
        ));
    }

    #[test]
    fn float_tolerance_rejects_large_deltas() {
        assert!(!values_match(
            ParamValue::Float(2.0),
            ParamValue::Float(2.1),
            ParamType::Real32
        ));
    }

    #[test]
    fn integer_compare_is_exact() {
        assert!(values_match(
            ParamValue::Int(2),
            ParamValue::Int(2),
            ParamType::Int32
        ));
        assert!(!values_match(
            ParamValue::Int(2),
            ParamValue::Int(3),
            ParamType::Int32
        ));
    }
}
