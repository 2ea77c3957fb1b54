//! Transfer planning and execution
//!
//! Resolves the configured transfer against the endpoints the device
//! actually exposes, generates payloads, and issues a single transfer
//! through the [`TrafficDevice`] seam.

use crate::config::TransferSettings;
use common::{
    Direction, EndpointInfo, Error, TrafficDevice, TransferKind, TransferRequest,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Payload pattern for OUT transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    /// Fresh random bytes every iteration
    #[default]
    Random,
    Zeros,
    /// Every byte carries the iteration number (wrapping)
    Counter,
}

/// Fills OUT buffers according to a [`Payload`] pattern
#[derive(Debug)]
pub struct PayloadGenerator {
    pattern: Payload,
    counter: u8,
}

impl PayloadGenerator {
    pub fn new(pattern: Payload) -> Self {
        Self {
            pattern,
            counter: 0,
        }
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        match self.pattern {
            Payload::Random => rand::rng().fill(buf),
            Payload::Zeros => buf.fill(0),
            Payload::Counter => {
                buf.fill(self.counter);
                self.counter = self.counter.wrapping_add(1);
            }
        }
    }
}

/// The resolved per-iteration work of the traffic loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub request: TransferRequest,
    /// Bytes per transfer
    pub length: usize,
    pub payload: Payload,
    /// IN transfer issued after every successful OUT transfer
    pub read_back: Option<TransferRequest>,
    pub interval: Duration,
    pub error_backoff: Duration,
}

impl TransferPlan {
    /// Resolve `settings` against the endpoints of the claimed interface
    ///
    /// An explicitly configured endpoint must exist on the interface;
    /// otherwise the first endpoint matching kind and direction is used.
    pub fn resolve(
        settings: &TransferSettings,
        endpoints: &[EndpointInfo],
        interface: u8,
    ) -> common::Result<Self> {
        let timeout = settings.timeout();
        let kind = settings.kind;
        let direction = settings.direction;

        let request = match kind {
            TransferKind::Control => {
                let mut control = settings.control;
                control.request_type = direction.apply_to(control.request_type);
                TransferRequest {
                    kind,
                    endpoint: 0,
                    control,
                    timeout,
                }
            }
            TransferKind::Bulk | TransferKind::Interrupt => {
                let endpoint = match settings.endpoint {
                    Some(configured) => {
                        let address = direction.apply_to(configured);
                        endpoints
                            .iter()
                            .find(|ep| ep.kind == kind && ep.address == address)
                            .map(|ep| ep.address)
                    }
                    None => find_endpoint(endpoints, kind, direction),
                };
                let endpoint = endpoint.ok_or(Error::NoEndpoint {
                    kind,
                    direction,
                    interface,
                })?;
                TransferRequest {
                    kind,
                    endpoint,
                    control: Default::default(),
                    timeout,
                }
            }
        };

        let read_back = if settings.read_back
            && kind != TransferKind::Control
            && direction == Direction::Out
        {
            find_endpoint(endpoints, kind, Direction::In).map(|endpoint| TransferRequest {
                kind,
                endpoint,
                control: Default::default(),
                timeout,
            })
        } else {
            None
        };

        Ok(Self {
            request,
            length: settings.length,
            payload: settings.payload,
            read_back,
            interval: settings.interval(),
            error_backoff: settings.error_backoff(),
        })
    }

    /// One-line description for the log pane
    pub fn describe(&self) -> String {
        let mut text = format!(
            "{} {} {} bytes",
            self.request.kind,
            describe_target(&self.request),
            self.length
        );
        if let Some(read_back) = &self.read_back {
            text.push_str(&format!(", read-back on {:#04x}", read_back.endpoint));
        }
        text
    }
}

impl fmt::Display for TransferPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

fn describe_target(request: &TransferRequest) -> String {
    match request.kind {
        TransferKind::Control => format!(
            "{} bmRequestType={:#04x} bRequest={:#04x}",
            request.direction(),
            request.control.request_type,
            request.control.request
        ),
        TransferKind::Bulk | TransferKind::Interrupt => {
            format!("{} {:#04x}", request.direction(), request.endpoint)
        }
    }
}

fn find_endpoint(
    endpoints: &[EndpointInfo],
    kind: TransferKind,
    direction: Direction,
) -> Option<u8> {
    endpoints
        .iter()
        .find(|ep| ep.kind == kind && ep.direction() == direction)
        .map(|ep| ep.address)
}

/// Outcome of one successful transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub direction: Direction,
    pub bytes: usize,
    pub elapsed: Duration,
}

/// Issue `request` once
///
/// OUT transfers send `buf`; IN transfers read into it. Timeouts and
/// failures come back as [`Error::TransferTimeout`] / [`Error::Transfer`].
pub fn issue(
    device: &mut dyn TrafficDevice,
    request: &TransferRequest,
    buf: &mut [u8],
) -> common::Result<Completed> {
    let direction = request.direction();
    let started = Instant::now();
    let result = match direction {
        Direction::Out => device.write(request, buf),
        Direction::In => device.read(request, buf),
    };
    let elapsed = started.elapsed();

    result
        .map(|bytes| Completed {
            direction,
            bytes,
            elapsed,
        })
        .map_err(|e| Error::from_transfer(request.endpoint, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockDevice, bulk_endpoints};

    fn settings() -> TransferSettings {
        TransferSettings::default()
    }

    #[test]
    fn test_resolve_first_bulk_out_with_read_back() {
        let plan = TransferPlan::resolve(&settings(), &bulk_endpoints(), 0).unwrap();
        assert_eq!(plan.request.kind, TransferKind::Bulk);
        assert_eq!(plan.request.endpoint, 0x01);
        assert_eq!(plan.request.timeout, Duration::from_millis(1000));
        assert_eq!(plan.length, 64);
        assert_eq!(plan.read_back.map(|r| r.endpoint), Some(0x81));
    }

    #[test]
    fn test_resolve_without_read_back() {
        let mut settings = settings();
        settings.read_back = false;
        let plan = TransferPlan::resolve(&settings, &bulk_endpoints(), 0).unwrap();
        assert!(plan.read_back.is_none());

        // No IN endpoint to pair with
        let out_only = vec![bulk_endpoints()[0]];
        let plan = TransferPlan::resolve(&TransferSettings::default(), &out_only, 0).unwrap();
        assert!(plan.read_back.is_none());
    }

    #[test]
    fn test_resolve_in_direction() {
        let mut settings = settings();
        settings.direction = Direction::In;
        let plan = TransferPlan::resolve(&settings, &bulk_endpoints(), 0).unwrap();
        assert_eq!(plan.request.endpoint, 0x81);
        assert_eq!(plan.request.direction(), Direction::In);
        assert!(plan.read_back.is_none());
    }

    #[test]
    fn test_resolve_explicit_endpoint() {
        let endpoints = vec![
            EndpointInfo {
                address: 0x01,
                kind: TransferKind::Bulk,
            },
            EndpointInfo {
                address: 0x02,
                kind: TransferKind::Bulk,
            },
        ];
        let mut settings = settings();
        settings.endpoint = Some(0x02);
        let plan = TransferPlan::resolve(&settings, &endpoints, 0).unwrap();
        assert_eq!(plan.request.endpoint, 0x02);

        settings.endpoint = Some(0x03);
        let err = TransferPlan::resolve(&settings, &endpoints, 0).unwrap_err();
        assert!(matches!(err, Error::NoEndpoint { .. }));
    }

    #[test]
    fn test_resolve_missing_kind() {
        let mut settings = settings();
        settings.kind = TransferKind::Interrupt;
        let err = TransferPlan::resolve(&settings, &bulk_endpoints(), 2).unwrap_err();
        match err {
            Error::NoEndpoint {
                kind,
                direction,
                interface,
            } => {
                assert_eq!(kind, TransferKind::Interrupt);
                assert_eq!(direction, Direction::Out);
                assert_eq!(interface, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_control_sets_direction_bit() {
        let mut settings = settings();
        settings.kind = TransferKind::Control;
        settings.direction = Direction::In;
        settings.control.request_type = 0x40;
        settings.control.request = 0x01;

        // Control transfers need no endpoints at all
        let plan = TransferPlan::resolve(&settings, &[], 0).unwrap();
        assert_eq!(plan.request.endpoint, 0);
        assert_eq!(plan.request.control.request_type, 0xc0);
        assert_eq!(plan.request.direction(), Direction::In);
        assert!(plan.read_back.is_none());
    }

    #[test]
    fn test_describe() {
        let plan = TransferPlan::resolve(&settings(), &bulk_endpoints(), 0).unwrap();
        assert_eq!(plan.describe(), "bulk OUT 0x01 64 bytes, read-back on 0x81");
    }

    #[test]
    fn test_payload_patterns() {
        let mut buf = [0xffu8; 8];
        PayloadGenerator::new(Payload::Zeros).fill(&mut buf);
        assert_eq!(buf, [0u8; 8]);

        let mut counter = PayloadGenerator::new(Payload::Counter);
        counter.fill(&mut buf);
        assert_eq!(buf, [0u8; 8]);
        counter.fill(&mut buf);
        assert_eq!(buf, [1u8; 8]);

        let mut random = PayloadGenerator::new(Payload::Random);
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        random.fill(&mut a);
        random.fill(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_issue_maps_errors() {
        let plan = TransferPlan::resolve(&settings(), &bulk_endpoints(), 0).unwrap();
        let mut device = MockDevice::new(vec![Err(rusb::Error::Timeout), Err(rusb::Error::Io)]);
        let mut buf = vec![0u8; plan.length];

        let err = issue(&mut device, &plan.request, &mut buf).unwrap_err();
        assert!(matches!(err, Error::TransferTimeout { endpoint: 0x01 }));

        let err = issue(&mut device, &plan.request, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                endpoint: 0x01,
                source: rusb::Error::Io
            }
        ));

        let done = issue(&mut device, &plan.request, &mut buf).unwrap();
        assert_eq!(done.bytes, 64);
        assert_eq!(done.direction, Direction::Out);
    }
}
