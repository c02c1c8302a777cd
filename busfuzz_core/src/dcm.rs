//! UDS/DCM diagnostic session driver.
//!
//! Requests are classic single frames `[len, SID, params..]` padded to 8
//! bytes, transmitted on the `src` arbitration ID; replies arrive on `dst`.
//! Multi-frame replies (DTC lists easily exceed 7 bytes) are assembled
//! best-effort: a flow control frame is sent after the first frame and
//! consecutive frames are collected until the announced length is reached.
//!
//! A request without a reply is never fatal, scans report "no response" and
//! move on.

use crate::error::{CanFuzzError, CanFuzzResult};
use crate::frame::{Direction, Frame, MAX_DATA_LEN};
use crate::session::Session;
use crate::traits::Transport;
use std::time::Instant;

/// Discovery probe: DiagnosticSessionControl(defaultSession) single frame.
pub const DISCOVERY_PROBE: [u8; 8] = [0x02, 0x10, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];

const NEGATIVE_RESPONSE: u8 = 0x7F;
const POSITIVE_OFFSET: u8 = 0x40;

/// negative response code: serviceNotSupported
pub const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;

const SID_READ_DTC_INFORMATION: u8 = 0x19;
const SID_CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;

/// The standard UDS service table probed by `dcm services`.
pub const UDS_SERVICES: &[(u8, &str)] = &[
    (0x10, "DIAGNOSTIC_SESSION_CONTROL"),
    (0x11, "ECU_RESET"),
    (0x14, "CLEAR_DIAGNOSTIC_INFORMATION"),
    (0x19, "READ_DTC_INFORMATION"),
    (0x22, "READ_DATA_BY_IDENTIFIER"),
    (0x23, "READ_MEMORY_BY_ADDRESS"),
    (0x24, "READ_SCALING_DATA_BY_IDENTIFIER"),
    (0x27, "SECURITY_ACCESS"),
    (0x28, "COMMUNICATION_CONTROL"),
    (0x2A, "READ_DATA_BY_PERIODIC_IDENTIFIER"),
    (0x2C, "DYNAMICALLY_DEFINE_DATA_IDENTIFIER"),
    (0x2E, "WRITE_DATA_BY_IDENTIFIER"),
    (0x2F, "INPUT_OUTPUT_CONTROL_BY_IDENTIFIER"),
    (0x31, "ROUTINE_CONTROL"),
    (0x34, "REQUEST_DOWNLOAD"),
    (0x35, "REQUEST_UPLOAD"),
    (0x36, "TRANSFER_DATA"),
    (0x37, "REQUEST_TRANSFER_EXIT"),
    (0x3D, "WRITE_MEMORY_BY_ADDRESS"),
    (0x3E, "TESTER_PRESENT"),
    (0x85, "CONTROL_DTC_SETTING"),
];

/// Looks up the name of a service identifier.
#[must_use]
pub fn service_name(sid: u8) -> &'static str {
    UDS_SERVICES
        .iter()
        .find(|(id, _)| *id == sid)
        .map_or("UNKNOWN_SERVICE", |(_, name)| name)
}

/// Human readable names for the common negative response codes.
#[must_use]
pub fn nrc_name(code: u8) -> &'static str {
    match code {
        0x10 => "generalReject",
        0x11 => "serviceNotSupported",
        0x12 => "subFunctionNotSupported",
        0x13 => "incorrectMessageLengthOrInvalidFormat",
        0x21 => "busyRepeatRequest",
        0x22 => "conditionsNotCorrect",
        0x24 => "requestSequenceError",
        0x31 => "requestOutOfRange",
        0x33 => "securityAccessDenied",
        0x35 => "invalidKey",
        0x36 => "exceededNumberOfAttempts",
        0x37 => "requiredTimeDelayNotExpired",
        0x78 => "requestCorrectlyReceivedResponsePending",
        0x7E => "subFunctionNotSupportedInActiveSession",
        0x7F => "serviceNotSupportedInActiveSession",
        _ => "unknownNegativeResponseCode",
    }
}

/// True for any plausible diagnostic reply to the discovery probe: a
/// positive session control echo or a negative response.
#[must_use]
pub fn is_diagnostic_response(frame: &Frame) -> bool {
    let data = frame.data();
    data.len() >= 2 && (data[1] == 0x10 + POSITIVE_OFFSET || data[1] == NEGATIVE_RESPONSE)
}

/// Outcome of one diagnostic request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Positive response; holds the full reply payload starting with the
    /// response SID.
    Positive(Vec<u8>),
    /// Negative response with the NRC.
    Negative(u8),
    /// Nothing came back within the configured timeout.
    NoResponse,
}

/// One stored diagnostic trouble code with its status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcRecord {
    bytes: [u8; 3],
    status: u8,
}

impl DtcRecord {
    /// The raw status byte reported next to the code.
    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }
}

impl std::fmt::Display for DtcRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let letter = ['P', 'C', 'B', 'U'][usize::from(self.bytes[0] >> 6)];
        write!(
            f,
            "{letter}{:01X}{:01X}{:02X}-{:02X}",
            (self.bytes[0] >> 4) & 0x3,
            self.bytes[0] & 0xF,
            self.bytes[1],
            self.bytes[2]
        )
    }
}

/// Stateful request/response driver against one `(src, dst)` ID pair. Alive
/// for a single command invocation.
pub struct DcmDriver<'a, T: Transport> {
    session: &'a mut Session<T>,
    src: u32,
    dst: u32,
}

impl<'a, T: Transport> DcmDriver<'a, T> {
    /// Creates a driver transmitting on `src` and expecting replies on `dst`.
    pub fn new(session: &'a mut Session<T>, src: u32, dst: u32) -> Self {
        Self { session, src, dst }
    }

    /// Sends one request and classifies the reply.
    /// # Errors
    pub async fn request(&mut self, service: u8, params: &[u8]) -> CanFuzzResult<ServiceOutcome> {
        if params.len() > MAX_DATA_LEN - 2 {
            return Err(CanFuzzError::Custom {
                err_msg: format!("request parameters of {} bytes need ISO-TP", params.len()),
            });
        }

        let mut data = vec![(params.len() + 1) as u8, service];
        data.extend_from_slice(params);
        data.resize(MAX_DATA_LEN, 0x00);
        let request = Frame::new(self.src, &data, Direction::Sent)?;

        self.session.drain().await?;
        self.session.send(&request).await?;

        let deadline = Instant::now() + self.session.config.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ServiceOutcome::NoResponse);
            }
            let Some(reply) = self.session.await_response(Some(self.dst), remaining).await? else {
                return Ok(ServiceOutcome::NoResponse);
            };
            let Some(payload) = self.assemble(&reply).await? else {
                continue;
            };

            if payload.len() >= 3 && payload[0] == NEGATIVE_RESPONSE && payload[1] == service {
                return Ok(ServiceOutcome::Negative(payload[2]));
            }
            if payload.first() == Some(&(service.wrapping_add(POSITIVE_OFFSET))) {
                return Ok(ServiceOutcome::Positive(payload));
            }
            // a reply to something else, keep waiting out the deadline
        }
    }

    /// Reassembles a reply payload from a single frame or, after answering
    /// with a flow control frame, from a first frame plus its consecutive
    /// frames. Returns `None` for frames that are not a response start.
    async fn assemble(&mut self, first: &Frame) -> CanFuzzResult<Option<Vec<u8>>> {
        let data = first.data();
        let Some(pci) = data.first() else {
            return Ok(None);
        };
        match pci >> 4 {
            // single frame
            0x0 => {
                let len = usize::from(pci & 0xF);
                if len == 0 || data.len() < len + 1 {
                    return Ok(None);
                }
                Ok(Some(data[1..=len].to_vec()))
            }
            // first frame of a multi frame reply
            0x1 => {
                if data.len() < 2 {
                    return Ok(None);
                }
                let total = (usize::from(pci & 0xF) << 8) | usize::from(data[1]);
                let mut payload = data[2..].to_vec();

                // clear to send, no block size limit, no separation time
                let flow_control = Frame::new(
                    self.src,
                    &[0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                    Direction::Sent,
                )?;
                self.session.send(&flow_control).await?;

                let deadline = Instant::now() + self.session.config.response_timeout;
                while payload.len() < total {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    let Some(frame) = self.session.await_response(Some(self.dst), remaining).await?
                    else {
                        break;
                    };
                    let frame_data = frame.data();
                    if frame_data.first().map(|b| b >> 4) == Some(0x2) {
                        payload.extend_from_slice(&frame_data[1..]);
                    }
                }
                if payload.len() < total {
                    tracing::warn!(
                        "truncated multi-frame reply: {} of {total} bytes",
                        payload.len()
                    );
                }
                payload.truncate(total);
                Ok(Some(payload))
            }
            _ => Ok(None),
        }
    }

    /// Probes every service of the known table and returns the supported
    /// ones. A service counts as supported on a positive response or any
    /// negative response other than serviceNotSupported.
    /// # Errors
    pub async fn services(&mut self) -> CanFuzzResult<Vec<(u8, &'static str)>> {
        let mut supported = Vec::new();
        for &(sid, name) in UDS_SERVICES {
            match self.request(sid, &[]).await? {
                ServiceOutcome::Positive(_) => {
                    tracing::info!("service {sid:#04x} {name}: supported");
                    supported.push((sid, name));
                }
                ServiceOutcome::Negative(NRC_SERVICE_NOT_SUPPORTED) => {
                    tracing::debug!("service {sid:#04x} {name}: not supported");
                }
                ServiceOutcome::Negative(nrc) => {
                    tracing::info!(
                        "service {sid:#04x} {name}: supported ({})",
                        nrc_name(nrc)
                    );
                    supported.push((sid, name));
                }
                ServiceOutcome::NoResponse => {
                    tracing::debug!("service {sid:#04x} {name}: no response");
                }
            }
        }
        Ok(supported)
    }

    /// Probes the given sub-function bytes of one service.
    /// # Errors
    pub async fn subfunc(
        &mut self,
        service: u8,
        subfuncs: &[u8],
        show: bool,
    ) -> CanFuzzResult<Vec<(u8, ServiceOutcome)>> {
        let mut outcomes = Vec::new();
        for &sub in subfuncs {
            let outcome = self.request(service, &[sub]).await?;
            match &outcome {
                ServiceOutcome::Positive(payload) => {
                    if show {
                        tracing::info!(
                            "sub-function {sub:#04x}: positive, data {}",
                            hex::encode_upper(&payload[1..])
                        );
                    } else {
                        tracing::info!("sub-function {sub:#04x}: positive");
                    }
                }
                ServiceOutcome::Negative(nrc) => {
                    tracing::info!("sub-function {sub:#04x}: negative ({})", nrc_name(*nrc));
                }
                ServiceOutcome::NoResponse => {
                    tracing::info!("sub-function {sub:#04x}: no response");
                }
            }
            outcomes.push((sub, outcome));
        }
        Ok(outcomes)
    }

    /// Reads the stored DTCs; with `clear` the clear service is issued
    /// strictly after the read so the operator has a record of the codes
    /// before they are erased.
    /// # Errors
    pub async fn dtc(&mut self, clear: bool) -> CanFuzzResult<Vec<DtcRecord>> {
        let records = match self
            .request(SID_READ_DTC_INFORMATION, &[REPORT_DTC_BY_STATUS_MASK, 0xFF])
            .await?
        {
            ServiceOutcome::Positive(payload) => {
                let mut records = Vec::new();
                // [0x59, reportType, statusAvailabilityMask, (dtc3, status)*]
                for chunk in payload.get(3..).unwrap_or_default().chunks_exact(4) {
                    let record = DtcRecord {
                        bytes: [chunk[0], chunk[1], chunk[2]],
                        status: chunk[3],
                    };
                    tracing::info!("DTC {record} (status {:#04x})", record.status);
                    records.push(record);
                }
                if records.is_empty() {
                    tracing::info!("no stored DTCs");
                }
                records
            }
            ServiceOutcome::Negative(nrc) => {
                tracing::info!("DTC read denied ({})", nrc_name(nrc));
                Vec::new()
            }
            ServiceOutcome::NoResponse => {
                tracing::info!("DTC read: no response");
                Vec::new()
            }
        };

        if clear {
            match self
                .request(SID_CLEAR_DIAGNOSTIC_INFORMATION, &[0xFF, 0xFF, 0xFF])
                .await?
            {
                ServiceOutcome::Positive(_) => tracing::info!("DTCs cleared"),
                ServiceOutcome::Negative(nrc) => {
                    tracing::info!("DTC clear denied ({})", nrc_name(nrc));
                }
                ServiceOutcome::NoResponse => tracing::info!("DTC clear: no response"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockTransport, mock_session, rx_frame};

    const SRC: u32 = 0x7DF;
    const DST: u32 = 0x7E8;

    #[tokio::test]
    async fn services_classifies_by_response_kind() {
        let transport = MockTransport::with_responder(|request| {
            let sid = request.data()[1];
            match sid {
                // positive echo
                0x10 => vec![rx_frame(DST, &[0x02, 0x50, 0x01, 0, 0, 0, 0, 0])],
                // supported but denied
                0x27 => vec![rx_frame(DST, &[0x03, 0x7F, 0x27, 0x33, 0, 0, 0, 0])],
                // explicitly not supported
                0x22 => vec![rx_frame(DST, &[0x03, 0x7F, 0x22, 0x11, 0, 0, 0, 0])],
                _ => Vec::new(),
            }
        });
        let (mut session, path) = mock_session("dcm-services", transport);

        let supported = DcmDriver::new(&mut session, SRC, DST)
            .services()
            .await
            .expect("services");
        let sids: Vec<u8> = supported.iter().map(|(sid, _)| *sid).collect();
        assert_eq!(sids, vec![0x10, 0x27]);
        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn dtc_read_only_issues_no_clear() {
        let transport = MockTransport::with_responder(|request| {
            match request.data()[1] {
                0x19 => vec![rx_frame(
                    DST,
                    // one stored code: P0123-45, status 0x2F
                    &[0x07, 0x59, 0x02, 0xFF, 0x01, 0x23, 0x45, 0x2F],
                )],
                0x14 => vec![rx_frame(DST, &[0x04, 0x54, 0xFF, 0xFF, 0xFF, 0, 0, 0])],
                _ => Vec::new(),
            }
        });
        let (mut session, path) = mock_session("dcm-dtc-read", transport);

        let records = DcmDriver::new(&mut session, SRC, DST)
            .dtc(false)
            .await
            .expect("dtc");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_string(), "P0123-45");
        assert_eq!(records[0].status(), 0x2F);

        let requested: Vec<u8> = session.transport.sent.iter().map(|f| f.data()[1]).collect();
        assert_eq!(requested, vec![0x19]);
        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn dtc_clear_runs_read_first() {
        let transport = MockTransport::with_responder(|request| match request.data()[1] {
            0x19 => vec![rx_frame(DST, &[0x03, 0x59, 0x02, 0xFF, 0, 0, 0, 0])],
            0x14 => vec![rx_frame(DST, &[0x01, 0x54, 0, 0, 0, 0, 0, 0])],
            _ => Vec::new(),
        });
        let (mut session, path) = mock_session("dcm-dtc-clear", transport);

        DcmDriver::new(&mut session, SRC, DST)
            .dtc(true)
            .await
            .expect("dtc");
        let requested: Vec<u8> = session.transport.sent.iter().map(|f| f.data()[1]).collect();
        assert_eq!(requested, vec![0x19, 0x14]);
        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn assembles_multi_frame_replies() {
        let transport = MockTransport::with_responder(|request| {
            match request.data()[0] >> 4 {
                // the request: answer with a first frame announcing 10 bytes
                0x0 => vec![rx_frame(DST, &[0x10, 0x0A, 0x59, 0x02, 0xFF, 0x01, 0x23, 0x45])],
                // the flow control: deliver the consecutive frame
                0x3 => vec![rx_frame(DST, &[0x21, 0x2F, 0x11, 0x22, 0x33, 0x44, 0, 0])],
                _ => Vec::new(),
            }
        });
        let (mut session, path) = mock_session("dcm-multiframe", transport);

        let records = DcmDriver::new(&mut session, SRC, DST)
            .dtc(false)
            .await
            .expect("dtc");
        // 10 byte payload: 59 02 FF (01 23 45 2F) (11 22 33 ...) -> one full record + truncated tail
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_string(), "P0123-45");
        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn no_response_is_not_fatal() {
        let (mut session, path) = mock_session("dcm-noresp", MockTransport::new());
        let outcome = DcmDriver::new(&mut session, SRC, DST)
            .request(0x3E, &[0x00])
            .await
            .expect("request");
        assert_eq!(outcome, ServiceOutcome::NoResponse);
        std::fs::remove_file(path).expect("cleanup");
    }
}
