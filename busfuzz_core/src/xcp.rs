//! XCP driver: slave discovery, connection info and memory dump over XCP on
//! CAN framing.
//!
//! Commands go out on `src`, replies come back on `dst`. Replies start with
//! `0xFF` (positive) or `0xFE` (error); other packet types (events, service
//! requests) are skipped while waiting. The dump loop uses `SHORT_UPLOAD`
//! so every request carries its own address: when a reply returns fewer
//! bytes than asked for, the loop simply re-requests the remainder at the
//! advanced address.

use crate::error::{CanFuzzError, CanFuzzResult};
use crate::frame::{Direction, Frame};
use crate::session::Session;
use crate::traits::Transport;
use std::time::Instant;

/// Intel-hex encoding of dumped memory.
pub mod ihex;

const CMD_CONNECT: u8 = 0xFF;
const CMD_GET_STATUS: u8 = 0xFD;
const CMD_GET_COMM_MODE_INFO: u8 = 0xFB;
const CMD_SHORT_UPLOAD: u8 = 0xF4;

const PID_RESPONSE: u8 = 0xFF;
const PID_ERROR: u8 = 0xFE;

/// Discovery probe: an XCP CONNECT command in normal mode.
pub const DISCOVERY_PROBE: [u8; 2] = [CMD_CONNECT, 0x00];

/// How often a failed upload request is retried before the dump aborts.
const UPLOAD_RETRIES: u32 = 3;

/// True for any XCP reply packet, positive or error.
#[must_use]
pub fn is_xcp_response(frame: &Frame) -> bool {
    matches!(frame.data().first(), Some(&PID_RESPONSE | &PID_ERROR))
}

/// The slave parameters reported by a CONNECT reply.
#[derive(Debug, Clone, Copy)]
pub struct SlaveInfo {
    /// Resource availability bits (CAL/PAG, DAQ, STIM, PGM).
    pub resources: u8,
    /// COMM_MODE_BASIC bits; bit 0 selects most-significant-byte-first.
    pub comm_mode_basic: u8,
    /// Maximum command transfer object size in bytes.
    pub max_cto: u8,
    /// Maximum data transfer object size in bytes.
    pub max_dto: u16,
    /// XCP protocol layer version.
    pub protocol_version: u8,
    /// XCP transport layer version.
    pub transport_version: u8,
}

impl SlaveInfo {
    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 || payload[0] != PID_RESPONSE {
            return None;
        }
        let comm_mode_basic = payload[2];
        let max_dto = if comm_mode_basic & 0x01 == 0 {
            u16::from_le_bytes([payload[4], payload[5]])
        } else {
            u16::from_be_bytes([payload[4], payload[5]])
        };
        Some(Self {
            resources: payload[1],
            comm_mode_basic,
            max_cto: payload[3],
            max_dto,
            protocol_version: payload[6],
            transport_version: payload[7],
        })
    }

    /// Whether multi-byte fields use big-endian byte order.
    #[must_use]
    pub fn msb_first(&self) -> bool {
        self.comm_mode_basic & 0x01 != 0
    }

    fn describe_resources(&self) -> String {
        let mut parts = Vec::new();
        for (bit, name) in [(0x01, "CAL/PAG"), (0x04, "DAQ"), (0x08, "STIM"), (0x10, "PGM")] {
            if self.resources & bit != 0 {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            "none".to_owned()
        } else {
            parts.join(", ")
        }
    }
}

/// Stateful XCP request/response driver against one `(src, dst)` pair.
pub struct XcpDriver<'a, T: Transport> {
    session: &'a mut Session<T>,
    src: u32,
    dst: u32,
}

impl<'a, T: Transport> XcpDriver<'a, T> {
    /// Creates a driver transmitting on `src` and expecting replies on `dst`.
    pub fn new(session: &'a mut Session<T>, src: u32, dst: u32) -> Self {
        Self { session, src, dst }
    }

    /// Sends one command and returns the next reply packet from the slave,
    /// or `None` on timeout.
    /// # Errors
    async fn command(&mut self, data: &[u8]) -> CanFuzzResult<Option<Vec<u8>>> {
        let request = Frame::new(self.src, data, Direction::Sent)?;
        self.session.drain().await?;
        self.session.send(&request).await?;

        let deadline = Instant::now() + self.session.config.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(reply) = self.session.await_response(Some(self.dst), remaining).await? else {
                return Ok(None);
            };
            if is_xcp_response(&reply) {
                return Ok(Some(reply.data().to_vec()));
            }
            // event or service packet, keep waiting
        }
    }

    /// Issues CONNECT and decodes the slave parameters.
    /// # Errors
    pub async fn connect(&mut self) -> CanFuzzResult<Option<SlaveInfo>> {
        match self.command(&DISCOVERY_PROBE).await? {
            Some(payload) => {
                if payload.first() == Some(&PID_ERROR) {
                    tracing::info!(
                        "CONNECT rejected, error {:#04x}",
                        payload.get(1).copied().unwrap_or_default()
                    );
                    return Ok(None);
                }
                let Some(info) = SlaveInfo::parse(&payload) else {
                    tracing::warn!("short CONNECT reply: {}", hex::encode_upper(&payload));
                    return Ok(None);
                };
                tracing::info!(
                    "connected: resources [{}], MAX_CTO {}, MAX_DTO {}, {} endian",
                    info.describe_resources(),
                    info.max_cto,
                    info.max_dto,
                    if info.msb_first() { "big" } else { "little" }
                );
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// Reports resource and protection information: CONNECT, then
    /// GET_STATUS and GET_COMM_MODE_INFO.
    /// # Errors
    pub async fn info(&mut self) -> CanFuzzResult<()> {
        let Some(info) = self.connect().await? else {
            tracing::info!("no XCP slave answered on {:#06x}", self.dst);
            return Ok(());
        };

        match self.command(&[CMD_GET_STATUS]).await? {
            Some(payload) if payload.first() == Some(&PID_RESPONSE) && payload.len() >= 3 => {
                let protection = payload[2];
                tracing::info!(
                    "session status {:#04x}, protected resources {:#04x}",
                    payload[1],
                    protection
                );
                if protection & info.resources != 0 {
                    tracing::info!("some resources need a seed/key unlock");
                }
            }
            Some(payload) => tracing::info!(
                "GET_STATUS error {:#04x}",
                payload.get(1).copied().unwrap_or_default()
            ),
            None => tracing::info!("GET_STATUS: no response"),
        }

        match self.command(&[CMD_GET_COMM_MODE_INFO]).await? {
            Some(payload) if payload.first() == Some(&PID_RESPONSE) && payload.len() >= 8 => {
                tracing::info!(
                    "comm mode optional {:#04x}, MAX_BS {}, MIN_ST {}, queue size {}, driver version {:#04x}",
                    payload[2],
                    payload[4],
                    payload[5],
                    payload[6],
                    payload[7]
                );
            }
            Some(payload) => tracing::info!(
                "GET_COMM_MODE_INFO error {:#04x}",
                payload.get(1).copied().unwrap_or_default()
            ),
            None => tracing::info!("GET_COMM_MODE_INFO: no response"),
        }
        Ok(())
    }

    /// Dumps `length` bytes starting at `start` via repeated SHORT_UPLOAD
    /// requests, each bounded by the negotiated MAX_CTO.
    /// # Errors
    pub async fn dump(&mut self, start: u32, length: u32) -> CanFuzzResult<Vec<u8>> {
        let Some(info) = self.connect().await? else {
            return Err(CanFuzzError::Custom {
                err_msg: format!("no XCP slave answered on {:#06x}", self.dst),
            });
        };

        let chunk_limit = usize::from(info.max_cto.saturating_sub(1)).min(7);
        if chunk_limit == 0 {
            return Err(CanFuzzError::Custom {
                err_msg: format!("MAX_CTO {} leaves no room for data", info.max_cto),
            });
        }

        let total = length as usize;
        let mut out = Vec::with_capacity(total);
        let mut address = start;
        let mut retries = 0;
        let mut last_report = 0usize;

        while out.len() < total {
            let want = (total - out.len()).min(chunk_limit);
            let mut command = vec![CMD_SHORT_UPLOAD, want as u8, 0x00, 0x00];
            if info.msb_first() {
                command.extend_from_slice(&address.to_be_bytes());
            } else {
                command.extend_from_slice(&address.to_le_bytes());
            }

            match self.command(&command).await? {
                Some(payload) if payload.first() == Some(&PID_RESPONSE) && payload.len() > 1 => {
                    let got = &payload[1..payload.len().min(want + 1)];
                    out.extend_from_slice(got);
                    address = address.wrapping_add(got.len() as u32);
                    retries = 0;
                }
                Some(payload) if payload.first() == Some(&PID_ERROR) => {
                    return Err(CanFuzzError::Custom {
                        err_msg: format!(
                            "upload denied at {address:#010x}, XCP error {:#04x}",
                            payload.get(1).copied().unwrap_or_default()
                        ),
                    });
                }
                _ => {
                    retries += 1;
                    if retries > UPLOAD_RETRIES {
                        return Err(CanFuzzError::Custom {
                            err_msg: format!("no reply at {address:#010x} after {UPLOAD_RETRIES} retries"),
                        });
                    }
                    continue;
                }
            }

            if out.len() - last_report >= 0x400 || out.len() == total {
                tracing::info!("dumped {} of {total} bytes", out.len());
                last_report = out.len();
            }
        }
        Ok(out)
    }
}
