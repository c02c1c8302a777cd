//! Length attack: sweeps DLC values against one or more target IDs with
//! patterned payloads, optionally mismatching payload length and DLC.
//! Classic CAN only, DLC 0 to 8.

use crate::error::{CanFuzzError, CanFuzzResult};
use crate::frame::{ARB_ID_MAX_STANDARD, Direction, Frame, MAX_DATA_LEN};
use crate::mutator::Mutator;
use crate::session::Session;
use crate::traits::Transport;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// How the payload bytes of each attack frame are built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadPattern {
    /// Uniformly random bytes.
    Random,
    /// All `0x00`.
    Zeros,
    /// All `0xFF`.
    Ffs,
    /// All `0xAA`.
    Aa,
    /// All `0x55`.
    FiftyFive,
    /// Incrementing bytes from the configured start byte.
    Incremental,
    /// The given bytes, repeated or cut to length.
    Custom(Vec<u8>),
}

impl std::str::FromStr for PayloadPattern {
    type Err = CanFuzzError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.to_ascii_lowercase().as_str() {
            "rand" => Ok(Self::Random),
            "zeros" => Ok(Self::Zeros),
            "ffs" => Ok(Self::Ffs),
            "aa" => Ok(Self::Aa),
            "55" => Ok(Self::FiftyFive),
            "inc" => Ok(Self::Incremental),
            other => {
                if let Some(hex_part) = other.strip_prefix("custom:") {
                    let digits: String = hex_part.chars().filter(|c| *c != ' ').collect();
                    let bytes = hex::decode(&digits).map_err(|_| CanFuzzError::Custom {
                        err_msg: format!("custom pattern `{hex_part}` is not valid hex"),
                    })?;
                    if bytes.is_empty() {
                        return Err(CanFuzzError::Custom {
                            err_msg: "custom pattern must hold at least one byte".to_owned(),
                        });
                    }
                    Ok(Self::Custom(bytes))
                } else {
                    Err(CanFuzzError::Custom {
                        err_msg: format!(
                            "unknown pattern `{other}`, expected rand|zeros|ffs|aa|55|inc|custom:<hex>"
                        ),
                    })
                }
            }
        }
    }
}

impl PayloadPattern {
    /// Builds a payload of the requested length.
    pub fn generate<R: Rng>(
        &self,
        mutator: &mut Mutator<R>,
        len: usize,
        start_byte: u8,
    ) -> Vec<u8> {
        match self {
            Self::Random => mutator.random_payload(len, len),
            Self::Zeros => vec![0x00; len],
            Self::Ffs => vec![0xFF; len],
            Self::Aa => vec![0xAA; len],
            Self::FiftyFive => vec![0x55; len],
            Self::Incremental => (0..len)
                .map(|i| start_byte.wrapping_add(i as u8))
                .collect(),
            Self::Custom(bytes) => bytes.iter().copied().cycle().take(len).collect(),
        }
    }
}

/// Settings for one length attack run.
#[derive(Debug, Clone)]
pub struct LenAttackOpts {
    /// Arbitration IDs under attack.
    pub targets: Vec<u32>,
    /// First DLC value of the sweep.
    pub min_dlc: u8,
    /// Last DLC value of the sweep, capped at 8.
    pub max_dlc: u8,
    /// Probability of sending a payload whose length does not match the
    /// swept DLC.
    pub mismatch_prob: f64,
    /// Payload construction.
    pub pattern: PayloadPattern,
    /// Pause between sends.
    pub interval: Duration,
    /// Frames per DLC step.
    pub bursts: u32,
    /// Repeat the sweep until interrupted.
    pub repeat: bool,
    /// First byte of the `inc` pattern.
    pub start_byte: u8,
}

/// Parses target tokens: plain IDs, `0x100-0x1ff` ranges and `any` (the
/// whole standard 11 bit space). Duplicates are removed, first occurrence
/// wins.
/// # Errors
pub fn parse_targets(tokens: &[String]) -> CanFuzzResult<Vec<u32>> {
    let mut out = Vec::new();
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.eq_ignore_ascii_case("any") {
            out.extend(0..=ARB_ID_MAX_STANDARD);
            continue;
        }
        if let Some((a, b)) = token.split_once('-') {
            let start = crate::codec::parse_number(a)?;
            let end = crate::codec::parse_number(b)?;
            if start > end {
                return Err(CanFuzzError::Custom {
                    err_msg: format!("invalid target range `{token}`"),
                });
            }
            out.extend(start..=end);
            continue;
        }
        out.push(crate::codec::parse_number(token)?);
    }

    let mut seen = std::collections::HashSet::new();
    out.retain(|id| seen.insert(*id));
    Ok(out)
}

/// Runs the sweep. Every send is reported as `[SUCCESS]` or `[FAIL]` as it
/// happens and appended to the session log; a failed send never aborts the
/// run. Returns the number of frames transmitted.
/// # Errors
pub async fn run<T: Transport, R: Rng>(
    session: &mut Session<T>,
    mutator: &mut Mutator<R>,
    opts: &LenAttackOpts,
    stop: &AtomicBool,
) -> CanFuzzResult<u64> {
    let min_dlc = opts.min_dlc.min(MAX_DATA_LEN as u8);
    let max_dlc = opts.max_dlc.min(MAX_DATA_LEN as u8);
    let mut sent = 0u64;

    'sweep: loop {
        for &arb_id in &opts.targets {
            for dlc in min_dlc..=max_dlc {
                if stop.load(Ordering::Relaxed) {
                    break 'sweep;
                }
                let canonical_len = usize::from(dlc);

                let payload_len = if mutator.gen_chance(opts.mismatch_prob) {
                    let candidate = mutator.gen_range(0, MAX_DATA_LEN + 1);
                    if candidate == canonical_len {
                        (candidate + 1) % (MAX_DATA_LEN + 1)
                    } else {
                        candidate
                    }
                } else {
                    canonical_len
                };

                let payload = opts.pattern.generate(mutator, payload_len, opts.start_byte);

                for _ in 0..opts.bursts {
                    let frame = Frame::new(arb_id, &payload, Direction::Sent)?;
                    match session.send(&frame).await {
                        Ok(()) => {
                            sent += 1;
                            tracing::info!(
                                "[SUCCESS] SEND ID={arb_id:#X} DLC={dlc} LEN={} DATA={}",
                                payload.len(),
                                hex::encode(&payload)
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                "[FAIL] SEND ID={arb_id:#X} DLC={dlc} LEN={} ({err})",
                                payload.len()
                            );
                        }
                    }
                    sleep(opts.interval).await;
                }
            }
        }
        if !opts.repeat {
            break;
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockTransport, mock_session};

    #[test]
    fn patterns_build_expected_payloads() {
        let mut mutator = Mutator::from_seed(0);
        assert_eq!(
            PayloadPattern::Zeros.generate(&mut mutator, 3, 0),
            vec![0, 0, 0]
        );
        assert_eq!(
            PayloadPattern::Ffs.generate(&mut mutator, 2, 0),
            vec![0xFF, 0xFF]
        );
        assert_eq!(
            PayloadPattern::Incremental.generate(&mut mutator, 4, 0xFE),
            vec![0xFE, 0xFF, 0x00, 0x01]
        );
        assert_eq!(
            PayloadPattern::Custom(vec![0xDE, 0xAD]).generate(&mut mutator, 5, 0),
            vec![0xDE, 0xAD, 0xDE, 0xAD, 0xDE]
        );
        assert!(PayloadPattern::Random.generate(&mut mutator, 6, 0).len() == 6);
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!("inc".parse::<PayloadPattern>().expect("parses"), PayloadPattern::Incremental);
        assert_eq!(
            "custom:dead beef".parse::<PayloadPattern>().expect("parses"),
            PayloadPattern::Custom(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert!("custom:".parse::<PayloadPattern>().is_err());
        assert!("bogus".parse::<PayloadPattern>().is_err());
    }

    #[test]
    fn target_parsing_handles_ranges_any_and_duplicates() {
        let targets = parse_targets(&[
            "0x123".to_owned(),
            "0x100-0x102".to_owned(),
            "291".to_owned(),
        ])
        .expect("parses");
        assert_eq!(targets, vec![0x123, 0x100, 0x101, 0x102]);

        let all = parse_targets(&["any".to_owned()]).expect("parses");
        assert_eq!(all.len(), 0x800);

        assert!(parse_targets(&["0x200-0x100".to_owned()]).is_err());
    }

    #[tokio::test]
    async fn sweep_covers_every_dlc_once() {
        let (mut session, path) = mock_session("lenattack", MockTransport::new());
        let mut mutator = Mutator::from_seed(3);
        let opts = LenAttackOpts {
            targets: vec![0x123],
            min_dlc: 0,
            max_dlc: 8,
            mismatch_prob: 0.0,
            pattern: PayloadPattern::Incremental,
            interval: Duration::ZERO,
            bursts: 1,
            repeat: false,
            start_byte: 0,
        };
        let stop = AtomicBool::new(false);
        let sent = run(&mut session, &mut mutator, &opts, &stop)
            .await
            .expect("run");
        assert_eq!(sent, 9);

        let lens: Vec<usize> = session.transport.sent.iter().map(|f| f.data().len()).collect();
        assert_eq!(lens, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
        std::fs::remove_file(path).expect("cleanup");
    }
}
