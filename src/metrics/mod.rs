//! Rate and quality metrics recovered from encoder logs.
//!
//! Encoder log formats drift between versions, so extraction runs an ordered
//! cascade of [`ExtractStrategy`] implementations. For every field the first
//! strategy that produces a value wins; later strategies only fill gaps.
//!
//! | Strategy | Source |
//! |----------|--------|
//! | [`SummaryTable`] | `Total Frames \| Bitrate Y-PSNR ...` summary row |
//! | [`PerFrameAverage`] | per-POC `bits` and `[Y nn dB` lines |
//! | [`GenericText`] | loose `Bitrate: nn kbps` / `Y-PSNR: nn` text |
//! | [`TotalTime`] | `Total Time: ... [elapsed]` footer |
//!
//! A field no strategy can recover stays `None`. Unknown is never zero.

mod strategies;

use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use strategies::{GenericText, PerFrameAverage, SummaryTable, TotalTime, infer_frame_rate};

/// Line the encoder prints once an encode has finished.
pub const TERMINAL_MARKER: &str = "Total Time:";

/// Metrics recovered from one encoder log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LogMetrics {
    /// Average bitrate in kbps.
    pub bitrate_kbps: Option<f64>,
    /// Luma PSNR in dB.
    pub psnr_y: Option<f64>,
    /// Cb PSNR in dB.
    pub psnr_u: Option<f64>,
    /// Cr PSNR in dB.
    pub psnr_v: Option<f64>,
    /// Combined YUV PSNR in dB.
    pub psnr_yuv: Option<f64>,
    /// Encoder-reported elapsed time in seconds.
    pub encode_time_s: Option<f64>,
}

impl LogMetrics {
    /// Fill every unknown field from `other`.
    pub fn fill_from(&mut self, other: &LogMetrics) {
        self.bitrate_kbps = self.bitrate_kbps.or(other.bitrate_kbps);
        self.psnr_y = self.psnr_y.or(other.psnr_y);
        self.psnr_u = self.psnr_u.or(other.psnr_u);
        self.psnr_v = self.psnr_v.or(other.psnr_v);
        self.psnr_yuv = self.psnr_yuv.or(other.psnr_yuv);
        self.encode_time_s = self.encode_time_s.or(other.encode_time_s);
    }

    /// Whether the log yielded a usable rate-distortion point.
    #[must_use]
    pub fn has_rd_point(&self) -> bool {
        self.bitrate_kbps.is_some() && self.psnr_y.is_some()
    }

    /// Whether every field is known.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.has_rd_point()
            && self.psnr_u.is_some()
            && self.psnr_v.is_some()
            && self.psnr_yuv.is_some()
            && self.encode_time_s.is_some()
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Information about the job a log belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    /// Sequence name, used to infer the frame rate from a `_NN` suffix.
    pub sequence: &'a str,
    /// Frame rate to use when the name carries none.
    pub fps_default: u32,
}

impl<'a> ExtractContext<'a> {
    /// Create a context.
    #[must_use]
    pub fn new(sequence: &'a str, fps_default: u32) -> Self {
        Self {
            sequence,
            fps_default,
        }
    }

    /// Frame rate for bitrate derivation.
    #[must_use]
    pub fn frame_rate(&self) -> u32 {
        infer_frame_rate(self.sequence).unwrap_or(self.fps_default)
    }
}

/// One way of reading metrics out of a log.
pub trait ExtractStrategy: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Extract whatever fields this strategy understands.
    ///
    /// Returns `None` when the log holds nothing this strategy recognises.
    fn try_extract(&self, text: &str, ctx: &ExtractContext<'_>) -> Option<LogMetrics>;
}

/// Ordered cascade of extraction strategies.
pub struct MetricExtractor {
    strategies: Vec<Box<dyn ExtractStrategy>>,
}

impl Default for MetricExtractor {
    fn default() -> Self {
        Self::new(vec![
            Box::new(SummaryTable),
            Box::new(PerFrameAverage),
            Box::new(GenericText),
            Box::new(TotalTime),
        ])
    }
}

impl std::fmt::Debug for MetricExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.strategies.iter().map(|s| s.name()))
            .finish()
    }
}

impl MetricExtractor {
    /// Build an extractor from an explicit strategy order.
    #[must_use]
    pub fn new(strategies: Vec<Box<dyn ExtractStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run the cascade over decoded log text.
    #[must_use]
    pub fn extract(&self, text: &str, ctx: &ExtractContext<'_>) -> LogMetrics {
        let mut metrics = LogMetrics::default();
        for strategy in &self.strategies {
            if metrics.is_complete() {
                break;
            }
            if let Some(found) = strategy.try_extract(text, ctx) {
                if !found.is_empty() {
                    debug!(strategy = strategy.name(), sequence = ctx.sequence, "strategy matched");
                }
                metrics.fill_from(&found);
            }
        }
        metrics
    }

    /// Read, decode and extract a log file.
    ///
    /// A missing or unreadable file yields all-unknown metrics.
    #[must_use]
    pub fn extract_file(&self, path: &Path, ctx: &ExtractContext<'_>) -> LogMetrics {
        match std::fs::read(path) {
            Ok(bytes) => self.extract(&decode_log_bytes(&bytes), ctx),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "log file missing");
                LogMetrics::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read log file");
                LogMetrics::default()
            }
        }
    }
}

/// How many leading bytes the UTF-16 sniffing looks at.
const SNIFF_LEN: usize = 512;

/// Decode raw log bytes to text.
///
/// UTF-16 is detected from a byte-order mark, or (for little-endian logs
/// written without one) from NUL bytes at odd offsets. Everything else is
/// decoded as UTF-8. Undecodable sequences become U+FFFD.
///
/// # Example
///
/// ```
/// use codec_ablate::metrics::decode_log_bytes;
///
/// assert_eq!(decode_log_bytes(b"POC 0"), "POC 0");
/// assert_eq!(decode_log_bytes(&[0xFF, 0xFE, b'O', 0, b'K', 0]), "OK");
/// assert_eq!(decode_log_bytes(&[b'O', 0, b'K', 0]), "OK");
/// ```
#[must_use]
pub fn decode_log_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if looks_like_utf16le(bytes) {
        return decode_utf16(bytes, u16::from_le_bytes);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    if head.len() < 2 {
        return false;
    }
    let pairs = head.len() / 2;
    let odd_nuls = head.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    let even_nuls = head.iter().step_by(2).filter(|b| **b == 0).count();
    odd_nuls * 2 >= pairs && even_nuls * 4 < pairs
}

fn decode_utf16(bytes: &[u8], to_unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| to_unit([pair[0], pair[1]]));
    let mut text: String = char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    if bytes.len() % 2 == 1 {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    text
}
