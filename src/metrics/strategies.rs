//! Extraction strategies, one per log dialect.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ExtractContext, ExtractStrategy, LogMetrics};

static LAYER_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Total\s+Frames\s*\|\s*Bitrate\s*Y-PSNR").expect("valid regex")
});

static POC_BITS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bPOC\b.*?\b([0-9]+)\s+bits\b").expect("valid regex"));

static POC_Y_BRACKETS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bPOC\b.*?\[.*?Y\s*([0-9]+(?:\.[0-9]+)?)\s*dB").expect("valid regex")
});

static POC_Y_PSNR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bPOC\b.*?(?:PSNR|PSNRY)\s*Y[:\s]*([0-9]+(?:\.[0-9]+)?)").expect("valid regex")
});

static GENERIC_BITRATE: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)Bitrate\s*\(kbps\)\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex"),
        Regex::new(r"(?i)bitrate\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)\s*kbps").expect("valid regex"),
    ]
});

static GENERIC_PSNR_Y: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)Y-?PSNR\s*\(dB\)\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex"),
        Regex::new(r"(?i)PSNR[-\s]*Y\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex"),
    ]
});

static TOTAL_TIME_ELAPSED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)Total\s+Time:\s*[0-9]+(?:\.[0-9]+)?\s*sec\.?\s*\[user\]\s*([0-9]+(?:\.[0-9]+)?)\s*sec\.?\s*\[elapsed\]",
    )
    .expect("valid regex")
});

static TOTAL_TIME_PLAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Total\s+Time:\s*([0-9]+(?:\.[0-9]+)?)\s*sec").expect("valid regex")
});

static FPS_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"_([0-9]{2,3})$").expect("valid regex"));

/// Frame rate from a sequence name's trailing `_NN` / `_NNN` suffix.
///
/// # Example
///
/// ```
/// use codec_ablate::metrics::infer_frame_rate;
///
/// assert_eq!(infer_frame_rate("BasketballDrive_1920x1080_50"), Some(50));
/// assert_eq!(infer_frame_rate("Campfire"), None);
/// ```
#[must_use]
pub fn infer_frame_rate(sequence: &str) -> Option<u32> {
    FPS_SUFFIX
        .captures(sequence)
        .and_then(|caps| caps[1].parse().ok())
        .filter(|fps| *fps > 0)
}

/// A plain decimal token. Rejects `inf`, `NaN` and the like.
fn numeric(token: &str) -> Option<f64> {
    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    token.parse().ok()
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<f64> {
    patterns
        .iter()
        .find_map(|re| re.captures(text).and_then(|caps| caps[1].parse().ok()))
}

fn mean_of(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// The per-layer summary table printed at the end of an encode.
///
/// The row after the header is `<frames> <slice-type> <bitrate> <Y> <U> <V> <YUV>`;
/// the slice-type letter is optional in some versions, so the first two adjacent
/// numeric tokens after the frame count are taken as bitrate and Y-PSNR.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryTable;

impl ExtractStrategy for SummaryTable {
    fn name(&self) -> &'static str {
        "summary_table"
    }

    fn try_extract(&self, text: &str, _ctx: &ExtractContext<'_>) -> Option<LogMetrics> {
        let header = LAYER_HEADER.find(text)?;
        let after_header = &text[header.end()..];
        let body = after_header
            .find('\n')
            .map_or("", |nl| &after_header[nl + 1..]);
        let row = body.lines().map(str::trim).find(|line| !line.is_empty())?;

        let tokens: Vec<&str> = row.split_whitespace().collect();
        let start = (1..tokens.len().saturating_sub(1))
            .find(|&i| numeric(tokens[i]).is_some() && numeric(tokens[i + 1]).is_some())?;

        let value = |offset: usize| tokens.get(start + offset).and_then(|t| numeric(t));
        Some(LogMetrics {
            bitrate_kbps: value(0),
            psnr_y: value(1),
            psnr_u: value(2),
            psnr_v: value(3).filter(|_| value(2).is_some()),
            psnr_yuv: value(4).filter(|_| value(2).is_some() && value(3).is_some()),
            encode_time_s: None,
        })
    }
}

/// Averages over per-frame (`POC ...`) report lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerFrameAverage;

impl ExtractStrategy for PerFrameAverage {
    fn name(&self) -> &'static str {
        "per_frame_average"
    }

    fn try_extract(&self, text: &str, ctx: &ExtractContext<'_>) -> Option<LogMetrics> {
        let capture_all = |re: &Regex| -> Vec<f64> {
            re.captures_iter(text)
                .filter_map(|caps| caps[1].parse().ok())
                .collect()
        };

        let mut psnr = capture_all(&POC_Y_BRACKETS);
        if psnr.is_empty() {
            psnr = capture_all(&POC_Y_PSNR);
        }
        let bits = capture_all(&POC_BITS);

        let psnr_y = mean_of(&psnr);
        let bitrate_kbps = mean_of(&bits).map(|b| b * f64::from(ctx.frame_rate()) / 1000.0);
        if psnr_y.is_none() && bitrate_kbps.is_none() {
            return None;
        }
        Some(LogMetrics {
            bitrate_kbps,
            psnr_y,
            ..LogMetrics::default()
        })
    }
}

/// Loose `Bitrate: nn kbps` / `Y-PSNR (dB): nn` text anywhere in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericText;

impl ExtractStrategy for GenericText {
    fn name(&self) -> &'static str {
        "generic_text"
    }

    fn try_extract(&self, text: &str, _ctx: &ExtractContext<'_>) -> Option<LogMetrics> {
        let bitrate_kbps = first_capture(GENERIC_BITRATE.as_slice(), text);
        let psnr_y = first_capture(GENERIC_PSNR_Y.as_slice(), text);
        if bitrate_kbps.is_none() && psnr_y.is_none() {
            return None;
        }
        Some(LogMetrics {
            bitrate_kbps,
            psnr_y,
            ..LogMetrics::default()
        })
    }
}

/// Encoder-reported run time from the `Total Time:` footer.
///
/// Prefers the elapsed (wall-clock) figure; older logs print only one value.
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalTime;

impl ExtractStrategy for TotalTime {
    fn name(&self) -> &'static str {
        "total_time"
    }

    fn try_extract(&self, text: &str, _ctx: &ExtractContext<'_>) -> Option<LogMetrics> {
        let seconds = first_capture(std::slice::from_ref(&*TOTAL_TIME_ELAPSED), text)
            .or_else(|| first_capture(std::slice::from_ref(&*TOTAL_TIME_PLAIN), text))?;
        Some(LogMetrics {
            encode_time_s: Some(seconds),
            ..LogMetrics::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExtractContext<'static> {
        ExtractContext::new("RaceHorses_416x240_30", 50)
    }

    #[test]
    fn test_summary_without_slice_letter() {
        let log = "Total Frames |   Bitrate     Y-PSNR\n\n     64     812.2500   34.9000\n";
        let m = SummaryTable.try_extract(log, &ctx()).unwrap();
        assert_eq!(m.bitrate_kbps, Some(812.25));
        assert_eq!(m.psnr_y, Some(34.9));
        assert_eq!(m.psnr_u, None);
    }

    #[test]
    fn test_summary_header_without_row() {
        let log = "Total Frames |   Bitrate     Y-PSNR    U-PSNR\n\n";
        assert!(SummaryTable.try_extract(log, &ctx()).is_none());
    }

    #[test]
    fn test_summary_rejects_non_numeric_row() {
        let log = "Total Frames | Bitrate Y-PSNR\n   64 a nan inf\n";
        assert!(SummaryTable.try_extract(log, &ctx()).is_none());
    }

    #[test]
    fn test_per_frame_alternate_psnr_form() {
        let log = "\
POC 0 TId: 0 ( I-SLICE, QP 32 ) 30000 bits PSNR Y: 36.00 U: 40.0
POC 1 TId: 1 ( B-SLICE, QP 33 ) 10000 bits PSNR Y: 35.00 U: 39.0
";
        let m = PerFrameAverage.try_extract(log, &ctx()).unwrap();
        assert_eq!(m.psnr_y, Some(35.5));
        // mean(20000 bits) * 30 fps / 1000
        assert_eq!(m.bitrate_kbps, Some(600.0));
    }

    #[test]
    fn test_per_frame_uses_default_fps() {
        let log = "POC 0 ( I-SLICE ) 4000 bits [Y 40.0 dB U 42.0 dB V 43.0 dB]\n";
        let m = PerFrameAverage
            .try_extract(log, &ExtractContext::new("Campfire", 25))
            .unwrap();
        assert_eq!(m.bitrate_kbps, Some(100.0));
        assert_eq!(m.psnr_y, Some(40.0));
    }

    #[test]
    fn test_generic_text() {
        let m = GenericText
            .try_extract("Avg. bitrate: 1523.75 kbps\nY-PSNR (dB): 36.4\n", &ctx())
            .unwrap();
        assert_eq!(m.bitrate_kbps, Some(1523.75));
        assert_eq!(m.psnr_y, Some(36.4));
        assert!(GenericText.try_extract("nothing here", &ctx()).is_none());
    }

    #[test]
    fn test_total_time_forms() {
        let elapsed = " Total Time:       21.337 sec. [user]       21.402 sec. [elapsed]\n";
        assert_eq!(
            TotalTime.try_extract(elapsed, &ctx()).unwrap().encode_time_s,
            Some(21.402)
        );
        let plain = " Total Time:   12.500 sec.\n";
        assert_eq!(
            TotalTime.try_extract(plain, &ctx()).unwrap().encode_time_s,
            Some(12.5)
        );
    }

    #[test]
    fn test_numeric_tokens() {
        assert_eq!(numeric("12.5"), Some(12.5));
        assert_eq!(numeric("-3"), Some(-3.0));
        assert_eq!(numeric("a"), None);
        assert_eq!(numeric("inf"), None);
        assert_eq!(numeric(""), None);
    }
}
