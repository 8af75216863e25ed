//! Two-pass EBU R128 loudness normalization through ffmpeg's `loudnorm` filter.
//!
//! Pass one measures the recording, pass two re-encodes it to Opus using the
//! measured values so quiet and loud speakers come out at the same level.

use futures_util::future::BoxFuture;
use serde::{de, Deserialize, Deserializer};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Integrated loudness, true peak and loudness range targets.
const TARGET: &str = "I=-16:TP=-1.5:LRA=11";

/// Produces a louder-or-quieter copy of a recording.
pub trait Normalizer: Send + Sync {
    fn normalize<'a>(&'a self, input: &'a Path) -> BoxFuture<'a, Result<PathBuf, LoudnormError>>;
}

#[derive(Debug)]
pub enum LoudnormError {
    Spawn(io::Error),
    Failed { pass: u8, status: ExitStatus, detail: String },
    Stats(String),
}

impl fmt::Display for LoudnormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoudnormError::Spawn(err) => write!(f, "Failed to start ffmpeg: {}", err),
            LoudnormError::Failed { pass, status, detail } => {
                write!(f, "Loudnorm pass {} failed ({}): {}", pass, status, detail)
            }
            LoudnormError::Stats(msg) => write!(f, "Unusable loudnorm measurement: {}", msg),
        }
    }
}

impl std::error::Error for LoudnormError {}

/// Measurement printed by the first pass. ffmpeg reports the values as
/// strings; they are passed back verbatim in the second pass.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoudnormStats {
    #[serde(deserialize_with = "number_or_string")]
    pub input_i: String,
    #[serde(deserialize_with = "number_or_string")]
    pub input_tp: String,
    #[serde(deserialize_with = "number_or_string")]
    pub input_lra: String,
    #[serde(deserialize_with = "number_or_string")]
    pub input_thresh: String,
    #[serde(deserialize_with = "number_or_string")]
    pub target_offset: String,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("unexpected value {}", other))),
    }
}

/// Pull the JSON block `loudnorm` prints at the end of ffmpeg's stderr.
pub fn parse_stats(stderr: &str) -> Result<LoudnormStats, LoudnormError> {
    let start = stderr
        .rfind('{')
        .ok_or_else(|| LoudnormError::Stats("no JSON block in ffmpeg output".into()))?;
    let end = stderr[start..]
        .find('}')
        .map(|offset| start + offset)
        .ok_or_else(|| LoudnormError::Stats("unterminated JSON block".into()))?;

    serde_json::from_str(&stderr[start..=end]).map_err(|err| LoudnormError::Stats(err.to_string()))
}

pub fn second_pass_filter(stats: &LoudnormStats) -> String {
    format!(
        "loudnorm={}:linear=true:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}",
        TARGET, stats.input_i, stats.input_tp, stats.input_lra, stats.input_thresh, stats.target_offset
    )
}

/// Where the normalized copy of `input` is written.
pub fn normalized_path(input: &Path) -> PathBuf {
    let mut name = input.as_os_str().to_owned();
    name.push(".norm.webm");
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct Loudnorm {
    ffmpeg: String,
}

impl Loudnorm {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-nostdin", "-y", "-i"])
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub async fn measure(&self, input: &Path) -> Result<LoudnormStats, LoudnormError> {
        let mut cmd = self.command(input);
        cmd.arg("-af")
            .arg(format!("loudnorm={}:print_format=json", TARGET))
            .args(["-vn", "-f", "null", "-"]);

        let output = cmd.output().await.map_err(LoudnormError::Spawn)?;
        check(1, &output)?;
        parse_stats(&String::from_utf8_lossy(&output.stderr))
    }

    pub async fn apply(&self, input: &Path, stats: &LoudnormStats) -> Result<PathBuf, LoudnormError> {
        let target = normalized_path(input);
        let mut cmd = self.command(input);
        cmd.arg("-af")
            .arg(second_pass_filter(stats))
            .args(["-c:a", "libopus", "-b:a", "96k"])
            .arg(&target);

        let result = match cmd.output().await {
            Ok(output) => check(2, &output),
            Err(err) => Err(LoudnormError::Spawn(err)),
        };

        if let Err(err) = result {
            crate::audio::store::discard(&target).await;
            return Err(err);
        }

        debug!(input_i = %stats.input_i, path = %target.display(), "Normalized recording");
        Ok(target)
    }

    pub async fn normalize_file(&self, input: &Path) -> Result<PathBuf, LoudnormError> {
        let stats = self.measure(input).await?;
        self.apply(input, &stats).await
    }
}

impl Normalizer for Loudnorm {
    fn normalize<'a>(&'a self, input: &'a Path) -> BoxFuture<'a, Result<PathBuf, LoudnormError>> {
        Box::pin(self.normalize_file(input))
    }
}

fn check(pass: u8, output: &Output) -> Result<(), LoudnormError> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr.lines().last().unwrap_or_default().trim().to_string();
    Err(LoudnormError::Failed {
        pass,
        status: output.status,
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFMPEG_STDERR: &str = r#"
Input #0, matroska,webm, from 'in.webm':
  Duration: N/A, start: 0.000000, bitrate: N/A
  Stream #0:0: Audio: opus, 48000 Hz, mono, fltp (default)
[Parsed_loudnorm_0 @ 0x55d0c8e0]
{
	"input_i" : "-27.61",
	"input_tp" : "-9.85",
	"input_lra" : "6.30",
	"input_thresh" : "-38.05",
	"output_i" : "-16.53",
	"output_tp" : "-1.50",
	"output_lra" : "4.90",
	"output_thresh" : "-26.87",
	"normalization_type" : "dynamic",
	"target_offset" : "0.53"
}
"#;

    #[test]
    fn test_parse_stats() {
        let stats = parse_stats(FFMPEG_STDERR).unwrap();
        assert_eq!(stats.input_i, "-27.61");
        assert_eq!(stats.input_tp, "-9.85");
        assert_eq!(stats.input_lra, "6.30");
        assert_eq!(stats.input_thresh, "-38.05");
        assert_eq!(stats.target_offset, "0.53");
    }

    #[test]
    fn test_parse_stats_accepts_numbers() {
        let text = r#"{"input_i": -20.5, "input_tp": -3, "input_lra": 4.1, "input_thresh": -31, "target_offset": 0.2}"#;
        let stats = parse_stats(text).unwrap();
        assert_eq!(stats.input_i, "-20.5");
        assert_eq!(stats.input_tp, "-3");
    }

    #[test]
    fn test_parse_stats_rejects_missing_block() {
        assert!(matches!(
            parse_stats("Conversion failed!"),
            Err(LoudnormError::Stats(_))
        ));
        assert!(matches!(
            parse_stats("{\"input_i\": \"-20\"}"),
            Err(LoudnormError::Stats(_))
        ));
    }

    #[test]
    fn test_second_pass_filter() {
        let stats = parse_stats(FFMPEG_STDERR).unwrap();
        assert_eq!(
            second_pass_filter(&stats),
            "loudnorm=I=-16:TP=-1.5:LRA=11:linear=true:measured_I=-27.61:measured_TP=-9.85:\
             measured_LRA=6.30:measured_thresh=-38.05:offset=0.53"
        );
    }

    #[test]
    fn test_normalized_path() {
        assert_eq!(
            normalized_path(Path::new("/tmp/stentor_x/abc.webm")),
            PathBuf::from("/tmp/stentor_x/abc.webm.norm.webm")
        );
    }

    #[tokio::test]
    async fn test_missing_encoder_fails_first_pass() {
        let loudnorm = Loudnorm::new("stentor-no-such-ffmpeg");
        let result = loudnorm.normalize(Path::new("/nonexistent.webm")).await;
        assert!(matches!(result, Err(LoudnormError::Spawn(_))));
    }
}
