use crate::types::{MirrorError, Result};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, info, warn};

/// How often the diagnostic stream is polled while waiting for output
const DIAGNOSTIC_POLL: Duration = Duration::from_secs(5);
const MIN_DIAGNOSTIC_POLL: Duration = Duration::from_millis(100);
/// Diagnostic characters kept for error reports
const DIAGNOSTIC_TAIL: usize = 16 * 1024;
const FASTSTART_FLAGS: &str = "frag_keyframe+empty_moov+default_base_moof+faststart";

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Duration:\s*(\d+):(\d+):(\d+(?:\.\d+)?)").expect("valid regex"));
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").expect("valid regex"));
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*([\d.]+)x").expect("valid regex"));

/// One transcoder invocation. Every operation writes its result to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOp {
    /// Stream-copy into a fast-start MP4
    Repackage { input_url: String },
    /// Re-encode video to HEVC at `crf`, audio copied
    Reencode { input_url: String, crf: u32 },
    /// Palette-optimized animated GIF
    PaletteAnimation { input_url: String, fps_max: u32 },
    /// Animated GIF to silent HEVC video
    AnimationToVideo { input_url: String, crf: u32 },
    /// Still image read from stdin, written as AVIF
    StillImage { quality: u32 },
}

impl TranscodeOp {
    pub fn label(&self) -> String {
        match self {
            TranscodeOp::Repackage { .. } => "video-copy".to_string(),
            TranscodeOp::Reencode { crf, .. } => format!("video-x265-crf{}", crf),
            TranscodeOp::PaletteAnimation { fps_max, .. } => format!("gif2gif-fps{}", fps_max),
            TranscodeOp::AnimationToVideo { crf, .. } => format!("gif2video-crf{}", crf),
            TranscodeOp::StillImage { quality } => format!("img2avif-q{}", quality),
        }
    }

    pub fn reads_stdin(&self) -> bool {
        matches!(self, TranscodeOp::StillImage { .. })
    }

    /// Arguments after the common `-hide_banner -y` prefix
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|a| a.to_string()));

        match self {
            TranscodeOp::Repackage { input_url } => {
                push(&["-i", input_url.as_str(), "-c:v", "copy", "-c:a", "copy"]);
                push(&["-movflags", FASTSTART_FLAGS, "-f", "mp4", "pipe:1"]);
            }
            TranscodeOp::Reencode { input_url, crf } => {
                let crf = crf.to_string();
                push(&["-i", input_url.as_str(), "-c:v", "libx265", "-crf", crf.as_str(), "-c:a", "copy"]);
                push(&["-movflags", FASTSTART_FLAGS, "-pix_fmt", "yuv420p", "-tag:v", "hvc1"]);
                push(&["-f", "mp4", "pipe:1"]);
            }
            TranscodeOp::PaletteAnimation { input_url, fps_max } => {
                let filter = format!(
                    "[0:v] fps={},split [a][b];[a] palettegen [p];[b][p] paletteuse",
                    fps_max
                );
                push(&["-i", input_url.as_str(), "-filter_complex", filter.as_str(), "-f", "gif", "pipe:1"]);
            }
            TranscodeOp::AnimationToVideo { input_url, crf } => {
                let crf = crf.to_string();
                push(&["-i", input_url.as_str(), "-c:v", "libx265", "-crf", crf.as_str()]);
                push(&["-movflags", FASTSTART_FLAGS, "-pix_fmt", "yuv420p", "-tag:v", "hvc1"]);
                push(&["-f", "mp4", "pipe:1"]);
            }
            TranscodeOp::StillImage { quality } => {
                // quality 0-100 maps onto crf 63-0
                let crf = 63u32.saturating_sub(*quality).to_string();
                push(&["-f", "image2pipe", "-i", "pipe:0", "-c:v", "libaom-av1", "-crf", crf.as_str()]);
                push(&["-b:v", "0", "-f", "avif", "pipe:1"]);
            }
        }
        args
    }
}

/// Runs the external ffmpeg binary
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_path: PathBuf,
    stall_timeout: Duration,
}

impl Transcoder {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, stall_timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            stall_timeout,
        }
    }

    /// Run `op`, feeding `input` on stdin when the operation reads it, and
    /// return everything the process wrote to stdout.
    pub async fn run(&self, op: &TranscodeOp, input: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let label = op.label();
        let args = op.args();
        let input = if op.reads_stdin() { input } else { None };

        let mut command = Command::new(&self.ffmpeg_path);
        command.arg("-hide_banner").arg("-y");
        if input.is_none() {
            command.arg("-nostdin");
        }
        command
            .args(&args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("[ffmpeg:{}] {} {}", label, self.ffmpeg_path.display(), args.join(" "));

        let mut child = command.spawn().map_err(|e| MirrorError::Transcode {
            label: label.clone(),
            detail: format!("failed to spawn {}: {}", self.ffmpeg_path.display(), e),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(mut stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(MirrorError::Transcode {
                label,
                detail: "process pipes unavailable".to_string(),
            });
        };

        let feed = async move {
            if let (Some(mut pipe), Some(data)) = (stdin, input) {
                pipe.write_all(&data).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let collect = async move {
            let mut out = Vec::new();
            stdout.read_to_end(&mut out).await?;
            Ok::<Vec<u8>, std::io::Error>(out)
        };
        let watch = watch_diagnostics(stderr, &mut child, &label, self.stall_timeout);

        let (fed, output, diagnostics) = tokio::join!(feed, collect, watch);
        let status = child.wait().await?;

        if let Err(e) = fed {
            // ffmpeg closing stdin early shows up here; the exit status decides
            debug!("[ffmpeg:{}] stdin write ended early: {}", label, e);
        }

        if diagnostics.stalled {
            return Err(MirrorError::Transcode {
                label,
                detail: format!("no progress for {:?}, process killed", self.stall_timeout),
            });
        }

        if !status.success() {
            error!(
                "[ffmpeg:{}] exited with {}:\n{}",
                label,
                status,
                tail_chars(&diagnostics.text, 1000)
            );
            return Err(MirrorError::Transcode {
                label,
                detail: format!("exit status {}", status),
            });
        }

        let output = output?;
        if output.is_empty() {
            return Err(MirrorError::Transcode {
                label,
                detail: "empty output".to_string(),
            });
        }

        info!("[ffmpeg:{}] done ({} bytes)", label, output.len());
        Ok(output)
    }
}

struct Diagnostics {
    text: String,
    stalled: bool,
}

/// Drain the diagnostic stream so the process never blocks on a full pipe.
/// Reads use a timeout; a process that stays silent without exiting for
/// `stall_timeout` is killed.
async fn watch_diagnostics(
    mut stderr: ChildStderr,
    child: &mut Child,
    label: &str,
    stall_timeout: Duration,
) -> Diagnostics {
    let mut buf = [0u8; 1024];
    let mut text = String::new();
    let mut idle = Duration::ZERO;
    let mut progress = Progress::default();
    let poll = DIAGNOSTIC_POLL.min(stall_timeout).max(MIN_DIAGNOSTIC_POLL);

    loop {
        match tokio::time::timeout(poll, stderr.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                idle = Duration::ZERO;
                let chunk = String::from_utf8_lossy(&buf[..n]);
                progress.observe(&chunk, label);
                text.push_str(&chunk);
                if text.len() > DIAGNOSTIC_TAIL * 2 {
                    text = tail_chars(&text, DIAGNOSTIC_TAIL).to_string();
                }
            }
            Ok(Err(e)) => {
                debug!("[ffmpeg:{}] diagnostic stream error: {}", label, e);
                break;
            }
            Err(_) => {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    break;
                }
                idle += poll;
                if idle >= stall_timeout {
                    warn!("[ffmpeg:{}] silent for {:?}, killing", label, idle);
                    if let Err(e) = child.start_kill() {
                        warn!("[ffmpeg:{}] kill failed: {}", label, e);
                    }
                    return Diagnostics { text, stalled: true };
                }
            }
        }
    }

    Diagnostics { text, stalled: false }
}

/// Last `max_chars` characters of `text`
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// Progress reporting from ffmpeg's `Duration:` / `time=` / `speed=` output
#[derive(Default)]
struct Progress {
    duration: Option<f64>,
    last_logged: Option<f64>,
}

impl Progress {
    fn observe(&mut self, chunk: &str, label: &str) {
        if self.duration.is_none() {
            if let Some(caps) = DURATION_RE.captures(chunk) {
                self.duration = parse_seconds(&caps);
                debug!("[ffmpeg:{}] input duration {:?}s", label, self.duration);
            }
        }

        let Some(current) = TIME_RE.captures_iter(chunk).filter_map(|caps| parse_seconds(&caps)).last() else {
            return;
        };
        if let Some(last) = self.last_logged {
            if current - last < 10.0 {
                return;
            }
        }
        self.last_logged = Some(current);

        let speed = SPEED_RE
            .captures(chunk)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "?".to_string());

        match self.duration {
            Some(total) if total > 0.0 => {
                let pct = (current / total * 100.0).min(100.0);
                info!("[ffmpeg:{}] {:.0}% ({:.1}s/{:.1}s) speed={}x", label, pct, current, total, speed);
            }
            _ => info!("[ffmpeg:{}] {:.1}s processed, speed={}x", label, current, speed),
        }
    }
}

fn parse_seconds(caps: &regex::Captures<'_>) -> Option<f64> {
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
