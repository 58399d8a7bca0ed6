//! Image and video I/O through `ffprobe`/`ffmpeg` subprocesses.
//!
//! Frames cross the process boundary as packed `rgb24` rawvideo. Decoders and
//! encoders drain ffmpeg's stderr on a background thread so the pipe never
//! fills, and kill the child process when dropped.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::{Image, VideoInfo};

const FALLBACK_FRAME_RATE: f64 = 23.976;

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct FfprobeFormat {
    format_name: Option<String>,
}

/// Primary video stream of a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaProbe {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Rate as ffprobe printed it, e.g. `24000/1001`.
    pub frame_rate_raw: String,
    pub frame_count: Option<u64>,
    pub codec_name: String,
    pub pix_fmt: String,
    pub container_format: String,
}

impl MediaProbe {
    pub fn video_info(&self) -> VideoInfo {
        VideoInfo {
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            frame_count: self.frame_count.unwrap_or(0),
        }
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

pub fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        return (den > 0.0).then(|| num / den);
    }
    s.trim().parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_i64()
                .map(|v| v != 0)
                .or_else(|| value.as_bool())
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_json(json: &[u8]) -> Result<MediaProbe> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;
    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;
    if width == 0 || height == 0 {
        bail!("video stream has empty dimensions {width}x{height}");
    }

    let rate_str = [stream.r_frame_rate.as_deref(), stream.avg_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .find(|s| parse_frame_rate(s).is_some_and(|r| r > 0.0));
    let (frame_rate, frame_rate_raw) = match rate_str {
        Some(raw) => (parse_frame_rate(raw).unwrap_or(FALLBACK_FRAME_RATE), raw.to_string()),
        None => {
            warn!("could not determine frame rate, defaulting to {FALLBACK_FRAME_RATE}");
            (FALLBACK_FRAME_RATE, FALLBACK_FRAME_RATE.to_string())
        }
    };

    Ok(MediaProbe {
        stream_index: stream.index,
        width,
        height,
        frame_rate,
        frame_rate_raw,
        frame_count: stream
            .nb_frames
            .as_deref()
            .and_then(|n| n.parse::<u64>().ok())
            .filter(|n| *n > 0),
        codec_name: stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        pix_fmt: stream
            .pix_fmt
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        container_format: probe
            .format
            .and_then(|f| f.format_name)
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

pub fn probe(path: &Path) -> Result<MediaProbe> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_probe_json(&output.stdout).with_context(|| format!("failed to probe {}", path.display()))
}

fn drain_stderr(stderr: ChildStderr, encoder: bool) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.is_empty() => {
                    if encoder {
                        debug!(target: "ffmpeg_encode_stderr", "{}", line);
                    } else {
                        debug!(target: "ffmpeg_stderr", "{}", line);
                    }
                }
                Err(e) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    })
}

fn build_decoder_args(path: &Path, stream_index: usize, max_frames: Option<u64>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nostdin".into(),
        "-i".into(),
        path.to_string_lossy().into_owned(),
        "-map".into(),
        format!("0:{stream_index}"),
    ];
    if let Some(n) = max_frames {
        args.extend(["-frames:v".into(), n.to_string()]);
    }
    args.extend([
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-vsync".into(),
        "cfr".into(),
        "-v".into(),
        "error".into(),
        "pipe:1".into(),
    ]);
    args
}

/// Decodes a video (or still image) into `[0, 1]` RGB frames, one at a time.
pub struct FrameDecoder {
    child: Child,
    width: usize,
    height: usize,
    frame_size: usize,
    stderr_thread: Option<JoinHandle<()>>,
    buf: Vec<u8>,
    frames_read: u64,
    done: bool,
}

impl FrameDecoder {
    pub fn open(path: &Path) -> Result<(Self, MediaProbe)> {
        let info = probe(path)?;
        let decoder = Self::new(path, &info, None)?;
        Ok((decoder, info))
    }

    pub fn new(path: &Path, info: &MediaProbe, max_frames: Option<u64>) -> Result<Self> {
        let args = build_decoder_args(path, info.stream_index, max_frames);
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching FFmpeg decoder");

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let frame_size = info.frame_size();

        Ok(Self {
            child,
            width: info.width as usize,
            height: info.height as usize,
            frame_size,
            stderr_thread: Some(drain_stderr(stderr, false)),
            buf: vec![0u8; frame_size],
            frames_read: 0,
            done: false,
        })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn read_frame(&mut self) -> Result<Option<Image>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        self.frames_read += 1;
        Image::from_rgb8(&self.buf, self.width, self.height).map(Some)
    }

    /// Wait for ffmpeg to exit and report a failed decode.
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg decoder exited with status {status}");
        }
        Ok(())
    }
}

impl Iterator for FrameDecoder {
    type Item = Result<Image>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for FrameDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Frame rate, rational (`24000/1001`) or decimal.
    pub fps: String,
    pub codec: String,
    pub crf: i64,
    pub pixel_format: String,
    /// Copy audio and subtitle streams from this file, when set.
    pub source_path: Option<PathBuf>,
}

impl EncoderConfig {
    pub fn new(output_path: PathBuf, width: u32, height: u32, fps: impl Into<String>) -> Self {
        Self {
            output_path,
            width,
            height,
            fps: fps.into(),
            codec: "libx264".into(),
            crf: 18,
            pixel_format: "yuv420p".into(),
            source_path: None,
        }
    }

    pub fn with_source(mut self, source_path: PathBuf) -> Self {
        self.source_path = Some(source_path);
        self
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.fps.clone(),
            "-i".into(),
            "pipe:0".into(),
        ];

        if let Some(source) = &self.source_path {
            args.extend([
                "-i".into(),
                source.to_string_lossy().into_owned(),
                "-map".into(),
                "0:v:0".into(),
                "-map".into(),
                "1:a?".into(),
                "-map".into(),
                "1:s?".into(),
                "-c:a".into(),
                "copy".into(),
                "-c:s".into(),
                "copy".into(),
            ]);
        }

        args.extend([
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            "-v".into(),
            "error".into(),
            self.output_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

/// Encodes RGB frames through an ffmpeg stdin pipe.
pub struct FrameEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    width: usize,
    height: usize,
    frame_size: usize,
    frames_written: u64,
}

impl FrameEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();
        debug!(cmd = %format!("ffmpeg {}", args.join(" ")), "launching FFmpeg encoder");

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;

        debug!(
            width = config.width,
            height = config.height,
            fps = %config.fps,
            codec = %config.codec,
            crf = config.crf,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(drain_stderr(stderr, true)),
            width: config.width as usize,
            height: config.height as usize,
            frame_size: config.frame_size(),
            frames_written: 0,
        })
    }

    /// Frame data must be exactly `width * height * 3` bytes.
    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;
        stdin
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn write_image(&mut self, image: &Image) -> Result<()> {
        if (image.width(), image.height()) != (self.width, self.height) {
            bail!(
                "frame is {}x{}, encoder expects {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            );
        }
        let rgb = image.to_rgb8()?;
        self.write_frame(&rgb)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn finish(mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            bail!("ffmpeg encoder exited with status {status}");
        }
        debug!(frames = self.frames_written, "FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Decode the first frame of an image (or video) file.
pub fn read_image(path: &Path) -> Result<Image> {
    let info = probe(path)?;
    let mut decoder = FrameDecoder::new(path, &info, Some(1))?;
    let image = decoder
        .next()
        .transpose()?
        .with_context(|| format!("no frame decoded from {}", path.display()))?;
    decoder.finish()?;
    Ok(image)
}

/// Encode a single image; the format follows the output extension.
pub fn write_image(path: &Path, image: &Image) -> Result<()> {
    let rgb = image.to_rgb8()?;
    let args: Vec<String> = vec![
        "-nostdin".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        format!("{}x{}", image.width(), image.height()),
        "-i".into(),
        "pipe:0".into(),
        "-frames:v".into(),
        "1".into(),
        "-v".into(),
        "error".into(),
        path.to_string_lossy().into_owned(),
    ];

    let mut child = crate::runtime::command_for("ffmpeg")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg, is it installed?")?;

    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        stdin
            .write_all(&rgb)
            .context("failed to write image to ffmpeg stdin")?;
    }

    let output = child
        .wait_with_output()
        .context("failed to wait for ffmpeg")?;
    if !output.status.success() {
        bail!(
            "ffmpeg failed to write {} ({}): {}",
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!(path = %path.display(), width = image.width(), height = image.height(), "Wrote image");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "mjpeg",
                "codec_type": "video",
                "width": 600,
                "height": 600,
                "pix_fmt": "yuvj420p",
                "r_frame_rate": "90000/1",
                "disposition": { "default": 0, "attached_pic": 1 }
            },
            {
                "index": 1,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "pix_fmt": "yuv420p",
                "r_frame_rate": "24000/1001",
                "avg_frame_rate": "24000/1001",
                "nb_frames": "1440",
                "disposition": { "default": 1, "attached_pic": 0 }
            },
            {
                "index": 2,
                "codec_name": "aac",
                "codec_type": "audio"
            }
        ],
        "format": { "format_name": "matroska,webm" }
    }"#;

    #[test]
    fn test_parse_frame_rate() {
        let ntsc = parse_frame_rate("24000/1001").expect("rational");
        assert!((ntsc - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_probe_prefers_default_non_cover_stream() {
        let probe = parse_probe_json(SAMPLE_FFPROBE_JSON.as_bytes()).expect("probe");
        assert_eq!(probe.stream_index, 1);
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.frame_rate_raw, "24000/1001");
        assert_eq!(probe.frame_count, Some(1440));
        assert_eq!(probe.codec_name, "h264");
        assert_eq!(probe.container_format, "matroska,webm");

        let info = probe.video_info();
        assert_eq!(info.frame_count, 1440);
        assert!((info.frame_rate - 23.976).abs() < 0.001);
    }

    #[test]
    fn test_parse_probe_still_image() {
        let json = r#"{"streams":[{"index":0,"codec_type":"video","codec_name":"png",
            "width":64,"height":32,"r_frame_rate":"0/0","avg_frame_rate":"0/0"}]}"#;
        let probe = parse_probe_json(json.as_bytes()).expect("probe");
        assert_eq!((probe.width, probe.height), (64, 32));
        assert_eq!(probe.frame_rate, FALLBACK_FRAME_RATE);
        assert_eq!(probe.frame_count, None);
        assert_eq!(probe.container_format, "unknown");
    }

    #[test]
    fn test_parse_probe_errors() {
        assert!(parse_probe_json(b"not json").is_err());
        let audio_only = r#"{"streams":[{"index":0,"codec_type":"audio"}]}"#;
        let err = parse_probe_json(audio_only.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
        let no_width = r#"{"streams":[{"index":0,"codec_type":"video","height":4}]}"#;
        assert!(parse_probe_json(no_width.as_bytes()).is_err());
    }

    #[test]
    fn test_decoder_args() {
        let args = build_decoder_args(Path::new("in.mkv"), 1, Some(1));
        let joined = args.join(" ");
        assert!(joined.starts_with("-nostdin -i in.mkv -map 0:1 -frames:v 1"));
        assert!(joined.ends_with("-pix_fmt rgb24 -vsync cfr -v error pipe:1"));

        let unbounded = build_decoder_args(Path::new("in.mkv"), 0, None).join(" ");
        assert!(!unbounded.contains("-frames:v"));
    }

    #[test]
    fn test_encoder_args() {
        let config = EncoderConfig::new(PathBuf::from("out.mp4"), 3840, 2160, "24000/1001");
        let joined = config.build_ffmpeg_args().join(" ");
        assert!(joined.contains("-s 3840x2160 -r 24000/1001 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -crf 18 -pix_fmt yuv420p"));
        assert!(joined.ends_with("out.mp4"));
        assert!(!joined.contains("-c:a"));
        assert_eq!(config.frame_size(), 3840 * 2160 * 3);

        let muxed = config
            .with_source(PathBuf::from("in.mkv"))
            .build_ffmpeg_args()
            .join(" ");
        assert!(muxed.contains("-i pipe:0 -i in.mkv -map 0:v:0 -map 1:a? -map 1:s?"));
        assert!(muxed.contains("-c:a copy"));
    }
}
