//! Native codec engine backed by a local ffmpeg binary. The private
//! filesystem is a temporary directory that every exec runs inside.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::ProcessEngineConfig;
use crate::engine::{CodecEngine, DirEntry, EngineError, EngineEvent, LoadStage};

#[cfg(target_os = "windows")]
const FFMPEG_NAME: &str = "ffmpeg.exe";
#[cfg(target_os = "windows")]
const FFPROBE_NAME: &str = "ffprobe.exe";

#[cfg(not(target_os = "windows"))]
const FFMPEG_NAME: &str = "ffmpeg";
#[cfg(not(target_os = "windows"))]
const FFPROBE_NAME: &str = "ffprobe";

/// Lines of stderr kept for error messages.
const STDERR_TAIL: usize = 8;

fn find_binary(explicit: Option<&Path>, name: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            // Bundled next to the executable
            let bundled = exe_dir.join("ffmpeg").join(name);
            if bundled.exists() {
                return bundled;
            }
            // During dev: target/debug/<exe>, binaries in <root>/ffmpeg/
            let dev_path = exe_dir.join("..").join("..").join("ffmpeg").join(name);
            if dev_path.exists() {
                return dev_path.canonicalize().unwrap_or(dev_path);
            }
        }
    }

    PathBuf::from(name)
}

pub fn ffmpeg_on_path() -> bool {
    std::process::Command::new(FFMPEG_NAME)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

pub struct ProcessEngine {
    config: ProcessEngineConfig,
    ffmpeg: Option<PathBuf>,
    ffprobe: Option<PathBuf>,
    workdir: Option<TempDir>,
}

impl ProcessEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            ffmpeg: None,
            ffprobe: None,
            workdir: None,
        }
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }

    fn workspace(&mut self) -> Result<&Path, EngineError> {
        if self.workdir.is_none() {
            let dir = tempfile::Builder::new().prefix("giffy-").tempdir()?;
            self.workdir = Some(dir);
        }
        self.workdir
            .as_ref()
            .map(TempDir::path)
            .ok_or(EngineError::NotLoaded)
    }

    fn resolve(&mut self, name: &str) -> Result<PathBuf, EngineError> {
        if !is_plain_name(name) {
            return Err(EngineError::Fs(format!("invalid file name: {name}")));
        }
        Ok(self.workspace()?.join(name))
    }

    /// Duration and frame size of a file in the engine's filesystem.
    pub async fn probe(&mut self, name: &str) -> Result<MediaInfo, EngineError> {
        let path = self.resolve(name)?;
        let ffprobe = self.ffprobe.clone().ok_or(EngineError::NotLoaded)?;

        let output = Command::new(&ffprobe)
            .args([
                "-v", "error",
                "-select_streams", "v:0",
                "-show_entries", "stream=width,height,r_frame_rate,duration",
                "-show_entries", "format=duration",
                "-of", "csv=p=0",
            ])
            .arg(&path)
            .output()
            .await
            .map_err(|e| EngineError::Exec(format!("failed to run ffprobe ({}): {e}", ffprobe.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Exec(format!(
                "ffprobe failed (exit: {:?}): {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout)).map_err(EngineError::Exec)
    }
}

impl CodecEngine for ProcessEngine {
    async fn load(&mut self, on_stage: &mut (dyn FnMut(LoadStage) + Send)) -> Result<(), EngineError> {
        on_stage(LoadStage::Started);

        let ffmpeg = find_binary(self.config.ffmpeg_path.as_deref(), FFMPEG_NAME);
        let ffprobe = find_binary(self.config.ffprobe_path.as_deref(), FFPROBE_NAME);
        on_stage(LoadStage::CoreReady);

        self.workspace()?;
        on_stage(LoadStage::RuntimeReady);

        let mut cmd = Command::new(&ffmpeg);
        cmd.args(["-hide_banner", "-version"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        no_console_window(&mut cmd);

        let status = cmd
            .status()
            .await
            .map_err(|e| EngineError::Load(format!("failed to run {}: {e}", ffmpeg.display())))?;
        if !status.success() {
            return Err(EngineError::Load(format!(
                "{} -version exited with {status}",
                ffmpeg.display()
            )));
        }

        tracing::debug!(ffmpeg = %ffmpeg.display(), "ffmpeg binary ready");
        self.ffmpeg = Some(ffmpeg);
        self.ffprobe = Some(ffprobe);
        on_stage(LoadStage::Initialized);
        Ok(())
    }

    async fn exec(
        &mut self,
        argv: &[String],
        on_event: &mut (dyn FnMut(EngineEvent) + Send),
    ) -> Result<(), EngineError> {
        let ffmpeg = self.ffmpeg.clone().ok_or(EngineError::NotLoaded)?;
        let workdir = self.workspace()?.to_path_buf();
        let expected = expected_output_secs(argv);

        let mut cmd = Command::new(&ffmpeg);
        cmd.args(["-hide_banner", "-progress", "pipe:1", "-nostats"])
            .args(argv)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        no_console_window(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Exec(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Exec("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Exec("failed to capture stderr".into()))?;
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();

        let mut total = expected;
        let mut tail: Vec<String> = Vec::with_capacity(STDERR_TAIL);
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(line)) => {
                        if let (Some(secs), Some(total)) = (parse_out_time(&line), total) {
                            if total > 0.0 {
                                on_event(EngineEvent::Progress((secs / total).clamp(0.0, 1.0)));
                            }
                        }
                    }
                    _ => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(line)) => {
                        if total.is_none() {
                            total = parse_input_duration(&line);
                        }
                        if tail.len() == STDERR_TAIL {
                            tail.remove(0);
                        }
                        tail.push(line.clone());
                        on_event(EngineEvent::Log(line));
                    }
                    _ => err_done = true,
                },
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| EngineError::Exec(format!("ffmpeg process error: {e}")))?;

        if !status.success() {
            let reason = tail
                .iter()
                .rev()
                .find(|l| !l.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| format!("ffmpeg exited with {status}"));
            return Err(EngineError::Exec(reason));
        }

        on_event(EngineEvent::Progress(1.0));
        Ok(())
    }

    async fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<DirEntry>, EngineError> {
        let root = self.workspace()?.to_path_buf();
        let dir = match path.trim_matches('/') {
            "" | "." => root,
            sub if is_plain_name(sub) => root.join(sub),
            other => return Err(EngineError::Fs(format!("invalid directory: {other}"))),
        };

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().await?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[cfg(target_os = "windows")]
fn no_console_window(cmd: &mut Command) {
    cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
}

#[cfg(not(target_os = "windows"))]
fn no_console_window(_cmd: &mut Command) {}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

fn out_time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^out_time_us=(\d+)").expect("out_time pattern is valid"))
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration: (\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("duration pattern is valid")
    })
}

fn setpts_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"setpts=([0-9.]+)\*PTS").expect("setpts pattern is valid"))
}

/// Seconds of output written so far, from a `-progress` line.
fn parse_out_time(line: &str) -> Option<f64> {
    let caps = out_time_regex().captures(line.trim())?;
    caps[1].parse::<f64>().ok().map(|us| us / 1_000_000.0)
}

/// Input duration from ffmpeg's stream banner.
fn parse_input_duration(line: &str) -> Option<f64> {
    let caps = duration_regex().captures(line)?;
    let h: f64 = caps[1].parse().ok()?;
    let m: f64 = caps[2].parse().ok()?;
    let s: f64 = caps[3].parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

/// Output length implied by `-t` and any `setpts` time-scale in the argv.
fn expected_output_secs(argv: &[String]) -> Option<f64> {
    let duration: f64 = argv
        .windows(2)
        .find(|w| w[0] == "-t")
        .and_then(|w| w[1].parse().ok())?;
    let scale = argv
        .iter()
        .find_map(|a| setpts_regex().captures(a))
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .unwrap_or(1.0);
    Some(duration * scale)
}

/// Parse `ffprobe -of csv=p=0` output: a `width,height,fps,duration` stream
/// line and a bare format duration line.
pub fn parse_probe_output(stdout: &str) -> Result<MediaInfo, String> {
    let lines: Vec<&str> = stdout.trim().lines().collect();
    if lines.is_empty() {
        return Err("No video stream found".to_string());
    }

    let mut width = 0u32;
    let mut height = 0u32;
    let mut duration = 0.0f64;

    for line in lines {
        let parts: Vec<&str> = line.trim().split(',').collect();

        if parts.len() >= 3 {
            if let Ok(w) = parts[0].parse::<u32>() {
                width = w;
            }
            if let Ok(h) = parts[1].parse::<u32>() {
                height = h;
            }
            if parts.len() >= 4 {
                if let Ok(d) = parts[3].parse::<f64>() {
                    duration = d;
                }
            }
        }

        // Format duration only fills in a missing stream duration
        if parts.len() == 1 {
            if let Ok(d) = parts[0].parse::<f64>() {
                if duration == 0.0 {
                    duration = d;
                }
            }
        }
    }

    if duration == 0.0 {
        return Err("Could not determine video duration".to_string());
    }

    Ok(MediaInfo {
        duration,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_progress_lines() {
        assert_eq!(parse_out_time("out_time_us=2500000"), Some(2.5));
        assert_eq!(parse_out_time("out_time_us=N/A"), None);
        assert_eq!(parse_out_time("frame=12"), None);
    }

    #[test]
    fn parses_banner_duration() {
        let line = "  Duration: 00:01:02.50, start: 0.000000, bitrate: 1205 kb/s";
        assert_eq!(parse_input_duration(line), Some(62.5));
        assert_eq!(parse_input_duration("Stream #0:0: Video: h264"), None);
    }

    #[test]
    fn expected_output_follows_trim_and_speed() {
        let plain = argv(&["-ss", "0.000", "-t", "5.000", "-i", "input.mp4"]);
        assert_eq!(expected_output_secs(&plain), Some(5.0));

        let fast = argv(&["-t", "4.000", "-i", "input.mp4", "-vf", "setpts=0.5*PTS,fps=10"]);
        assert_eq!(expected_output_secs(&fast), Some(2.0));

        assert_eq!(expected_output_secs(&argv(&["-i", "input.mp4"])), None);
    }

    #[test]
    fn probe_output_prefers_stream_duration() {
        let info = parse_probe_output("1280,720,30/1,10.000000\n12.5\n").unwrap();
        assert_eq!(info, MediaInfo { duration: 10.0, width: 1280, height: 720 });

        let info = parse_probe_output("1280,720,30/1,N/A\n12.5\n").unwrap();
        assert_eq!(info.duration, 12.5);

        assert!(parse_probe_output("").is_err());
        assert!(parse_probe_output("1280,720,30/1,N/A\n").is_err());
    }

    #[test]
    fn rejects_names_that_escape_the_workspace() {
        assert!(is_plain_name("output.gif"));
        assert!(!is_plain_name("../etc/passwd"));
        assert!(!is_plain_name("a/b"));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name(""));
    }

    #[tokio::test]
    async fn virtual_files_live_in_a_private_directory() {
        let mut engine = ProcessEngine::new(ProcessEngineConfig::default());
        engine.write_file("input.mp4", b"abc").await.unwrap();
        assert_eq!(engine.read_file("input.mp4").await.unwrap(), b"abc");

        let names: Vec<String> = engine
            .list_dir("/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["input.mp4"]);

        engine.delete_file("input.mp4").await.unwrap();
        assert_eq!(
            engine.read_file("input.mp4").await,
            Err(EngineError::NotFound("input.mp4".to_string()))
        );
        assert!(engine.list_dir("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_files_round_trip_through_the_async_fs() {
        let mut engine = ProcessEngine::new(ProcessEngineConfig::default());
        let clip: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        engine.write_file("input.mov", &clip).await.unwrap();
        assert_eq!(engine.read_file("input.mov").await.unwrap(), clip);

        engine.delete_file("input.mov").await.unwrap();
        assert_eq!(
            engine.delete_file("input.mov").await,
            Err(EngineError::NotFound("input.mov".to_string()))
        );
    }

    #[tokio::test]
    async fn workspace_is_removed_with_the_engine() {
        let mut engine = ProcessEngine::new(ProcessEngineConfig::default());
        engine.write_file("a.bin", b"x").await.unwrap();
        let dir = engine.workdir().unwrap().to_path_buf();
        drop(engine);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn exec_before_load_is_rejected() {
        let mut engine = ProcessEngine::new(ProcessEngineConfig::default());
        let err = engine.exec(&argv(&["-version"]), &mut |_| {}).await.unwrap_err();
        assert_eq!(err, EngineError::NotLoaded);
    }

    #[tokio::test]
    async fn load_fails_for_a_missing_binary() {
        let config = ProcessEngineConfig {
            ffmpeg_path: Some(PathBuf::from("/nonexistent/giffy/ffmpeg")),
            ffprobe_path: None,
        };
        let mut engine = ProcessEngine::new(config);
        let mut stages = Vec::new();
        let err = engine.load(&mut |s| stages.push(s)).await.unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
        assert!(!stages.contains(&LoadStage::Initialized));
    }
}
