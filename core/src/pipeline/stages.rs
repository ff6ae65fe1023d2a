//! Stage executors.
//!
//! [`StageExecutor`] is the seam between the queue worker and the external
//! tools. [`FfmpegStages`] drives ffmpeg, Real-ESRGAN and the optional cover
//! generator; tests plug in their own executor. Export is a plain filesystem
//! copy shared by every executor through the trait's default method.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::config::{AppConfig, UpscaleBackend, UpscaleProfile};
use crate::events::Operation;
use crate::project::ProjectKey;
use crate::progress::{Observation, ProgressTracker, map_into_range};
use crate::tool::{OutputStream, ToolCommand, ToolExit, ToolLine, run_to_exit};

const CONCAT_LIST_NAME: &str = "concat_list.txt";
const COMPARE_CHUNK: usize = 64 * 1024;
/// Stderr lines quoted in a stage failure.
const FAILURE_TAIL_LINES: usize = 5;
/// Share of the upscale stage given to Real-ESRGAN when a 4K pass follows.
const REALESRGAN_SHARE: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Merge,
    Upscale,
    Export,
    Cover,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Merge => "merge",
            Stage::Upscale => "upscale",
            Stage::Export => "export",
            Stage::Cover => "cover",
        }
    }

    pub fn operation(self) -> Operation {
        match self {
            Stage::Merge => Operation::Merge,
            Stage::Upscale => Operation::Upscale,
            Stage::Export => Operation::Export,
            Stage::Cover => Operation::Cover,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage} stage failed: {reason}")]
    Failed { stage: Stage, reason: String },

    /// Non-fatal: an identical copy is already in the library.
    #[error("already exported: {}", path.display())]
    AlreadyExported { path: PathBuf },

    #[error("export destination already exists: {}", path.display())]
    DestinationConflict { path: PathBuf },

    #[error("stage i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn failed(stage: Stage, reason: impl Into<String>) -> Self {
        StageError::Failed {
            stage,
            reason: reason.into(),
        }
    }
}

/// Progress observed while a stage runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageProgress {
    /// Stage-local percentage, never decreasing.
    Percent(u8),
    /// The tool is working but reports no usable percentage.
    Running,
    /// A tool output line with no progress information.
    Log(String),
}

pub type ProgressSink<'a> = &'a (dyn Fn(StageProgress) + Send + Sync);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub skip_existing: bool,
    pub overwrite: bool,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Concatenate `inputs` (two or more) into `output`.
    async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError>;

    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError>;

    /// Write one still of `video`, taken `at_secs` in, to `output`.
    async fn extract_frame(
        &self,
        video: &Path,
        at_secs: f64,
        output: &Path,
    ) -> Result<(), StageError>;

    /// Turn a still frame into cover art for `key`. Without a generator the
    /// frame itself becomes the cover.
    async fn generate_cover(
        &self,
        frame: &Path,
        output: &Path,
        key: &ProjectKey,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError> {
        let _ = (key, progress);
        use_frame_as_cover(frame, output).await
    }

    /// Copy `source` to `destination`; returns the bytes written.
    async fn export(
        &self,
        source: &Path,
        destination: &Path,
        options: ExportOptions,
    ) -> Result<u64, StageError> {
        export_artifact(source, destination, options).await
    }
}

/// Executor backed by ffmpeg and Real-ESRGAN.
#[derive(Debug, Clone)]
pub struct FfmpegStages {
    ffmpeg: PathBuf,
    realesrgan: PathBuf,
    python: PathBuf,
    frame_estimate: u64,
    cover_generator: Option<PathBuf>,
    cover_args: Vec<String>,
}

impl FfmpegStages {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        let defaults = AppConfig::default();
        Self {
            ffmpeg: ffmpeg.into(),
            realesrgan: defaults.paths.realesrgan_path,
            python: defaults.paths.python_path,
            frame_estimate: defaults.upscaling.progress_frame_estimate,
            cover_generator: defaults.cover.generator,
            cover_args: defaults.cover.generator_args,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ffmpeg: config.paths.ffmpeg_path.clone(),
            realesrgan: config.paths.realesrgan_path.clone(),
            python: config.paths.python_path.clone(),
            frame_estimate: config.upscaling.progress_frame_estimate,
            cover_generator: config.cover.generator.clone(),
            cover_args: config.cover.generator_args.clone(),
        }
    }

    pub fn with_realesrgan(mut self, program: impl Into<PathBuf>) -> Self {
        self.realesrgan = program.into();
        self
    }

    pub fn with_cover_generator(mut self, program: impl Into<PathBuf>) -> Self {
        self.cover_generator = Some(program.into());
        self
    }

    /// `ffmpeg -ss <t> -i <video> -frames:v 1 -q:v 2 -y <out>`
    pub fn frame_command(&self, video: &Path, at_secs: f64, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg)
            .args(["-ss".to_string(), format!("{at_secs:.3}"), "-i".to_string()])
            .arg(video.display().to_string())
            .args(["-frames:v", "1", "-q:v", "2", "-y"])
            .arg(output.display().to_string())
    }

    /// Generator invocation with `{frame}`, `{output}`, `{title}` and `{year}`
    /// filled in; `None` when no generator is configured.
    pub fn cover_command(
        &self,
        frame: &Path,
        output: &Path,
        key: &ProjectKey,
    ) -> Option<ToolCommand> {
        let program = self.cover_generator.as_ref()?;
        let frame = frame.display().to_string();
        let output = output.display().to_string();
        let args = self.cover_args.iter().map(|arg| {
            arg.replace("{frame}", &frame)
                .replace("{output}", &output)
                .replace("{title}", &key.title)
                .replace("{year}", &key.year)
        });
        Some(ToolCommand::new(program).args(args))
    }

    pub fn concat_command(&self, list: &Path, output: &Path) -> ToolCommand {
        ToolCommand::new(&self.ffmpeg)
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list.display().to_string())
            .args(["-c", "copy", "-y"])
            .arg(output.display().to_string())
    }

    pub fn ffmpeg_upscale_command(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        filter: &str,
    ) -> ToolCommand {
        let options = &profile.encoder_options;
        let mut cmd = ToolCommand::new(&self.ffmpeg)
            .arg("-i")
            .arg(input.display().to_string())
            .args(["-vf", filter, "-c:v", profile.encoder.as_str()])
            .args(["-preset", options.preset.as_str()])
            .args(["-crf".to_string(), options.crf.to_string()]);
        if let Some(tune) = &options.tune {
            cmd = cmd.args(["-tune", tune.as_str()]);
        }
        cmd.args(["-c:a", "copy", "-y"])
            .arg(output.display().to_string())
    }

    pub fn realesrgan_command(
        &self,
        input: &Path,
        output_dir: &Path,
        profile: &UpscaleProfile,
    ) -> ToolCommand {
        let is_script = self
            .realesrgan
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("py"));
        let cmd = if is_script {
            ToolCommand::new(&self.python).arg(self.realesrgan.display().to_string())
        } else {
            ToolCommand::new(&self.realesrgan)
        };
        cmd.arg("-i")
            .arg(input.display().to_string())
            .args(["-n", profile.model.as_str(), "-s", "2", "-o"])
            .arg(output_dir.display().to_string())
            .args(["--tile".to_string(), profile.tile_size.to_string()])
            .args(["--tile_pad".to_string(), profile.tile_pad.to_string()])
            .args(["--num_process_per_gpu", "1", "--ffmpeg_bin"])
            .arg(self.ffmpeg.display().to_string())
    }

    async fn run_stage(
        &self,
        stage: Stage,
        command: &ToolCommand,
        mut tracker: ProgressTracker,
        progress: &(dyn Fn(StageProgress) + Send + Sync),
    ) -> Result<(), StageError> {
        let mut announced_running = false;
        let exit = run_to_exit(command, |line: &ToolLine| {
            if line.stream == OutputStream::Stderr {
                tracing::debug!("{stage}: {}", line.text);
            }
            match tracker.observe(&line.text) {
                Observation::Percent(pct) => progress(StageProgress::Percent(pct)),
                Observation::Indeterminate => {
                    if !announced_running {
                        announced_running = true;
                        progress(StageProgress::Running);
                    }
                }
                Observation::Log => progress(StageProgress::Log(line.text.clone())),
            }
        })
        .await
        .map_err(|e| StageError::failed(stage, e.to_string()))?;

        check_exit(stage, command, &exit)
    }

    async fn realesrgan_upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError> {
        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        let work_dir = parent.join(format!(".realesrgan-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir).await?;

        let result = self
            .realesrgan_into(input, output, &work_dir, profile, progress)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::debug!("Could not remove {}: {e}", work_dir.display());
        }
        result
    }

    async fn realesrgan_into(
        &self,
        input: &Path,
        output: &Path,
        work_dir: &Path,
        profile: &UpscaleProfile,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError> {
        let needs_4k_pass = profile.scale_factor > 2;
        let share = if needs_4k_pass { REALESRGAN_SHARE } else { 100 };
        let scaled = |p: StageProgress| match p {
            StageProgress::Percent(pct) => {
                progress(StageProgress::Percent(map_into_range(pct, 0, share)))
            }
            other => progress(other),
        };

        let command = self.realesrgan_command(input, work_dir, profile);
        self.run_stage(
            Stage::Upscale,
            &command,
            ProgressTracker::new(Some(self.frame_estimate)),
            &scaled,
        )
        .await?;

        let produced = find_realesrgan_output(work_dir, input)
            .await?
            .ok_or_else(|| {
                StageError::failed(Stage::Upscale, "Real-ESRGAN produced no output video")
            })?;

        if needs_4k_pass {
            let pass = |p: StageProgress| match p {
                StageProgress::Percent(pct) => {
                    progress(StageProgress::Percent(map_into_range(pct, share, 100)))
                }
                other => progress(other),
            };
            let command = self.ffmpeg_upscale_command(
                &produced,
                output,
                profile,
                &scale_filter(4),
            );
            self.run_stage(
                Stage::Upscale,
                &command,
                ProgressTracker::new(Some(self.frame_estimate)),
                &pass,
            )
            .await
        } else {
            tokio::fs::copy(&produced, output).await?;
            progress(StageProgress::Percent(100));
            Ok(())
        }
    }
}

#[async_trait]
impl StageExecutor for FfmpegStages {
    async fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError> {
        let dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list = dir.join(CONCAT_LIST_NAME);
        tokio::fs::write(&list, concat_list(inputs)?).await?;

        let command = self.concat_command(&list, output);
        // Without a known total duration, `time=` lines are only activity.
        self.run_stage(Stage::Merge, &command, ProgressTracker::new(None), progress)
            .await
    }

    async fn upscale(
        &self,
        input: &Path,
        output: &Path,
        profile: &UpscaleProfile,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError> {
        match profile.backend {
            UpscaleBackend::Ffmpeg => {
                let command = self.ffmpeg_upscale_command(
                    input,
                    output,
                    profile,
                    &scale_filter(profile.scale_factor),
                );
                self.run_stage(
                    Stage::Upscale,
                    &command,
                    ProgressTracker::new(Some(self.frame_estimate)),
                    progress,
                )
                .await
            }
            UpscaleBackend::Realesrgan => {
                self.realesrgan_upscale(input, output, profile, progress)
                    .await
            }
        }
    }

    async fn extract_frame(
        &self,
        video: &Path,
        at_secs: f64,
        output: &Path,
    ) -> Result<(), StageError> {
        let quiet = |_: StageProgress| {};
        let command = self.frame_command(video, at_secs, output);
        self.run_stage(Stage::Cover, &command, ProgressTracker::new(None), &quiet)
            .await?;
        let produced = ensure_artifact(Stage::Cover, output).await;
        if produced.is_ok() || at_secs <= 0.0 {
            return produced;
        }
        // Seeking past the end of a short video succeeds without writing a frame.
        tracing::info!(
            "No frame at {at_secs}s in {}, using the opening frame",
            video.display()
        );
        let command = self.frame_command(video, 0.0, output);
        self.run_stage(Stage::Cover, &command, ProgressTracker::new(None), &quiet)
            .await?;
        ensure_artifact(Stage::Cover, output).await
    }

    async fn generate_cover(
        &self,
        frame: &Path,
        output: &Path,
        key: &ProjectKey,
        progress: ProgressSink<'_>,
    ) -> Result<(), StageError> {
        let Some(command) = self.cover_command(frame, output, key) else {
            return use_frame_as_cover(frame, output).await;
        };
        self.run_stage(Stage::Cover, &command, ProgressTracker::new(None), progress)
            .await?;
        ensure_artifact(Stage::Cover, output).await
    }
}

/// `scale=` filter for an upscale factor.
pub fn scale_filter(factor: u32) -> String {
    match factor {
        4 => "scale=3840:2160:flags=lanczos".to_string(),
        2 => "scale=1920:1080:flags=lanczos".to_string(),
        n => format!("scale=iw*{n}:ih*{n}:flags=lanczos"),
    }
}

/// Body of an ffmpeg concat list with absolute, quoted paths.
pub fn concat_list(inputs: &[PathBuf]) -> std::io::Result<String> {
    let mut body = String::new();
    for input in inputs {
        let absolute = std::path::absolute(input)?;
        let escaped = absolute.display().to_string().replace('\'', r"'\''");
        body.push_str(&format!("file '{escaped}'\n"));
    }
    Ok(body)
}

/// Copy a lone input to the merge output without running a tool.
pub async fn copy_single_input(input: &Path, output: &Path) -> Result<(), StageError> {
    if input == output {
        return Ok(());
    }
    tokio::fs::copy(input, output).await.map_err(|e| {
        StageError::failed(
            Stage::Merge,
            format!("copy {} failed: {e}", input.display()),
        )
    })?;
    Ok(())
}

/// Cover art without a generator: the still frame as-is.
pub async fn use_frame_as_cover(frame: &Path, output: &Path) -> Result<(), StageError> {
    tokio::fs::copy(frame, output).await.map_err(|e| {
        StageError::failed(
            Stage::Cover,
            format!("copy {} failed: {e}", frame.display()),
        )
    })?;
    Ok(())
}

/// Fails unless `path` is a non-empty file.
pub async fn ensure_artifact(stage: Stage, path: &Path) -> Result<(), StageError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(StageError::failed(
            stage,
            format!("output {} is empty", path.display()),
        )),
        Err(_) => Err(StageError::failed(
            stage,
            format!("output {} was not produced", path.display()),
        )),
    }
}

/// Copy via a `.part` sibling and rename into place.
pub async fn export_artifact(
    source: &Path,
    destination: &Path,
    options: ExportOptions,
) -> Result<u64, StageError> {
    if !tokio::fs::metadata(source).await.is_ok_and(|m| m.is_file()) {
        return Err(StageError::failed(
            Stage::Export,
            format!("source {} does not exist", source.display()),
        ));
    }

    if tokio::fs::metadata(destination).await.is_ok() {
        if options.skip_existing && files_identical(source, destination).await? {
            return Err(StageError::AlreadyExported {
                path: destination.to_path_buf(),
            });
        }
        if !options.overwrite {
            return Err(StageError::DestinationConflict {
                path: destination.to_path_buf(),
            });
        }
        tracing::info!("Overwriting {}", destination.display());
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(destination);
    let bytes = match tokio::fs::copy(source, &partial).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(StageError::failed(
                Stage::Export,
                format!("copy to {} failed: {e}", destination.display()),
            ));
        }
    };
    tokio::fs::rename(&partial, destination).await?;
    tracing::info!(
        "Exported {} -> {} ({bytes} bytes)",
        source.display(),
        destination.display()
    );
    Ok(bytes)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Length first, then content.
pub async fn files_identical(a: &Path, b: &Path) -> std::io::Result<bool> {
    let (meta_a, meta_b) = (tokio::fs::metadata(a).await?, tokio::fs::metadata(b).await?);
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    let mut file_a = tokio::fs::File::open(a).await?;
    let mut file_b = tokio::fs::File::open(b).await?;
    let mut buf_a = vec![0u8; COMPARE_CHUNK];
    let mut buf_b = vec![0u8; COMPARE_CHUNK];
    loop {
        let n = file_a.read(&mut buf_a).await?;
        if n == 0 {
            return Ok(true);
        }
        file_b.read_exact(&mut buf_b[..n]).await?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

async fn find_realesrgan_output(work_dir: &Path, input: &Path) -> std::io::Result<Option<PathBuf>> {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let expected = work_dir.join(format!("{stem}_out.mp4"));
    if tokio::fs::metadata(&expected).await.is_ok() {
        return Ok(Some(expected));
    }
    let mut entries = tokio::fs::read_dir(work_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"))
        {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

fn check_exit(stage: Stage, command: &ToolCommand, exit: &ToolExit) -> Result<(), StageError> {
    if exit.success() {
        return Ok(());
    }
    let tail: Vec<&str> = exit.stderr_tail.lines().collect();
    let excerpt = tail[tail.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
    let code = exit
        .code
        .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"));
    tracing::warn!(
        "{stage} tool {} exited with {code}: {excerpt}",
        command.program.display()
    );
    Err(StageError::failed(
        stage,
        format!("{} exited with {code}: {excerpt}", command.program.display()),
    ))
}
