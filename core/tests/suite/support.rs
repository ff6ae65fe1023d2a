#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tapedeck_core::config::AppConfig;
use tapedeck_core::events::{EventRecv, EventSubscription, Operation, ProgressEvent};
use tapedeck_core::pipeline::{JobId, JobStatus, PipelineJob};
use tapedeck_core::Orchestrator;
use tempfile::TempDir;

/// Stand-in for ffmpeg covering the four ways the engine calls it.
///
/// * capture (`-f <fmt> -i <device> ... <out>`): the device name picks the
///   behavior: `endless` records until stdin closes, `tape-end` stops on its
///   own, `crash` fails, `stubborn` ignores the stop request, `detached`
///   exits while a background child keeps the output pipes open.
/// * concat (`-f concat -safe 0 -i <list> ... <out>`): appends the listed files.
/// * frame grab (`-ss <t> -i <video> ... <out>`): writes `still@<t>:` plus the
///   video. Videos named `*Short*` only have a frame at 0.
/// * transcode (`-i <in> ... <out>`): copies the input, failing when the
///   input path contains `Kaputt`.
///
/// Every invocation is appended to `calls.log` next to the script.
const FAKE_FFMPEG: &str = r#"#!/bin/sh
echo "$*" >> "$(dirname "$0")/calls.log"
for last; do :; done
if [ "$2" = "concat" ]; then
  : > "$last"
  sed -e "s/^file '//" -e "s/'\$//" "$6" | while IFS= read -r part; do
    cat "$part" >> "$last"
  done
  echo "size=       1kB time=00:00:02.00 bitrate=   1.0kbits/s speed=  10x" >&2
  exit 0
fi
if [ "$1" = "-ss" ]; then
  case "$4" in
    *Short*) [ "$2" = "0.000" ] || exit 0 ;;
  esac
  { printf 'still@%s:' "$2"; cat "$4"; } > "$last"
  exit 0
fi
if [ "$1" = "-i" ]; then
  case "$2" in
    *Kaputt*) echo "upscale exploded" >&2; exit 1 ;;
  esac
  echo "frame=  750 fps= 30 q=28.0 size=   1kB time=00:00:30.00 bitrate=  1.0kbits/s" >&2
  echo "frame= 3000 fps= 30 q=28.0 size=   2kB time=00:02:00.00 bitrate=  1.0kbits/s" >&2
  cat "$2" > "$last"
  exit 0
fi
case "$4" in
  tape-end)
    echo "captured" > "$last"
    echo "[dv @ 0x1] End of file" >&2
    exit 0
    ;;
  crash)
    echo "device on fire" >&2
    exit 3
    ;;
  stubborn)
    echo "captured" > "$last"
    exec sleep 30
    ;;
  detached)
    echo "captured" > "$last"
    sleep 20 &
    exit 0
    ;;
  *)
    echo "capturing" > "$last"
    cat > /dev/null
    exit 0
    ;;
esac
"#;

/// Deck transport control: logs each action to `deck.log`; fails while a
/// `jammed` file sits next to it.
const FAKE_DECK: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
if [ -e "$dir/jammed" ]; then
  echo "tape jammed during $1" >&2
  exit 2
fi
echo "$1" >> "$dir/deck.log"
exit 0
"#;

/// Cover generator: `--input F --output O --title T --year Y`.
const FAKE_COVER: &str = r#"#!/bin/sh
echo "rendering  40%" >&2
{ printf 'cover %s (%s) from ' "$6" "$8"; cat "$2"; } > "$4"
echo "rendering 100%" >&2
exit 0
"#;

pub struct Harness {
    pub tmp: TempDir,
    pub config: AppConfig,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let tools = tmp.path().join("tools");
        std::fs::create_dir_all(&tools).unwrap();
        let ffmpeg = write_tool(&tools, "ffmpeg", FAKE_FFMPEG);
        let deck = write_tool(&tools, "deck", FAKE_DECK);

        let mut config = AppConfig::default();
        config.paths.import_root = tmp.path().join("import");
        config.paths.library_root = tmp.path().join("library");
        config.paths.ffmpeg_path = ffmpeg;
        config.device.input_format = "fake".to_string();
        config.device.video_device = "endless".to_string();
        config.device.control_command = Some(deck);
        config.device.control_timeout_secs = 5;
        config.upscaling.default_profile = "ffmpeg_fast".to_string();
        config.capture.stop_grace_secs = 5;
        config.capture.kill_grace_secs = 1;
        Self { tmp, config }
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.config.device.video_device = device.to_string();
        self
    }

    pub fn with_cover_generator(mut self) -> Self {
        let tools = self.tmp.path().join("tools");
        self.config.cover.generator = Some(write_tool(&tools, "cover", FAKE_COVER));
        self
    }

    /// Make every following deck action fail.
    pub fn jam_deck(&self) {
        std::fs::write(self.tmp.path().join("tools/jammed"), b"").unwrap();
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let orch = Orchestrator::new(self.config.clone());
        orch.start();
        orch
    }

    /// Argument lines of every fake ffmpeg run so far.
    pub fn tool_calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.tmp.path().join("tools/calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Deck actions run so far, in order.
    pub fn deck_actions(&self) -> Vec<String> {
        std::fs::read_to_string(self.tmp.path().join("tools/deck.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub fn write_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Skip events until a status event `operation/status` arrives.
pub async fn next_status(
    sub: &mut EventSubscription,
    operation: Operation,
    status: &str,
) -> ProgressEvent {
    let wait = async {
        loop {
            match sub.recv().await {
                EventRecv::Event(event)
                    if event.operation == operation && event.status() == Some(status) =>
                {
                    return event;
                }
                EventRecv::Closed => panic!("event bus closed while waiting for {status}"),
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {operation:?}/{status}"))
}

/// Poll until the job reaches a terminal status.
pub async fn wait_for_job(orch: &Orchestrator, id: JobId) -> PipelineJob {
    for _ in 0..500 {
        if let Some(job) = orch.job(id).filter(|job| job.status.is_terminal()) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} did not finish: {:?}", orch.job(id));
}

pub fn assert_status(job: &PipelineJob, status: JobStatus) {
    assert_eq!(
        job.status, status,
        "job {} ended {:?} with error {:?}",
        job.id, job.status, job.error
    );
}
