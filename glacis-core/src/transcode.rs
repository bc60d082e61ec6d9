//! Transcode queue and worker pool.
//!
//! Turns closed RDP stays' `.replay` files into browser-playable MP4s by
//! driving an external transcoder binary. Job state lives in the store;
//! workers claim through the typed repository interface, so separate
//! worker processes coordinate the same way in-process workers do. Each
//! job runs under CPU and address-space ceilings; a breach kills the
//! process and fails the job with `resource_exceeded`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use glacis_store::models::TranscodeJob;
use glacis_store::repo::{StayRepo, TranscodeRepo};
use glacis_store::StoreError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Maximum simultaneous `running` jobs (W).
    pub workers: usize,
    /// Maximum `pending` jobs (P); `enqueue` fails beyond this.
    pub queue_max: i64,
    /// Worker poll interval; at least one second to bound store load.
    pub poll_interval: Duration,
    /// External `.replay -> .mp4` transcoder binary.
    pub transcoder_bin: PathBuf,
    /// Where finished MP4s land.
    pub output_dir: PathBuf,
    /// Per-job CPU ceiling, seconds.
    pub cpu_limit_secs: u64,
    /// Per-job address-space ceiling, bytes.
    pub mem_limit_bytes: u64,
}

impl TranscodeConfig {
    pub fn new(workers: usize, queue_max: i64, transcoder_bin: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            workers,
            queue_max,
            poll_interval: Duration::from_secs(1),
            transcoder_bin,
            output_dir,
            cpu_limit_secs: 15 * 60,
            mem_limit_bytes: 2 << 30,
        }
    }
}

pub struct TranscodeQueue {
    store: Store,
    config: TranscodeConfig,
}

impl TranscodeQueue {
    pub fn new(store: Store, config: TranscodeConfig) -> Arc<Self> {
        Arc::new(Self { store, config })
    }

    /// Queue a closed RDP stay's replay for transcoding.
    pub async fn enqueue(&self, stay_id: i64) -> CoreResult<TranscodeJob> {
        let cap = self.config.queue_max;
        self.store
            .with_conn(move |conn| {
                let stay = StayRepo::get(conn, stay_id)?;
                if stay.recording_path.is_none() {
                    return Err(StoreError::Constraint(format!(
                        "stay {stay_id} has no recording to transcode"
                    )));
                }
                TranscodeRepo::enqueue(conn, stay_id, cap)
            })
            .await
    }

    /// Promote a pending job ahead of the rest of the queue.
    pub async fn rush(&self, job_id: i32) -> CoreResult<i32> {
        self.store
            .with_conn(move |conn| TranscodeRepo::rush(conn, job_id))
            .await
    }

    pub async fn counts(&self) -> CoreResult<(i64, i64)> {
        self.store.with_conn(TranscodeRepo::counts).await
    }

    /// Requeue jobs stranded in `running` by a previous process.
    pub async fn recover(&self) -> CoreResult<usize> {
        let requeued = self.store.with_conn(TranscodeRepo::requeue_running).await?;
        if requeued > 0 {
            info!(requeued, "requeued transcode jobs from previous run");
        }
        Ok(requeued)
    }

    /// Start the worker pool: W workers, each claiming one job at a time,
    /// so at most W jobs are ever `running`.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|index| {
                let queue = Arc::clone(self);
                tokio::spawn(async move { queue.worker(index).await })
            })
            .collect()
    }

    async fn worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "transcode worker started");
        loop {
            let claimed = self.store.with_conn(TranscodeRepo::claim).await;
            match claimed {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    info!(worker = index, job_id, stay_id = job.stay_id, "transcode job claimed");
                    if let Err(e) = self.run_job(job).await {
                        warn!(worker = index, job_id, error = %e, "transcode job failed");
                        let message = e.to_string();
                        let _ = self
                            .store
                            .with_conn(move |conn| TranscodeRepo::fail(conn, job_id, &message))
                            .await;
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    warn!(worker = index, error = %e, "transcode claim failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn run_job(&self, job: TranscodeJob) -> CoreResult<()> {
        let stay_id = job.stay_id;
        let stay = self
            .store
            .with_conn(move |conn| StayRepo::get(conn, stay_id))
            .await?;
        let replay = stay
            .recording_path
            .ok_or_else(|| CoreError::Transcode(format!("stay {stay_id} lost its recording")))?;

        // Workers never share output files: write to a per-job tempfile and
        // rename into place on success.
        let final_path = self.config.output_dir.join(format!("{stay_id}.mp4"));
        let tmp_path = self
            .config
            .output_dir
            .join(format!("{stay_id}.mp4.partial-{}", job.id));

        let mut command = tokio::process::Command::new(&self.config.transcoder_bin);
        command
            .arg(&replay)
            .arg("-o")
            .arg(&tmp_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cpu = self.config.cpu_limit_secs;
        let mem = self.config.mem_limit_bytes;
        unsafe {
            command.pre_exec(move || {
                let cpu_limit = libc::rlimit {
                    rlim_cur: cpu,
                    rlim_max: cpu,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu_limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let mem_limit = libc::rlimit {
                    rlim_cur: mem,
                    rlim_max: mem,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &mem_limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| CoreError::Transcode(format!("failed to spawn transcoder: {e}")))?;

        let stderr = child.stderr.take();
        let stderr_tail = tokio::spawn(async move {
            let mut last_line = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    last_line = line;
                }
            }
            last_line
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_beat: Option<Instant> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some((done, total)) = parse_frame_progress(&line) {
                    if last_beat.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
                        last_beat = Some(Instant::now());
                        let eta = eta_seconds(started.elapsed(), done, total);
                        let job_id = job.id;
                        let _ = self
                            .store
                            .with_conn(move |conn| {
                                TranscodeRepo::heartbeat(conn, job_id, done, total, eta)
                            })
                            .await;
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::Transcode(format!("transcoder wait failed: {e}")))?;
        let last_error = stderr_tail.await.unwrap_or_default();

        if status.success() {
            tokio::fs::rename(&tmp_path, &final_path)
                .await
                .map_err(|e| CoreError::Transcode(format!("failed to move output: {e}")))?;
            let job_id = job.id;
            let output = final_path.to_string_lossy().into_owned();
            self.store
                .with_conn(move |conn| TranscodeRepo::complete(conn, job_id, &output))
                .await?;
            info!(job_id = job.id, stay_id, elapsed_secs = started.elapsed().as_secs(), "transcode complete");
            Ok(())
        } else {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            let message = match resource_breach(&status) {
                true => "resource_exceeded".to_string(),
                false if last_error.is_empty() => format!("transcoder exited with {status}"),
                false => last_error,
            };
            Err(CoreError::Transcode(message))
        }
    }
}

/// Whether the process died from a resource ceiling rather than a bug.
fn resource_breach(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    matches!(status.signal(), Some(libc::SIGXCPU) | Some(libc::SIGKILL))
}

/// Parse transcoder progress lines of the shape `... frame K of N ...`.
fn parse_frame_progress(line: &str) -> Option<(i32, i32)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for window in tokens.windows(4) {
        if window[0].eq_ignore_ascii_case("frame") && window[2] == "of" {
            let done = window[1].parse::<i32>().ok()?;
            let total = window[3]
                .trim_end_matches(|c: char| !c.is_ascii_digit())
                .parse::<i32>()
                .ok()?;
            if done >= 0 && total > 0 && done <= total {
                return Some((done, total));
            }
            return None;
        }
    }
    None
}

/// `elapsed * (N - K) / K`, rounded to whole seconds.
fn eta_seconds(elapsed: Duration, done: i32, total: i32) -> Option<i32> {
    if done <= 0 || total <= 0 || done > total {
        return None;
    }
    let remaining = elapsed.as_secs_f64() * f64::from(total - done) / f64::from(done);
    Some(remaining.round() as i32)
}
