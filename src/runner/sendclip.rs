// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clip-sender threads: one per transport protocol, each polling the
//! response database and pushing finished clips out (FTP upload or local
//! export).

use base::clock::Clocks;
use base::shutdown;
use base::time::{Duration, Time};
use base::{err, Error, ErrorKind, Mutex, ResultExt as _};
use db::respdb::PendingClip;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::msg::{EngineEvent, FtpSettings, LocalExportSettings};
use crate::responses::{FTP_PROTOCOL, LOCAL_EXPORT_PROTOCOL};
use crate::runner::services::format_local;
use crate::runner::supervisor::WorkerShared;
use crate::runner::{wait_until_video_available, ExecutionContext};
use crate::video::ClipExtractor;

/// Seconds between response-database polls.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// How long we'll wait for video to flush before making the best clip we
/// can.
const GET_VIDEO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
const GET_VIDEO_RETRY_SLEEP: std::time::Duration = std::time::Duration::from_millis(500);

/// Idle time imposed after a failed send before the queue is retried.
const DELAY_FOR_FAILED_SEND: Duration = Duration(60 * 1000);

/// Default frame size when the camera's resolution hasn't been reported.
const DEFAULT_RESPONSE_RES: (i32, i32) = (320, 240);

/// Destination name for sent clips, unique enough that clips don't clobber
/// each other: `<rule> YYYY-mm-dd HH-MM-SS-<millis>.mp4`.
fn clip_name(rule_name: &str, start: Time) -> String {
    format!(
        "{rule_name} {}-{:03}.mp4",
        format_local(start, "%Y-%m-%d %H-%M-%S"),
        start.0.rem_euclid(1000)
    )
}

/// One way of pushing a finished clip file off the machine.
pub trait ClipTransport: Send + 'static {
    fn protocol(&self) -> &'static str;

    fn send(
        &self,
        clip_path: &Path,
        rule_name: &str,
        start: Time,
        stop: Time,
    ) -> Result<(), Error>;
}

/// FTP upload: connect / login / cwd / STOR with a socket timeout.
pub struct FtpTransport {
    pub settings: Arc<Mutex<FtpSettings>>,
}

/// Limit the socket timeout to 30 seconds; 10 wasn't always enough.
const FTP_SOCKET_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

impl ClipTransport for FtpTransport {
    fn protocol(&self) -> &'static str {
        FTP_PROTOCOL
    }

    fn send(
        &self,
        clip_path: &Path,
        rule_name: &str,
        start: Time,
        stop: Time,
    ) -> Result<(), Error> {
        use std::net::ToSocketAddrs as _;
        use suppaftp::{FtpStream, Mode};

        let settings = self.settings.lock().clone();
        let dst_name = clip_name(rule_name, start);
        info!(
            rule = rule_name,
            start = %start,
            stop = %stop,
            "sending clip via FTP"
        );

        let addr = (settings.host.as_str(), settings.port)
            .to_socket_addrs()
            .err_kind(ErrorKind::InvalidArgument)?
            .next()
            .ok_or_else(|| err!(InvalidArgument, msg("ftp host {} unresolvable", settings.host)))?;
        let mut ftp = FtpStream::connect_timeout(addr, FTP_SOCKET_TIMEOUT)
            .err_kind(ErrorKind::Unavailable)?;
        let result = (|| -> Result<(), Error> {
            ftp.login(&settings.user, &settings.password)
                .err_kind(ErrorKind::Unauthenticated)?;
            if !settings.directory.is_empty() {
                ftp.cwd(&settings.directory).err_kind(ErrorKind::NotFound)?;
            }
            ftp.set_mode(if settings.is_passive {
                Mode::Passive
            } else {
                Mode::Active
            });
            let mut file = std::fs::File::open(clip_path)?;
            ftp.put_file(&dst_name, &mut file)
                .err_kind(ErrorKind::Unavailable)?;
            Ok(())
        })();
        // quit() may use a socket in an invalid state; nothing to do about
        // a failure here.
        let _ = ftp.quit();
        if result.is_ok() {
            info!(rule = rule_name, dst = %dst_name, "sent clip via FTP");
        }
        result
    }
}

/// Local export: move (or copy) the clip into the rule's target directory.
pub struct LocalExportTransport {
    pub settings: Arc<Mutex<LocalExportSettings>>,
}

impl ClipTransport for LocalExportTransport {
    fn protocol(&self) -> &'static str {
        LOCAL_EXPORT_PROTOCOL
    }

    fn send(
        &self,
        clip_path: &Path,
        rule_name: &str,
        start: Time,
        _stop: Time,
    ) -> Result<(), Error> {
        let settings = self.settings.lock().clone();
        let Some(target_dir) = settings.dir_for_rule(rule_name).cloned() else {
            // Misconfiguration fails this clip without retry; no directory
            // will appear by itself.
            error!(rule = rule_name, "no export directory configured");
            return Ok(());
        };
        if !target_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(&target_dir) {
                error!(dir = %target_dir.display(), err = %e, "couldn't create export directory");
                return Ok(());
            }
        }
        let target = target_dir.join(clip_name(rule_name, start));
        // Try a move, followed by a copy if that fails (e.g. across
        // filesystems).
        if let Err(e) = std::fs::rename(clip_path, &target) {
            info!(err = %e, "move failed; copying instead");
            if let Err(e) = std::fs::copy(clip_path, &target) {
                error!(target = %target.display(), err = %e, "local export failed");
                return Ok(());
            }
        }
        info!(target = %target.display(), "exported clip");
        Ok(())
    }
}

/// A dedicated sender thread for one protocol. Polls the response
/// database, waits for the clip's video to be flushed, extracts the clip
/// into a temp file, and hands it to the transport.
pub struct ClipSender<C: Clocks + Clone, T: ClipTransport> {
    transport: T,
    ctx: ExecutionContext<C>,
    shared: Arc<WorkerShared<C>>,
    extractor: Arc<dyn ClipExtractor>,
    tmp_dir: PathBuf,
    shutdown: shutdown::Receiver,
    delay_responses_until: Time,
}

impl<C: Clocks + Clone, T: ClipTransport> ClipSender<C, T> {
    pub fn new(
        transport: T,
        ctx: ExecutionContext<C>,
        shared: Arc<WorkerShared<C>>,
        extractor: Arc<dyn ClipExtractor>,
        tmp_dir: PathBuf,
        shutdown: shutdown::Receiver,
    ) -> Self {
        ClipSender {
            transport,
            ctx,
            shared,
            extractor,
            tmp_dir,
            shutdown,
            delay_responses_until: Time(0),
        }
    }

    pub fn run(mut self) {
        let protocol = self.transport.protocol();
        info!(protocol, "sender ready");
        while self.shutdown.check().is_ok() {
            let pending = self
                .shared
                .response_db
                .are_responses_pending(protocol)
                .unwrap_or(false);
            if !pending {
                if self.shutdown.wait_for(POLL_INTERVAL).is_err() {
                    break;
                }
                continue;
            }
            let clip = match self.shared.response_db.get_next_clip_to_send(protocol) {
                Ok(Some(clip)) => clip,
                Ok(None) => {
                    if self.shutdown.wait_for(POLL_INTERVAL).is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    if e.kind() == ErrorKind::DataLoss {
                        // Corruption isn't recoverable from here; surface
                        // it to the operator and stop this sender.
                        error!(protocol, err = %e.chain(), "response db corrupt");
                        let _ = self.shared.backend_tx.send(EngineEvent::DatabaseCorrupt);
                        break;
                    }
                    warn!(protocol, err = %e.chain(), "couldn't read response db");
                    if self.shutdown.wait_for(POLL_INTERVAL).is_err() {
                        break;
                    }
                    continue;
                }
            };
            // Honor any idle time a failed send recommended.
            let delay = self.delay_responses_until - self.shared.clocks.realtime();
            if delay > Duration::ZERO && self.shutdown.wait_for(delay.into()).is_err() {
                break;
            }
            self.process_clip(clip);
        }
        info!(protocol, "sender exited");
    }

    fn process_clip(&mut self, job: PendingClip) {
        let available = wait_until_video_available(
            &self.ctx.clips,
            Some(&self.shutdown),
            true,
            &job.camera,
            job.stop_time,
            &self.shared.backend_tx,
            GET_VIDEO_TIMEOUT,
            GET_VIDEO_RETRY_SLEEP,
            &self.shared.clocks,
        );
        if !available && self.shutdown.check().is_err() {
            return;
        }
        // Not having everything isn't an error: this often happens when a
        // camera is turned off mid-event. Make the best clip we can.

        let clip_path = self
            .tmp_dir
            .join(format!("Clip-{}.mp4", self.shared.clocks.realtime().0));
        let resolution = self
            .shared
            .camera_resolutions
            .lock()
            .get(&job.camera)
            .copied()
            .unwrap_or(DEFAULT_RESPONSE_RES);

        let mut want_retry = false;
        let mut was_sent = false;
        match self.extractor.save_clip(
            &job.camera,
            job.start_time,
            job.stop_time,
            job.play_start,
            resolution,
            &clip_path,
        ) {
            Err(e) => {
                // Don't retry; this error will not fix itself.
                error!(
                    camera = %job.camera,
                    start = job.start_time.0,
                    stop = job.stop_time.0,
                    err = %e.chain(),
                    "error making clip"
                );
            }
            Ok(_) => {
                match self.transport.send(
                    &clip_path,
                    &job.rule_name,
                    job.start_time,
                    job.stop_time,
                ) {
                    Ok(()) => was_sent = true,
                    Err(e) => {
                        error!(
                            protocol = self.transport.protocol(),
                            rule = %job.rule_name,
                            err = %e.chain(),
                            "error uploading clip"
                        );
                        want_retry = true;
                    }
                }
            }
        }

        if clip_path.exists() {
            if let Err(e) = std::fs::remove_file(&clip_path) {
                warn!(path = %clip_path.display(), err = %e, "unable to delete temp clip");
            }
        }

        if want_retry {
            self.delay_responses_until =
                self.shared.clocks.realtime() + DELAY_FOR_FAILED_SEND;
        } else if let Err(e) = self.shared.response_db.clip_done(job.uid, was_sent) {
            error!(uid = job.uid, err = %e.chain(), "couldn't retire clip job");
        }
    }
}
