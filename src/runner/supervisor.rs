// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The supervisor: a single-threaded message loop dispatching response
//! work to a bounded pool of worker threads, maintaining the retry list,
//! pinging liveness, and purging old push notifications.

use base::clock::Clocks;
use base::shutdown;
use base::time::{Duration, Time};
use base::{Error, FastHashMap, Mutex};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use db::respdb::SharedResponseDb;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::msg::{
    EngineEvent, FtpSettings, LocalExportSettings, Message, MsgKind, NotificationSettings,
};
use crate::runner::sendclip::{ClipSender, ClipTransport, FtpTransport, LocalExportTransport};
use crate::runner::services::{
    HttpPoster, Mailer, ServicesAuth, GATEWAY_HOST, GATEWAY_PATH,
};
use crate::runner::{context::ExecutionContext, email, ifttt, push, webhook};
use crate::video::{ClipExtractor, FrameSource};

/// We won't retry anything faster than this unless another message or an
/// earlier retry deadline wakes the loop.
const QUEUE_SLEEP: std::time::Duration = std::time::Duration::from_secs(60);

/// Liveness ping cadence.
const PING_INTERVAL: Duration = Duration(120 * 1000);

/// Worker-pool allocation: poll every 100 ms, stall the main loop at most
/// ~1 s, then defer the message for a few seconds.
const EXECUTOR_POLL: std::time::Duration = std::time::Duration::from_millis(100);
const EXECUTOR_MAX_ALLOC_ATTEMPTS: u32 = 10;
const EXECUTOR_RETRY: Duration = Duration(5 * 1000);

/// Push-notification purging: hourly, dropping rows older than 10 days,
/// at most 10 000 per sweep.
const PUSH_PURGE_INTERVAL: Duration = Duration(3600 * 1000);
const PUSH_MAX_AGE: Duration = Duration(10 * 24 * 3600 * 1000);
const MAX_PUSH_PURGE: usize = 10_000;

fn max_executors(kind: MsgKind) -> usize {
    match kind {
        MsgKind::SendEmail | MsgKind::SendPush | MsgKind::TriggerIfttt | MsgKind::SendWebhook => 32,
        _ => 0,
    }
}

/// State shared between the supervisor thread, its workers, and the clip
/// senders. Settings are snapshots: workers clone what they need at
/// dispatch and never see later updates mid-action.
pub(crate) struct WorkerShared<C: Clocks + Clone> {
    pub clocks: C,
    pub http: Arc<dyn HttpPoster>,
    pub mailer: Arc<dyn Mailer>,
    pub frame_source: Arc<dyn FrameSource>,
    pub backend_tx: Sender<EngineEvent>,
    pub inbound_tx: Sender<Message>,
    pub response_db: SharedResponseDb<C>,
    pub retry_list: Mutex<Vec<(Time, u32, Message)>>,
    pub camera_resolutions: Mutex<FastHashMap<String, (i32, i32)>>,
    pub notification_settings: Mutex<NotificationSettings>,
    pub auth: ServicesAuth,
    pub gateway_url: String,
}

pub struct SupervisorOptions {
    pub tmp_dir: PathBuf,
    pub ftp_settings: FtpSettings,
    pub local_export_settings: LocalExportSettings,
    pub notification_settings: NotificationSettings,
    pub services_token: Option<String>,
    pub gateway_url: String,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        SupervisorOptions {
            tmp_dir: std::env::temp_dir(),
            ftp_settings: FtpSettings::default(),
            local_export_settings: LocalExportSettings::default(),
            notification_settings: NotificationSettings::default(),
            services_token: None,
            gateway_url: format!("https://{GATEWAY_HOST}{GATEWAY_PATH}"),
        }
    }
}

pub struct Supervisor<C: Clocks + Clone> {
    shared: Arc<WorkerShared<C>>,
    ctx: ExecutionContext<C>,
    inbound: Receiver<Message>,

    ftp_settings: Arc<Mutex<FtpSettings>>,
    local_export_settings: Arc<Mutex<LocalExportSettings>>,

    sender_threads: Vec<JoinHandle<()>>,
    sender_shutdown: Option<shutdown::Sender>,

    workers: Vec<(MsgKind, JoinHandle<()>)>,
    executor_counts: FastHashMap<MsgKind, usize>,

    running: bool,
    last_ping: Time,
    next_push_purge: Time,
}

impl<C: Clocks + Clone> Supervisor<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clocks: C,
        ctx: ExecutionContext<C>,
        inbound: Receiver<Message>,
        inbound_tx: Sender<Message>,
        backend_tx: Sender<EngineEvent>,
        response_db: SharedResponseDb<C>,
        http: Arc<dyn HttpPoster>,
        mailer: Arc<dyn Mailer>,
        frame_source: Arc<dyn FrameSource>,
        extractor: Arc<dyn ClipExtractor>,
        options: SupervisorOptions,
    ) -> Result<Self, Error> {
        let shared = Arc::new(WorkerShared {
            clocks: clocks.clone(),
            http,
            mailer,
            frame_source,
            backend_tx,
            inbound_tx,
            response_db,
            retry_list: Mutex::new(Vec::new()),
            camera_resolutions: Mutex::new(FastHashMap::default()),
            notification_settings: Mutex::new(options.notification_settings),
            auth: ServicesAuth::new(options.services_token),
            gateway_url: options.gateway_url,
        });

        let ftp_settings = Arc::new(Mutex::new(options.ftp_settings));
        let local_export_settings = Arc::new(Mutex::new(options.local_export_settings));

        let (sender_shutdown, sender_shutdown_rx) = shutdown::channel();
        let mut sender_threads = Vec::new();
        sender_threads.push(spawn_sender(
            FtpTransport {
                settings: ftp_settings.clone(),
            },
            &ctx,
            &shared,
            &extractor,
            &options.tmp_dir,
            &sender_shutdown_rx,
        )?);
        sender_threads.push(spawn_sender(
            LocalExportTransport {
                settings: local_export_settings.clone(),
            },
            &ctx,
            &shared,
            &extractor,
            &options.tmp_dir,
            &sender_shutdown_rx,
        )?);

        info!("response runner initialized");
        Ok(Supervisor {
            shared,
            ctx,
            inbound,
            ftp_settings,
            local_export_settings,
            sender_threads,
            sender_shutdown: Some(sender_shutdown),
            workers: Vec::new(),
            executor_counts: FastHashMap::default(),
            running: false,
            last_ping: Time(0),
            next_push_purge: Time(0),
        })
    }

    /// The main loop. Returns after a `Quit` message completes the
    /// shutdown sequence.
    pub fn run(&mut self) {
        self.running = true;
        while self.running {
            let now = self.shared.clocks.realtime();
            if now > self.last_ping + PING_INTERVAL {
                self.last_ping = now;
                let _ = self.shared.backend_tx.send(EngineEvent::Ping);
            }

            // Sleep until the next message or the earliest retry deadline.
            let mut latest_wakeup = now + Duration(QUEUE_SLEEP.as_millis() as i64);
            for &(retry_at, _, _) in self.shared.retry_list.lock().iter() {
                latest_wakeup = latest_wakeup.min(retry_at);
            }
            let timeout = std::time::Duration::from_millis((latest_wakeup - now).0.max(0) as u64);
            match self.inbound.recv_timeout(timeout) {
                Ok(msg) => self.process_message(msg, 1, true),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("inbound queue disconnected; shutting down");
                    self.running = false;
                }
            }

            // Retry anything that has come due, in order of arrival.
            let due: Vec<(u32, Message)> = {
                let mut list = self.shared.retry_list.lock();
                let now = self.shared.clocks.realtime();
                let mut due = Vec::new();
                list.retain(|(retry_at, try_num, msg)| {
                    if *retry_at <= now {
                        due.push((*try_num, msg.clone()));
                        false
                    } else {
                        true
                    }
                });
                due
            };
            for (try_num, msg) in due {
                self.process_message(msg, try_num, true);
            }

            self.purge_push_notifications();
        }

        self.shutdown_sequence();
    }

    fn process_message(&mut self, msg: Message, try_num: u32, allow_async: bool) {
        let kind = msg.kind();
        let max = max_executors(kind);

        if max > 0 && allow_async {
            match self.allocate_executor(kind, max) {
                Ok(()) => {
                    if !self.spawn_worker(kind, msg, try_num) {
                        if let Some(c) = self.executor_counts.get_mut(&kind) {
                            *c = c.saturating_sub(1);
                        }
                    }
                }
                Err(at) => {
                    self.shared.retry_list.lock().push((at, try_num + 1, msg));
                }
            }
        } else if let Some(at) = self.process_inline(msg.clone(), try_num) {
            self.shared.retry_list.lock().push((at, try_num + 1, msg));
        }

        if allow_async {
            // Ensure worker GC runs on the supervisor thread only.
            self.cleanup_executors();
        }
    }

    /// Hands a slow message to a fresh worker thread; falls back to inline
    /// handling (returning false) when a context can't be cloned.
    fn spawn_worker(&mut self, kind: MsgKind, msg: Message, try_num: u32) -> bool {
        let shared = self.shared.clone();
        let mut ctx = match self.ctx.try_clone() {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(err = %e.chain(), "couldn't clone execution context; running inline");
                if let Some(at) = self.process_inline(msg.clone(), try_num) {
                    self.shared.retry_list.lock().push((at, try_num + 1, msg));
                }
                return false;
            }
        };
        let handle = std::thread::Builder::new()
            .name(format!("resp-{kind:?}"))
            .spawn(move || {
                if let Some(at) = handle_slow_message(&shared, &mut ctx, &msg, try_num) {
                    shared.retry_list.lock().push((at, try_num + 1, msg));
                    // The queue timeout may have been computed before this
                    // deadline existed; wake the loop.
                    let _ = shared.inbound_tx.send(Message::Wakeup);
                }
            })
            .expect("spawning a worker thread succeeds");
        self.workers.push((kind, handle));
        true
    }

    /// Handles a message on the supervisor thread, returning a retry
    /// deadline if wanted.
    fn process_inline(&mut self, msg: Message, try_num: u32) -> Option<Time> {
        match msg {
            Message::Quit => {
                info!("received quit message");
                self.running = false;
                None
            }
            Message::SetCamResolution {
                camera,
                width,
                height,
            } => {
                info!(camera, width, height, "received camera resolution");
                self.shared
                    .camera_resolutions
                    .lock()
                    .insert(camera, (width, height));
                None
            }
            Message::SetFtpSettings(settings) => {
                *self.ftp_settings.lock() = settings;
                None
            }
            Message::SetLocalExportSettings(settings) => {
                *self.local_export_settings.lock() = settings;
                None
            }
            Message::SetNotificationSettings(settings) => {
                *self.shared.notification_settings.lock() = settings;
                None
            }
            Message::SetServicesAuthToken(token) => {
                self.shared.auth.update(token);
                None
            }
            Message::SetDebugConfig(config) => {
                debug!(?config, "debug config updated");
                None
            }
            // A wakeup only; clip jobs travel through the response db and
            // their sender threads.
            Message::SendClip | Message::Wakeup => None,
            // Slow messages land here only when a worker couldn't be set
            // up.
            other => handle_slow_message(&self.shared, &mut self.ctx, &other, try_num),
        }
    }

    fn allocate_executor(&mut self, kind: MsgKind, max: usize) -> Result<(), Time> {
        let mut attempts = 0;
        while self.executor_counts.get(&kind).copied().unwrap_or(0) >= max {
            self.cleanup_executors();
            attempts += 1;
            if attempts > EXECUTOR_MAX_ALLOC_ATTEMPTS {
                warn!(?kind, "failed to allocate executor; deferring message");
                return Err(self.shared.clocks.realtime() + EXECUTOR_RETRY);
            }
            self.shared.clocks.sleep(EXECUTOR_POLL);
        }
        *self.executor_counts.entry(kind).or_insert(0) += 1;
        Ok(())
    }

    /// Reaps completed worker threads.
    fn cleanup_executors(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].1.is_finished() {
                let (kind, handle) = self.workers.swap_remove(i);
                if handle.join().is_err() {
                    error!(?kind, "worker thread panicked");
                }
                if let Some(c) = self.executor_counts.get_mut(&kind) {
                    *c = c.saturating_sub(1);
                }
            } else {
                i += 1;
            }
        }
    }

    fn purge_push_notifications(&mut self) {
        let now = self.shared.clocks.realtime();
        if now <= self.next_push_purge {
            return;
        }
        match self
            .shared
            .response_db
            .purge_push_notifications(PUSH_MAX_AGE, MAX_PUSH_PURGE)
        {
            Ok(purged) => {
                if purged > 0 {
                    info!(purged, "notifications purged");
                }
                // Only get comfortable if everything eligible went;
                // otherwise come back as soon as possible.
                if purged < MAX_PUSH_PURGE {
                    self.next_push_purge = now + PUSH_PURGE_INTERVAL;
                }
            }
            Err(e) => {
                if e.kind() == base::ErrorKind::DataLoss {
                    error!(err = %e.chain(), "response db corrupt");
                    let _ = self.shared.backend_tx.send(EngineEvent::DatabaseCorrupt);
                    // No point sweeping a corrupt database again.
                    self.next_push_purge = Time::MAX;
                } else {
                    error!(err = %e.chain(), "notification purge failed");
                }
            }
        }
    }

    /// Quit sequence: stop the senders, give them a moment to exit, lock
    /// the response database against any lingering writer, then wait for
    /// the executor pool to drain.
    fn shutdown_sequence(&mut self) {
        drop(self.sender_shutdown.take());
        for handle in std::mem::take(&mut self.sender_threads) {
            // A brief join lets idle senders clean up; a sender stuck in a
            // slow transfer is abandoned (and fenced off below).
            let deadline = self.shared.clocks.monotonic() + std::time::Duration::from_secs(1);
            while !handle.is_finished() && self.shared.clocks.monotonic() < deadline {
                self.shared.clocks.sleep(std::time::Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        // Prevent response-db corruption: an abandoned sender blocks here
        // rather than writing while the process exits.
        self.shared.response_db.lock_forever();

        let mut waited_secs = 0u64;
        for (kind, handle) in std::mem::take(&mut self.workers) {
            while !handle.is_finished() {
                waited_secs += 1;
                if waited_secs % 30 == 0 {
                    warn!(?kind, waited_secs, "executor thread still alive");
                }
                self.shared.clocks.sleep(std::time::Duration::from_secs(1));
            }
            let _ = handle.join();
        }

        info!("all senders are down now");
    }
}

/// Dispatch for messages with a worker pool; runs on worker threads (or
/// inline as a fallback).
fn handle_slow_message<C: Clocks + Clone>(
    shared: &WorkerShared<C>,
    ctx: &mut ExecutionContext<C>,
    msg: &Message,
    try_num: u32,
) -> Option<Time> {
    match msg {
        Message::SendEmail {
            rule_name,
            camera,
            email_settings,
            config,
            num_triggers,
            obj_list,
            first,
            last,
            message_id,
        } => email::process_send_email(
            shared,
            ctx,
            try_num,
            rule_name,
            camera,
            email_settings,
            config,
            *num_triggers,
            obj_list,
            *first,
            *last,
            message_id,
        ),
        Message::SendPush {
            camera,
            rule_name,
            ms,
        } => push::process_send_push(shared, ctx, try_num, camera, rule_name, *ms),
        Message::TriggerIfttt {
            camera,
            rule_name,
            epoch_secs,
        } => ifttt::process_ifttt(shared, try_num, camera, rule_name, *epoch_secs),
        Message::SendWebhook {
            camera,
            rule_name,
            uri,
            ms,
            content_type,
            content,
            obj: _,
        } => webhook::process_webhook(
            shared,
            try_num,
            camera,
            rule_name,
            uri,
            *ms,
            content_type,
            content,
        ),
        other => {
            warn!(kind = ?other.kind(), "unexpected message");
            None
        }
    }
}

fn spawn_sender<C: Clocks + Clone, T: ClipTransport>(
    transport: T,
    ctx: &ExecutionContext<C>,
    shared: &Arc<WorkerShared<C>>,
    extractor: &Arc<dyn ClipExtractor>,
    tmp_dir: &std::path::Path,
    shutdown_rx: &shutdown::Receiver,
) -> Result<JoinHandle<()>, Error> {
    let protocol = transport.protocol();
    let sender = ClipSender::new(
        transport,
        ctx.try_clone()?,
        shared.clone(),
        extractor.clone(),
        tmp_dir.to_owned(),
        shutdown_rx.clone(),
    );
    Ok(std::thread::Builder::new()
        .name(format!("sender_{protocol}"))
        .spawn(move || sender.run())
        .expect("spawning a sender thread succeeds"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::ResponseConfig;
    use crate::runner::services::FakeHttpPoster;
    use crate::video::testutil::{FakeClipExtractor, FakeFrameSource};
    use base::clock::{RealClocks, SimulatedClocks};
    use crossbeam_channel::unbounded;
    use db::clips::{CacheStatus, ClipToInsert};
    use db::respdb::ResponseDb;
    use db::testutil::init;

    struct NullMailer;
    impl Mailer for NullMailer {
        fn send(
            &self,
            _settings: &crate::msg::EmailSettings,
            _email: &crate::runner::services::OutgoingEmail,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    struct FailingMailer;
    impl Mailer for FailingMailer {
        fn send(
            &self,
            _settings: &crate::msg::EmailSettings,
            _email: &crate::runner::services::OutgoingEmail,
        ) -> Result<(), Error> {
            Err(base::err!(Unavailable, msg("smtp down")))
        }
    }

    fn shared_with(
        clocks: SimulatedClocks,
        http: Arc<dyn HttpPoster>,
        mailer: Arc<dyn Mailer>,
    ) -> (
        Arc<WorkerShared<SimulatedClocks>>,
        crossbeam_channel::Receiver<EngineEvent>,
    ) {
        init();
        let (backend_tx, backend_rx) = unbounded();
        let (inbound_tx, _inbound_rx) = unbounded();
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let response_db =
            SharedResponseDb::new(ResponseDb::with_conn(clocks.clone(), conn).unwrap());
        let shared = Arc::new(WorkerShared {
            clocks,
            http,
            mailer,
            frame_source: Arc::new(FakeFrameSource),
            backend_tx,
            inbound_tx,
            response_db,
            retry_list: Mutex::new(Vec::new()),
            camera_resolutions: Mutex::new(FastHashMap::default()),
            notification_settings: Mutex::new(NotificationSettings {
                enabled: true,
                gateway_guid: "guid".to_owned(),
                gateway_password: "pw".to_owned(),
            }),
            auth: ServicesAuth::new(Some("token".to_owned())),
            gateway_url: "https://gateway.test/service/message".to_owned(),
        });
        (shared, backend_rx)
    }

    fn ctx_with_video(
        clocks: SimulatedClocks,
        dir: &std::path::Path,
        camera: &str,
        last: Time,
    ) -> ExecutionContext<SimulatedClocks> {
        let clip_path = dir.join("clips.db");
        let obj_path = dir.join("objects.db");
        let mut ctx = ExecutionContext::open(clocks, clip_path, obj_path).unwrap();
        ctx.clips
            .add_clip(ClipToInsert {
                filename: "a.mp4".to_owned(),
                camera: camera.to_owned(),
                first: Time(0),
                last,
                cache_status: CacheStatus::NonCache,
                proc_width: 320,
                proc_height: 240,
                ..Default::default()
            })
            .unwrap();
        ctx
    }

    /// Push retry schedule: 500, 500, then 200. Attempts are scheduled at
    /// T+0, T+2 s, T+6 s; on success no further scheduling.
    #[test]
    fn push_retry_schedule() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let http = FakeHttpPoster::new(&[500, 500, 200]);
        let (shared, _backend) = shared_with(clocks.clone(), http.clone(), Arc::new(NullMailer));
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_video(clocks.clone(), tmp.path(), "Door", Time(2_000_000));

        let t0 = clocks.realtime();
        let r1 = push::process_send_push(&shared, &mut ctx, 1, "Door", "People", Time(5_000));
        assert_eq!(r1, Some(t0 + Duration::from_secs(2)));

        let r2 = push::process_send_push(&shared, &mut ctx, 2, "Door", "People", Time(5_000));
        assert_eq!(r2, Some(clocks.realtime() + Duration::from_secs(4)));

        let r3 = push::process_send_push(&shared, &mut ctx, 3, "Door", "People", Time(5_000));
        assert_eq!(r3, None, "success schedules nothing further");
        assert_eq!(http.requests.lock().len(), 3);
    }

    #[test]
    fn push_gives_up_after_schedule_exhausted() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let http = FakeHttpPoster::new(&[500]);
        let (shared, _backend) = shared_with(clocks.clone(), http, Arc::new(NullMailer));
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_video(clocks.clone(), tmp.path(), "Door", Time(2_000_000));

        for try_num in 1..=4 {
            assert!(
                push::process_send_push(&shared, &mut ctx, try_num, "Door", "People", Time(5_000))
                    .is_some(),
                "try {try_num} schedules a retry"
            );
        }
        let r = push::process_send_push(&shared, &mut ctx, 5, "Door", "People", Time(5_000));
        assert_eq!(r, None, "schedule exhausted; give up");
    }

    #[test]
    fn push_4xx_fails_without_retry() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let http = FakeHttpPoster::new(&[403]);
        let (shared, _backend) = shared_with(clocks.clone(), http, Arc::new(NullMailer));
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_video(clocks.clone(), tmp.path(), "Door", Time(2_000_000));
        let r = push::process_send_push(&shared, &mut ctx, 1, "Door", "People", Time(5_000));
        assert_eq!(r, None);
    }

    #[test]
    fn push_stores_payload_for_later_fetch() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let http = FakeHttpPoster::new(&[200]);
        let (shared, _backend) = shared_with(clocks.clone(), http.clone(), Arc::new(NullMailer));
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_video(clocks.clone(), tmp.path(), "Door", Time(2_000_000));
        let _ = push::process_send_push(&shared, &mut ctx, 1, "Door", "People", Time(5_000));

        // The gateway request carries the stored row's uid.
        let requests = http.requests.lock();
        assert!(requests[0].1.contains("uid"), "{}", requests[0].1);
    }

    #[test]
    fn email_without_recipients_fails_without_retry() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let (shared, _backend) = shared_with(
            clocks.clone(),
            FakeHttpPoster::new(&[200]),
            Arc::new(NullMailer),
        );
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_video(clocks.clone(), tmp.path(), "Door", Time(2_000_000));
        let r = email::process_send_email(
            &shared,
            &mut ctx,
            1,
            "People",
            "Door",
            &crate::msg::EmailSettings::default(),
            &ResponseConfig::default(),
            1,
            &[7],
            Time(1_000),
            Time(2_000),
            "<id@test>",
        );
        assert_eq!(r, None);
    }

    #[test]
    fn email_send_failure_retries_with_backoff() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let (shared, _backend) = shared_with(
            clocks.clone(),
            FakeHttpPoster::new(&[200]),
            Arc::new(FailingMailer),
        );
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_video(clocks.clone(), tmp.path(), "Door", Time(2_000_000));
        let settings = crate::msg::EmailSettings {
            to_addrs: "user@example.com".to_owned(),
            from_addr: "nvr@example.com".to_owned(),
            ..Default::default()
        };
        let r = email::process_send_email(
            &shared,
            &mut ctx,
            1,
            "People",
            "Door",
            &settings,
            &ResponseConfig::default(),
            1,
            &[7],
            Time(1_000),
            Time(2_000),
            "<id@test>",
        );
        assert_eq!(r, Some(clocks.realtime() + Duration::from_secs(120)));

        // Final attempt gives up.
        let r = email::process_send_email(
            &shared,
            &mut ctx,
            3,
            "People",
            "Door",
            &settings,
            &ResponseConfig::default(),
            1,
            &[7],
            Time(1_000),
            Time(2_000),
            "<id@test>",
        );
        assert_eq!(r, None);
    }

    #[test]
    fn webhook_never_retries() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let http = FakeHttpPoster::new(&[503]);
        let (shared, _backend) = shared_with(clocks.clone(), http.clone(), Arc::new(NullMailer));
        let r = webhook::process_webhook(
            &shared,
            1,
            "Door",
            "People",
            "http://hook.test/x",
            Time(5_000),
            "application/json",
            "{}",
        );
        assert_eq!(r, None);
        assert_eq!(http.requests.lock().len(), 1);
    }

    #[test]
    fn ifttt_retries_then_succeeds() {
        let clocks = SimulatedClocks::new(Time(1_000_000));
        let http = FakeHttpPoster::new(&[500, 200]);
        let (shared, _backend) = shared_with(clocks.clone(), http, Arc::new(NullMailer));
        let r = ifttt::process_ifttt(&shared, 1, "Door", "People", 1_600_000_000);
        assert_eq!(r, Some(clocks.realtime() + Duration::from_secs(2)));
        let r = ifttt::process_ifttt(&shared, 2, "Door", "People", 1_600_000_000);
        assert_eq!(r, None);
    }

    /// Full supervisor loop: settings apply, a clip job flows through the
    /// local-export sender, and quit shuts everything down.
    #[test]
    fn supervisor_runs_clip_job_and_quits() {
        init();
        let clocks = RealClocks;
        let tmp = tempfile::tempdir().unwrap();
        let export_dir = tmp.path().join("export");

        let clip_db = tmp.path().join("clips.db");
        let obj_db = tmp.path().join("objects.db");
        {
            // Seed the clip index so the sender's video wait succeeds
            // immediately.
            let mut clips = db::clips::ClipIndex::open(RealClocks, &clip_db).unwrap();
            clips
                .add_clip(ClipToInsert {
                    filename: "a.mp4".to_owned(),
                    camera: "Door".to_owned(),
                    first: Time(0),
                    last: Time(i64::MAX / 2),
                    cache_status: CacheStatus::NonCache,
                    proc_width: 320,
                    proc_height: 240,
                    ..Default::default()
                })
                .unwrap();
        }
        let ctx = ExecutionContext::open(clocks, clip_db, obj_db).unwrap();

        let response_db = {
            let conn = rusqlite::Connection::open(tmp.path().join("resp.db")).unwrap();
            SharedResponseDb::new(ResponseDb::with_conn(clocks, conn).unwrap())
        };
        response_db
            .add_clip_to_send(&db::respdb::PendingClip {
                uid: 0,
                protocol: crate::responses::LOCAL_EXPORT_PROTOCOL.to_owned(),
                camera: "Door".to_owned(),
                rule_name: "People".to_owned(),
                start_time: Time(1_000),
                stop_time: Time(5_000),
                play_start: Time(1_000),
                preview_ms: Time(3_000),
                obj_list: vec![7],
                start_list: vec![Time(1_000)],
            })
            .unwrap();

        let (inbound_tx, inbound_rx) = unbounded();
        let (backend_tx, _backend_rx) = unbounded();
        let mut options = SupervisorOptions {
            tmp_dir: tmp.path().to_owned(),
            ..Default::default()
        };
        options
            .local_export_settings
            .dirs_by_rule
            .insert("people".to_owned(), export_dir.clone());

        let mut supervisor = Supervisor::new(
            clocks,
            ctx,
            inbound_rx,
            inbound_tx.clone(),
            backend_tx,
            response_db.clone(),
            Arc::new(HttpClientStub),
            Arc::new(NullMailer),
            Arc::new(FakeFrameSource),
            Arc::new(FakeClipExtractor),
            options,
        )
        .unwrap();

        inbound_tx
            .send(Message::SetCamResolution {
                camera: "Door".to_owned(),
                width: 640,
                height: 480,
            })
            .unwrap();

        // Give the sender time to pick the job up, then quit.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
        let respdb_for_check = response_db.clone();
        std::thread::spawn(move || {
            while std::time::Instant::now() < deadline {
                if !respdb_for_check
                    .are_responses_pending(crate::responses::LOCAL_EXPORT_PROTOCOL)
                    .unwrap_or(true)
                {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            let _ = inbound_tx.send(Message::Quit);
        });

        supervisor.run();

        assert_eq!(
            supervisor
                .shared
                .camera_resolutions
                .lock()
                .get("Door")
                .copied(),
            Some((640, 480))
        );
        // The export landed under the configured directory.
        let exported: Vec<_> = std::fs::read_dir(&export_dir)
            .map(|d| d.collect::<Vec<_>>())
            .unwrap_or_default();
        assert_eq!(exported.len(), 1, "exactly one exported clip");
    }

    struct HttpClientStub;
    impl HttpPoster for HttpClientStub {
        fn post(
            &self,
            _url: &str,
            _content_type: &str,
            _body: &str,
            _headers: &[(String, String)],
        ) -> Result<(u16, String), Error> {
            Ok((200, String::new()))
        }
        fn post_form(
            &self,
            _url: &str,
            _params: &[(&str, String)],
        ) -> Result<(u16, String), Error> {
            Ok((200, String::new()))
        }
    }
}
