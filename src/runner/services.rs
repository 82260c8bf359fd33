// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clients for hosted services: the HTTP layer the push gateway, IFTTT
//! bridge, and webhooks go through, and SMTP submission for email.

use base::time::MS_PER_SEC;
use base::{err, Error, ErrorKind, Mutex, ResultExt as _};
use std::sync::Arc;

use crate::msg::{EmailEncryption, EmailSettings};

/// The mobile push gateway.
pub const GATEWAY_HOST: &str = "gateway.argusnvr.net";
pub const GATEWAY_PATH: &str = "/service/message";
pub const GATEWAY_TIMEOUT_SECS: u64 = 30;

/// The IFTTT-style trigger bridge.
pub const IFTTT_HOST: &str = "ifttt.argusnvr.net";
pub const IFTTT_TRIGGER_PATH: &str = "/trigger";

pub const VERSION_STRING: &str = concat!("argus-nvr ", env!("CARGO_PKG_VERSION"));

/// Minimal POST surface, so tests can script statuses without a server.
pub trait HttpPoster: Send + Sync {
    /// Returns `(status, body)`.
    fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &str,
        headers: &[(String, String)],
    ) -> Result<(u16, String), Error>;

    /// Form-encoded POST.
    fn post_form(&self, url: &str, params: &[(&str, String)]) -> Result<(u16, String), Error>;
}

/// `reqwest`-backed client. Certificate verification can be disabled for
/// services with known self-signed endpoints.
pub struct HttpClient {
    client: reqwest::blocking::Client,
}

impl HttpClient {
    pub fn new(timeout_secs: u64, accept_invalid_certs: bool) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .err_kind(ErrorKind::Internal)?;
        Ok(HttpClient { client })
    }
}

impl HttpPoster for HttpClient {
    fn post(
        &self,
        url: &str,
        content_type: &str,
        body: &str,
        headers: &[(String, String)],
    ) -> Result<(u16, String), Error> {
        let mut req = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::ACCEPT, "text/plain")
            .body(body.to_owned());
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let rsp = req.send().err_kind(ErrorKind::Unavailable)?;
        let status = rsp.status().as_u16();
        let body = rsp.text().unwrap_or_default();
        Ok((status, body))
    }

    fn post_form(&self, url: &str, params: &[(&str, String)]) -> Result<(u16, String), Error> {
        let rsp = self
            .client
            .post(url)
            .form(params)
            .send()
            .err_kind(ErrorKind::Unavailable)?;
        let status = rsp.status().as_u16();
        let body = rsp.text().unwrap_or_default();
        Ok((status, body))
    }
}

/// Holds the machine token used to talk to hosted services; updated by the
/// supervisor, read by workers.
#[derive(Default)]
pub struct ServicesAuth(Mutex<Option<String>>);

impl ServicesAuth {
    pub fn new(token: Option<String>) -> Self {
        ServicesAuth(Mutex::new(token))
    }

    pub fn update(&self, token: Option<String>) {
        *self.0.lock() = token;
    }

    pub fn token(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

/// Fires an IFTTT-style trigger through the bridge.
pub fn ifttt_trigger(
    http: &dyn HttpPoster,
    auth: &ServicesAuth,
    camera: &str,
    rule_name: &str,
    epoch_secs: i64,
) -> Result<(u16, String), Error> {
    let Some(token) = auth.token() else {
        return Err(err!(
            Unauthenticated,
            msg("cannot trigger IFTTT, no auth token available")
        ));
    };
    let body = serde_json::json!({
        "camera": camera,
        "rule": rule_name,
        "time": epoch_secs,
    });
    let url = format!("https://{IFTTT_HOST}{IFTTT_TRIGGER_PATH}");
    http.post(
        &url,
        "application/json",
        &body.to_string(),
        &[("X-Machine-Token".to_owned(), token)],
    )
}

/// An email ready for submission.
pub struct OutgoingEmail {
    pub to_addrs: String,
    pub subject: String,
    pub body: String,
    pub message_id: String,

    /// `(filename, jpeg bytes)` thumbnail, when one could be produced.
    pub attachment: Option<(String, Vec<u8>)>,
}

/// SMTP submission, behind a trait so tests don't need a mail server.
pub trait Mailer: Send + Sync {
    fn send(&self, settings: &EmailSettings, email: &OutgoingEmail) -> Result<(), Error>;
}

pub struct SmtpMailer;

impl Mailer for SmtpMailer {
    fn send(&self, settings: &EmailSettings, email: &OutgoingEmail) -> Result<(), Error> {
        use lettre::message::header::ContentType;
        use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
        use lettre::transport::smtp::authentication::Credentials;
        use lettre::{Message, SmtpTransport, Transport};

        let from: Mailbox = settings
            .from_addr
            .parse()
            .map_err(|e| err!(InvalidArgument, msg("bad from address"), source(e)))?;
        let mut builder = Message::builder()
            .from(from)
            .subject(email.subject.clone())
            .message_id(Some(email.message_id.clone()));
        for addr in email.to_addrs.split([',', ';']) {
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }
            builder = builder.to(addr
                .parse()
                .map_err(|e| err!(InvalidArgument, msg("bad to address {addr:?}"), source(e)))?);
        }

        let body_part = SinglePart::plain(email.body.clone());
        let message = match &email.attachment {
            None => builder
                .singlepart(body_part)
                .map_err(|e| err!(Internal, source(e)))?,
            Some((filename, bytes)) => {
                let jpeg = ContentType::parse("image/jpeg").expect("static content type parses");
                builder
                    .multipart(
                        MultiPart::mixed()
                            .singlepart(body_part)
                            .singlepart(Attachment::new(filename.clone()).body(bytes.clone(), jpeg)),
                    )
                    .map_err(|e| err!(Internal, source(e)))?
            }
        };

        let mut transport = match settings.encryption {
            EmailEncryption::Tls => SmtpTransport::relay(&settings.host)
                .map_err(|e| err!(Unavailable, source(e)))?,
            EmailEncryption::StartTls => SmtpTransport::starttls_relay(&settings.host)
                .map_err(|e| err!(Unavailable, source(e)))?,
            EmailEncryption::None => SmtpTransport::builder_dangerous(&settings.host),
        };
        if settings.port != 0 {
            transport = transport.port(settings.port);
        }
        if !settings.user.is_empty() {
            transport = transport.credentials(Credentials::new(
                settings.user.clone(),
                settings.password.clone(),
            ));
        }
        transport
            .build()
            .send(&message)
            .map_err(|e| err!(Unavailable, msg("smtp send failed"), source(e)))?;
        Ok(())
    }
}

/// Formats a millisecond timestamp in the global zone.
pub(crate) fn format_local(t: base::time::Time, fmt: &str) -> String {
    match jiff::Timestamp::from_millisecond(t.0) {
        Ok(ts) => ts
            .to_zoned(base::time::global_zone())
            .strftime(fmt)
            .to_string(),
        Err(_) => (t.0 / MS_PER_SEC).to_string(),
    }
}

/// Scripted [`HttpPoster`] for tests.
pub struct FakeHttpPoster {
    /// Status/body pairs handed out in order; the last repeats.
    pub script: Mutex<Vec<(u16, String)>>,
    pub requests: Mutex<Vec<(String, String)>>,
}

impl FakeHttpPoster {
    pub fn new(statuses: &[u16]) -> Arc<Self> {
        Arc::new(FakeHttpPoster {
            script: Mutex::new(
                statuses
                    .iter()
                    .rev()
                    .map(|&s| (s, String::new()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn next_status(&self) -> (u16, String) {
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.pop().expect("nonempty")
        } else {
            script.last().cloned().unwrap_or((200, String::new()))
        }
    }
}

impl HttpPoster for FakeHttpPoster {
    fn post(
        &self,
        url: &str,
        _content_type: &str,
        body: &str,
        _headers: &[(String, String)],
    ) -> Result<(u16, String), Error> {
        self.requests
            .lock()
            .push((url.to_owned(), body.to_owned()));
        Ok(self.next_status())
    }

    fn post_form(&self, url: &str, params: &[(&str, String)]) -> Result<(u16, String), Error> {
        let body = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        self.requests.lock().push((url.to_owned(), body));
        Ok(self.next_status())
    }
}
