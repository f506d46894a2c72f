//! Outgoing mail.
//!
//! Every message goes through a [`MailTransport`]. With a SendGrid key configured the
//! transport is [`SendGridTransport`], otherwise messages are only logged.
//!
//! Bulk sends hide recipients in bcc windows of [`BULK_BATCH_SIZE`] addresses, with the
//! sender as the visible recipient. A failed window is logged and the remaining windows
//! still go out.
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::config::MailConfig;

pub const BULK_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub to: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, from: &Sender, email: &Email) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Mailer {
    transport: Arc<dyn MailTransport>,
    sender: Sender,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub batches: usize,
    pub sent: usize,
    pub failed: usize,
}

impl Mailer {
    pub fn new(transport: Arc<dyn MailTransport>, sender: Sender) -> Self {
        Self { transport, sender }
    }

    pub fn from_config(config: &MailConfig) -> Self {
        let sender = Sender {
            email: config.from_email.clone(),
            name: config.from_name.clone(),
        };
        let transport: Arc<dyn MailTransport> = match &config.api_key {
            Some(key) => Arc::new(SendGridTransport::new(key.clone(), config.api_base.clone())),
            None => Arc::new(LogTransport),
        };
        Self::new(transport, sender)
    }

    pub async fn send(&self, email: &Email) -> anyhow::Result<()> {
        if email.to.is_empty() && email.bcc.is_empty() {
            bail!("Email `{}` has no recipients", email.subject);
        }
        self.transport.send(&self.sender, email).await
    }

    pub async fn send_bulk(&self, recipients: &[String], template: &Email) -> BulkReport {
        let windows = recipient_batches(recipients, BULK_BATCH_SIZE, &self.sender.email);
        let mut report = BulkReport {
            batches: windows.len(),
            ..BulkReport::default()
        };

        for (index, window) in windows.into_iter().enumerate() {
            let count = window.len();
            let email = Email {
                to: vec![self.sender.email.clone()],
                bcc: window,
                ..template.clone()
            };
            match self.send(&email).await {
                Ok(()) => {
                    report.sent += 1;
                    log::info!("Email batch {} sent ({} recipients)", index + 1, count);
                }
                Err(err) => {
                    report.failed += 1;
                    log::error!("Email batch {} failed: {:#}", index + 1, err);
                }
            }
        }
        report
    }
}

/// Valid, de-duplicated addresses split into windows of at most `size`.
pub fn recipient_batches(recipients: &[String], size: usize, exclude: &str) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    seen.insert(exclude.trim().to_lowercase());

    let unique: Vec<String> = recipients
        .iter()
        .map(|address| address.trim())
        .filter(|address| is_valid_address(address))
        .filter(|address| seen.insert(address.to_lowercase()))
        .map(str::to_string)
        .collect();

    unique
        .chunks(size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

pub fn is_valid_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !address.contains(char::is_whitespace)
        }
        None => false,
    }
}

pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, from: &Sender, email: &Email) -> anyhow::Result<()> {
        log::info!(
            "Mail transport disabled; dropping `{}` from {} to {} recipient(s) and {} bcc",
            email.subject,
            from.email,
            email.to.len(),
            email.bcc.len()
        );
        Ok(())
    }
}

pub struct SendGridTransport {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl SendGridTransport {
    pub fn new(api_key: String, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MailTransport for SendGridTransport {
    async fn send(&self, from: &Sender, email: &Email) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&sendgrid_payload(from, email))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("SendGrid rejected message with {}: {}", status, body);
        }
        log::debug!("SendGrid accepted `{}` with {}", email.subject, status);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SendGridMessage<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address<'a>>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<SendGridAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct SendGridAttachment<'a> {
    content: String,
    filename: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    disposition: &'static str,
}

fn address(email: &str) -> Address<'_> {
    Address { email, name: None }
}

fn sendgrid_payload<'a>(from: &'a Sender, email: &'a Email) -> SendGridMessage<'a> {
    // SendGrid requires at least one visible recipient per personalization
    let to = if email.to.is_empty() {
        vec![address(&from.email)]
    } else {
        email.to.iter().map(|to| address(to)).collect()
    };

    let mut content = vec![Content {
        kind: "text/plain",
        value: &email.text,
    }];
    if let Some(html) = &email.html {
        content.push(Content {
            kind: "text/html",
            value: html,
        });
    }

    SendGridMessage {
        personalizations: vec![Personalization {
            to,
            bcc: email.bcc.iter().map(|bcc| address(bcc)).collect(),
        }],
        from: Address {
            email: &from.email,
            name: Some(&from.name),
        },
        reply_to: email.reply_to.as_deref().map(address),
        subject: &email.subject,
        content,
        attachments: email
            .attachments
            .iter()
            .map(|attachment| SendGridAttachment {
                content: STANDARD.encode(&attachment.data),
                filename: &attachment.filename,
                kind: &attachment.content_type,
                disposition: "attachment",
            })
            .collect(),
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// A subject line of a shortage alert: name and rounded percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortSubject {
    pub subject_name: String,
    pub percentage: u8,
}

pub fn shortage_alert(to: &str, student_name: &str, subjects: &[ShortSubject], threshold: f64) -> Email {
    let listing: Vec<String> = subjects
        .iter()
        .map(|s| format!("{} ({}%)", s.subject_name, s.percentage))
        .collect();
    let items: String = subjects
        .iter()
        .map(|s| {
            format!(
                "<li>{} - <strong>{}%</strong></li>",
                escape_html(&s.subject_name),
                s.percentage
            )
        })
        .collect();

    Email {
        to: vec![to.to_string()],
        subject: "Attendance Shortage Alert".to_string(),
        text: format!(
            "Hello {},\n\nYour attendance is below {}% in the following subjects:\n{}\n\nPlease take necessary action.\n\nRegards,\nCSE Department",
            student_name,
            threshold,
            listing.join("\n")
        ),
        html: Some(format!(
            "<p>Hello <strong>{}</strong>,</p><p>Your attendance is below {}% in the following subjects:</p><ul>{}</ul><p>Please take necessary action.</p><p>Regards,<br/>CSE Department</p>",
            escape_html(student_name),
            threshold,
            items
        )),
        ..Email::default()
    }
}

pub fn marks_uploaded(to: &str) -> Email {
    Email {
        to: vec![to.to_string()],
        subject: "Marks Uploaded".to_string(),
        text: "Dear Student,\n\nYour marks have been uploaded successfully. Please log in to the student portal to view your detailed results.\n\nRegards,\nCSE Department".to_string(),
        ..Email::default()
    }
}

pub fn announcement(
    title: &str,
    message: &str,
    author: &str,
    attachment: Option<Attachment>,
) -> Email {
    Email {
        subject: format!("New Announcement: {}", title),
        text: format!("{}\n\n- {}", message, author),
        attachments: attachment.into_iter().collect(),
        ..Email::default()
    }
}

pub fn contact_message(inbox: &str, from_address: &str, message: &str) -> Email {
    Email {
        to: vec![inbox.to_string()],
        reply_to: Some(from_address.to_string()),
        subject: format!("New Contact Message from {}", from_address),
        text: format!("Email: {}\n\nMessage:\n{}", from_address, message),
        ..Email::default()
    }
}

pub fn password_otp(to: &str, otp: &str, valid_minutes: i64) -> Email {
    Email {
        to: vec![to.to_string()],
        subject: "Password Reset OTP".to_string(),
        text: format!("Your OTP is: {} (valid for {} minutes)", otp, valid_minutes),
        html: Some(format!(
            "<p>Your OTP is: <b>{}</b> (valid for {} minutes)</p>",
            otp, valid_minutes
        )),
        ..Email::default()
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every message; fails the n-th send (1-based) when asked to.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<Email>>,
        pub fail_on: Option<usize>,
        attempts: Mutex<usize>,
    }

    impl RecordingTransport {
        pub fn failing_on(n: usize) -> Self {
            Self {
                fail_on: Some(n),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, _from: &Sender, email: &Email) -> anyhow::Result<()> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if self.fail_on == Some(attempt) {
                bail!("provider unavailable");
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    pub fn sender() -> Sender {
        Sender {
            email: "dept@college.edu".to_string(),
            name: "CSE Department".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{sender, RecordingTransport};
    use super::*;

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("student{}@college.edu", i)).collect()
    }

    #[test]
    fn batches_are_bounded_and_cover_everyone() {
        let windows = recipient_batches(&addresses(250), BULK_BATCH_SIZE, "dept@college.edu");
        let sizes: Vec<usize> = windows.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn batches_drop_invalid_duplicate_and_sender_addresses() {
        let recipients = vec![
            "a@x.edu".to_string(),
            " A@x.edu ".to_string(),
            "not-an-address".to_string(),
            "".to_string(),
            "dept@college.edu".to_string(),
            "b@x.edu".to_string(),
        ];
        let windows = recipient_batches(&recipients, 100, "dept@college.edu");
        assert_eq!(windows, vec![vec!["a@x.edu".to_string(), "b@x.edu".to_string()]]);
        assert!(recipient_batches(&[], 100, "dept@college.edu").is_empty());
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_the_rest() {
        let transport = Arc::new(RecordingTransport::failing_on(2));
        let mailer = Mailer::new(transport.clone(), sender());
        let template = announcement("Exam", "Starts Monday", "Dr. Rao", None);

        let report = mailer.send_bulk(&addresses(250), &template).await;

        assert_eq!(
            report,
            BulkReport {
                batches: 3,
                sent: 2,
                failed: 1
            }
        );
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|email| email.to == vec!["dept@college.edu".to_string()]));
        assert_eq!(sent[1].bcc.len(), 50);
    }

    #[tokio::test]
    async fn email_without_recipients_is_rejected() {
        let transport = Arc::new(RecordingTransport::default());
        let mailer = Mailer::new(transport.clone(), sender());
        assert!(mailer.send(&Email::default()).await.is_err());
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn sendgrid_payload_shape() {
        let from = sender();
        let email = Email {
            to: vec!["dept@college.edu".to_string()],
            bcc: vec!["a@x.edu".to_string()],
            reply_to: Some("visitor@x.edu".to_string()),
            subject: "Hello".to_string(),
            text: "plain".to_string(),
            html: Some("<p>rich</p>".to_string()),
            attachments: vec![Attachment {
                filename: "notice.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                data: b"hi".to_vec(),
            }],
        };
        let value = serde_json::to_value(sendgrid_payload(&from, &email)).unwrap();

        assert_eq!(value["personalizations"][0]["to"][0]["email"], "dept@college.edu");
        assert_eq!(value["personalizations"][0]["bcc"][0]["email"], "a@x.edu");
        assert_eq!(value["from"]["name"], "CSE Department");
        assert_eq!(value["reply_to"]["email"], "visitor@x.edu");
        assert_eq!(value["content"][0]["type"], "text/plain");
        assert_eq!(value["content"][1]["type"], "text/html");
        assert_eq!(value["attachments"][0]["content"], "aGk=");
        assert_eq!(value["attachments"][0]["disposition"], "attachment");
    }

    #[test]
    fn payload_without_extras_omits_optional_fields() {
        let from = sender();
        let email = marks_uploaded("s@x.edu");
        let value = serde_json::to_value(sendgrid_payload(&from, &email)).unwrap();
        assert!(value.get("reply_to").is_none());
        assert!(value.get("attachments").is_none());
        assert!(value["personalizations"][0].get("bcc").is_none());
        assert_eq!(value["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn shortage_alert_lists_each_subject() {
        let subjects = vec![
            ShortSubject {
                subject_name: "Compilers <CS501>".to_string(),
                percentage: 60,
            },
            ShortSubject {
                subject_name: "Networks".to_string(),
                percentage: 72,
            },
        ];
        let email = shortage_alert("s@x.edu", "Asha", &subjects, 75.0);
        assert!(email.text.contains("below 75%"));
        assert!(email.text.contains("Compilers <CS501> (60%)\nNetworks (72%)"));
        let html = email.html.unwrap();
        assert!(html.contains("Compilers &lt;CS501&gt; - <strong>60%</strong>"));
    }
}
