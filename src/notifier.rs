//! Requester notification
//!
//! The packager decides who gets notified and when; delivering the message
//! is left to a [`Notifier`]. Every waiter of a resolved job gets exactly
//! one notification, sent from a background task so job resolution never
//! waits on mail delivery. Failed deliveries are logged, not retried.

use crate::{render_template, Config, JobOutcome, Metrics, PackagerError, Waiter};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    Ready { file_name: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub email: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub outcome: NotificationOutcome,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), PackagerError>;
}

/// Email templates taken from the configuration.
#[derive(Debug, Clone)]
pub struct EmailTemplates {
    from: String,
    subject: String,
    body: String,
    failure_subject: String,
    failure_body: String,
}

impl EmailTemplates {
    pub fn from_config(config: &Config) -> Self {
        Self {
            from: config.email_from.clone(),
            subject: config.email_subject.clone(),
            body: config.email_body.clone(),
            failure_subject: config.failure_subject.clone(),
            failure_body: config.failure_body.clone(),
        }
    }

    pub fn render(&self, waiter: &Waiter, outcome: &JobOutcome) -> Notification {
        let file_name = outcome
            .as_ref()
            .map(|entry| entry.file_name())
            .unwrap_or_default();
        let error = outcome
            .as_ref()
            .err()
            .map(ToString::to_string)
            .unwrap_or_default();
        let vars = [
            ("resource_id", waiter.resource_id.as_str()),
            ("zip_file_name", file_name.as_str()),
            ("ckan_host", waiter.ckan_host.as_str()),
            ("error", error.as_str()),
        ];

        let (subject, body, outcome) = match outcome {
            Ok(_) => (
                &self.subject,
                &self.body,
                NotificationOutcome::Ready {
                    file_name: file_name.clone(),
                },
            ),
            Err(_) => (
                &self.failure_subject,
                &self.failure_body,
                NotificationOutcome::Failed {
                    error: error.clone(),
                },
            ),
        };

        Notification {
            email: waiter.email.clone(),
            from: render_template(&self.from, &vars),
            subject: render_template(subject, &vars),
            body: render_template(body, &vars),
            outcome,
        }
    }
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PackagerError> {
        info!(
            to = %notification.email,
            subject = %notification.subject,
            "Notification (not sent, no mail command configured)"
        );
        debug!("Notification body:\n{}", notification.body);
        Ok(())
    }
}

/// Pipes each message to a mail command such as `sendmail -t`.
///
/// SMTP settings are handed to the command through the `SMTP_HOST`,
/// `SMTP_LOGIN` and `SMTP_PASSWORD` environment variables.
#[derive(Debug, Clone)]
pub struct CommandMailNotifier {
    argv: Vec<String>,
    smtp_host: String,
    smtp_login: Option<String>,
    smtp_password: Option<String>,
}

impl CommandMailNotifier {
    pub fn new(command: &str, config: &Config) -> Result<Self, PackagerError> {
        let argv = shlex::split(command)
            .filter(|parts| !parts.is_empty())
            .ok_or_else(|| {
                PackagerError::Configuration(format!("cannot parse mail command: {command}"))
            })?;

        Ok(Self {
            argv,
            smtp_host: config.smtp_host.clone(),
            smtp_login: config.smtp_login.clone(),
            smtp_password: config.smtp_password.clone(),
        })
    }

    pub fn message(notification: &Notification) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\n\n{}",
            header_value(&notification.from),
            header_value(&notification.email),
            header_value(&notification.subject),
            notification.body
        )
    }
}

/// Header values are single-line.
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

#[async_trait]
impl Notifier for CommandMailNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), PackagerError> {
        let mut command = tokio::process::Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .env("SMTP_HOST", &self.smtp_host)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(login) = &self.smtp_login {
            command.env("SMTP_LOGIN", login);
        }
        if let Some(password) = &self.smtp_password {
            command.env("SMTP_PASSWORD", password);
        }

        let mut child = command
            .spawn()
            .map_err(|e| PackagerError::NotificationFailure(format!("{}: {e}", self.argv[0])))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(Self::message(notification).as_bytes())
                .await
                .map_err(|e| PackagerError::NotificationFailure(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PackagerError::NotificationFailure(e.to_string()))?;

        if !output.status.success() {
            return Err(PackagerError::NotificationFailure(format!(
                "{} exited with {}: {}",
                self.argv[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Fans a job outcome out to its waiters in the background.
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    templates: EmailTemplates,
    metrics: Arc<Metrics>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, templates: EmailTemplates, metrics: Arc<Metrics>) -> Self {
        Self {
            notifier,
            templates,
            metrics,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Notify every waiter once with `outcome`, without waiting for delivery.
    pub fn dispatch(&self, waiters: Vec<Waiter>, outcome: &JobOutcome) {
        if waiters.is_empty() {
            return;
        }

        let notifications: Vec<Notification> = waiters
            .iter()
            .map(|waiter| self.templates.render(waiter, outcome))
            .collect();
        let notifier = self.notifier.clone();
        let metrics = self.metrics.clone();

        let delivery = tokio::spawn(async move {
            for notification in notifications {
                match notifier.notify(&notification).await {
                    Ok(()) => metrics.record_notification(true),
                    Err(e) => {
                        metrics.record_notification(false);
                        warn!("Failed to notify {}: {}", notification.email, e);
                    }
                }
            }
        });

        let mut deliveries = self.deliveries.lock().unwrap_or_else(|e| e.into_inner());
        deliveries.retain(|handle| !handle.is_finished());
        deliveries.push(delivery);
    }

    /// Wait for every notification dispatched so far.
    pub async fn flush(&self) {
        let deliveries = std::mem::take(&mut *self.deliveries.lock().unwrap_or_else(|e| e.into_inner()));
        for delivery in deliveries {
            if let Err(e) = delivery.await {
                warn!("Notification task ended abnormally: {}", e);
            }
        }
    }
}
