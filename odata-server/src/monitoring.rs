use chrono::Local;
use colored::*;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub enum LogMessage {
    BatchReceived {
        batch_id: String,
        format: String,
        operations: usize,
    },
    OperationDispatched {
        batch_id: String,
        method: String,
        uri: String,
        status: u16,
    },
    ChangeSetFailed {
        batch_id: String,
        changeset: String,
        skipped: usize,
    },
    BatchCompleted {
        batch_id: String,
        responses: usize,
        elapsed_ms: u128,
    },
    BatchRejected {
        batch_id: String,
        reason: String,
    },
    Error {
        message: String,
    },
}

#[derive(Clone)]
pub struct MonitoringLayer {
    tx: mpsc::Sender<LogMessage>,
}

impl MonitoringLayer {
    pub fn new(tx: mpsc::Sender<LogMessage>) -> Self {
        Self { tx }
    }

    pub async fn log_batch_received(&self, batch_id: &str, format: &str, operations: usize) {
        let _ = self
            .tx
            .send(LogMessage::BatchReceived {
                batch_id: batch_id.to_string(),
                format: format.to_string(),
                operations,
            })
            .await;
    }

    pub async fn log_operation_dispatched(&self, batch_id: &str, method: &str, uri: &str, status: u16) {
        let _ = self
            .tx
            .send(LogMessage::OperationDispatched {
                batch_id: batch_id.to_string(),
                method: method.to_string(),
                uri: uri.to_string(),
                status,
            })
            .await;
    }

    pub async fn log_changeset_failed(&self, batch_id: &str, changeset: &str, skipped: usize) {
        let _ = self
            .tx
            .send(LogMessage::ChangeSetFailed {
                batch_id: batch_id.to_string(),
                changeset: changeset.to_string(),
                skipped,
            })
            .await;
    }

    pub async fn log_batch_completed(&self, batch_id: &str, responses: usize, elapsed_ms: u128) {
        let _ = self
            .tx
            .send(LogMessage::BatchCompleted {
                batch_id: batch_id.to_string(),
                responses,
                elapsed_ms,
            })
            .await;
    }

    pub async fn log_batch_rejected(&self, batch_id: &str, reason: String) {
        let _ = self
            .tx
            .send(LogMessage::BatchRejected {
                batch_id: batch_id.to_string(),
                reason,
            })
            .await;
    }

    pub async fn log_error(&self, message: String) {
        let _ = self.tx.send(LogMessage::Error { message }).await;
    }
}

fn short_id(batch_id: &str) -> &str {
    batch_id.get(..8).unwrap_or(batch_id)
}

pub async fn spawn_monitoring_display(mut rx: mpsc::Receiver<LogMessage>) {
    tokio::spawn(async move {
        info!("");
        info!("{}", "📋 Batch Activity:".bold());
        info!("{}", "─".repeat(80).dimmed());

        while let Some(log) = rx.recv().await {
            let timestamp = Local::now().format("%H:%M:%S%.3f");

            match log {
                LogMessage::BatchReceived {
                    batch_id,
                    format,
                    operations,
                } => {
                    info!(
                        "{} {} Batch {} ({}, {} operations)",
                        timestamp.to_string().dimmed(),
                        "→".green().bold(),
                        short_id(&batch_id).yellow(),
                        format.white(),
                        operations
                    );
                }
                LogMessage::OperationDispatched {
                    batch_id,
                    method,
                    uri,
                    status,
                } => {
                    let status = if status < 400 {
                        status.to_string().green()
                    } else {
                        status.to_string().red()
                    };
                    info!(
                        "{} {} [{}] {} {} {}",
                        timestamp.to_string().dimmed(),
                        "↓".blue(),
                        short_id(&batch_id).yellow(),
                        method.white().bold(),
                        uri,
                        status
                    );
                }
                LogMessage::ChangeSetFailed {
                    batch_id,
                    changeset,
                    skipped,
                } => {
                    info!(
                        "{} ⚠️ [{}] Changeset {} failed, {} operations skipped",
                        timestamp.to_string().dimmed(),
                        short_id(&batch_id).yellow(),
                        changeset.red().bold(),
                        skipped
                    );
                }
                LogMessage::BatchCompleted {
                    batch_id,
                    responses,
                    elapsed_ms,
                } => {
                    info!(
                        "{} {} Batch {} completed: {} responses in {}ms",
                        timestamp.to_string().dimmed(),
                        "←".green().bold(),
                        short_id(&batch_id).yellow(),
                        responses,
                        elapsed_ms
                    );
                }
                LogMessage::BatchRejected { batch_id, reason } => {
                    info!(
                        "{} {} Batch {} rejected: {}",
                        timestamp.to_string().dimmed(),
                        "✗".red().bold(),
                        short_id(&batch_id).yellow(),
                        reason.red()
                    );
                }
                LogMessage::Error { message } => {
                    info!(
                        "{} ❌ Error: {}",
                        timestamp.to_string().dimmed(),
                        message.red()
                    );
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_reach_the_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let layer = MonitoringLayer::new(tx);
        layer.log_batch_received("0123456789", "multipart", 3).await;
        layer.log_changeset_failed("0123456789", "cs_1", 2).await;

        match rx.recv().await {
            Some(LogMessage::BatchReceived { operations, .. }) => assert_eq!(operations, 3),
            other => panic!("unexpected message: {:?}", other),
        }
        match rx.recv().await {
            Some(LogMessage::ChangeSetFailed { skipped, .. }) => assert_eq!(skipped, 2),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(short_id("0123456789"), "01234567");
    }
}
