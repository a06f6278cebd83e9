use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info_span};
use url::Url;

use crate::error::{ConnectionError, TwainError};
use crate::protocol::CommandEnvelope;
use crate::transport::command::CommandTransport;

#[derive(Debug)]
struct CommandJob {
    url: Url,
    envelope: CommandEnvelope,
    privet_token: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<Value, TwainError>>,
}

/// Single ordered queue for one session's commands.
///
/// Jobs run one at a time in submission order. The worker task ends once
/// every handle is dropped.
#[derive(Debug, Clone)]
pub(crate) struct CommandWorker {
    jobs: mpsc::Sender<CommandJob>,
}

impl CommandWorker {
    pub(crate) fn spawn(transport: CommandTransport, queue_depth: usize) -> Self {
        let (jobs, mut receiver) = mpsc::channel::<CommandJob>(queue_depth.max(1));
        tokio::spawn(
            async move {
                while let Some(job) = receiver.recv().await {
                    let CommandJob {
                        url,
                        envelope,
                        privet_token,
                        timeout,
                        reply,
                    } = job;
                    let result = transport
                        .post_command(&url, &envelope, &privet_token, timeout)
                        .await;
                    if reply.send(result).is_err() {
                        debug!(method = envelope.method(), "command caller went away");
                    }
                }
                debug!("command worker stopped");
            }
            .instrument(info_span!("command_worker")),
        );
        Self { jobs }
    }

    /// Queues a command and waits for its reply.
    pub(crate) async fn submit(
        &self,
        url: Url,
        envelope: CommandEnvelope,
        privet_token: String,
        timeout: Duration,
    ) -> Result<Value, TwainError> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(CommandJob {
                url,
                envelope,
                privet_token,
                timeout,
                reply,
            })
            .await
            .map_err(|_closed| ConnectionError::WorkerStopped)?;
        response
            .await
            .map_err(|_dropped| ConnectionError::WorkerStopped)?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::CommandMethod;
    use crate::transport::command::TransportMode;
    use crate::transport::fake_scanner::FakeScanner;

    #[tokio::test]
    async fn commands_complete_in_submission_order() -> Result<(), TwainError> {
        let scanner = Arc::new(FakeScanner::builder().build());
        let transport = CommandTransport::new(scanner.clone(), TransportMode::Direct);
        let worker = CommandWorker::spawn(transport, 4);
        let url = scanner.endpoint_url()?;

        let created = worker
            .submit(
                url.clone(),
                CommandEnvelope::new(CommandMethod::CreateSession, None),
                scanner.privet_token().to_string(),
                Duration::from_secs(5),
            )
            .await?;
        let session_id = created["results"]["session"]["sessionId"].clone();
        let closed = worker
            .submit(
                url,
                CommandEnvelope::new(
                    CommandMethod::CloseSession,
                    Some(serde_json::json!({"sessionId": session_id})),
                ),
                scanner.privet_token().to_string(),
                Duration::from_secs(5),
            )
            .await?;

        assert_eq!(
            vec!["createSession", "closeSession"],
            scanner.received_methods()
        );
        assert_eq!("noSession", closed["results"]["session"]["state"]);
        Ok(())
    }
}
