//! Single-task owner of a [`SessionController`].
//!
//! Commands arrive over an mpsc channel and are applied one at a time, so no
//! two mutations ever interleave. Stream updates are folded in between
//! commands, and every change republishes the [`RenderModel`].

use parley_storage::UserId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::attachment::FileHandle;
use crate::controller::{SessionController, SubmitOutcome};
use crate::error::{RuntimeStoppedSnafu, SessionResult};
use crate::presenter::RenderModel;

const COMMAND_BUFFER: usize = 32;

enum SessionCommand {
    SubmitTurn {
        text: String,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    DeleteMessagePair {
        index: usize,
        reply: oneshot::Sender<usize>,
    },
    ClearHistory {
        reply: oneshot::Sender<()>,
    },
    AddAttachments {
        files: Vec<FileHandle>,
        reply: oneshot::Sender<usize>,
    },
    RemoveAttachment {
        index: usize,
        reply: oneshot::Sender<bool>,
    },
    CancelResponse {
        reply: oneshot::Sender<bool>,
    },
    SwitchUser {
        user_id: UserId,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Shutdown,
}

/// Handle used by front ends to drive a running session.
pub struct SessionClient {
    commands: mpsc::Sender<SessionCommand>,
    render: watch::Receiver<RenderModel>,
    task: JoinHandle<()>,
}

impl SessionClient {
    /// Initializes `controller` for `user_id` and starts its runtime task.
    pub async fn start(mut controller: SessionController, user_id: UserId) -> SessionResult<Self> {
        controller.initialize(user_id).await?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (render_tx, render_rx) = watch::channel(RenderModel::from_controller(&controller));
        let task = tokio::spawn(run(controller, commands_rx, render_tx));

        Ok(Self {
            commands: commands_tx,
            render: render_rx,
            task,
        })
    }

    /// Latest published snapshot.
    pub fn render_model(&self) -> RenderModel {
        self.render.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RenderModel> {
        self.render.clone()
    }

    pub async fn submit_turn(&self, text: impl Into<String>) -> SessionResult<SubmitOutcome> {
        let text = text.into();
        self.request("submit-turn", |reply| SessionCommand::SubmitTurn { text, reply })
            .await
    }

    pub async fn delete_message_pair(&self, index: usize) -> SessionResult<usize> {
        self.request("delete-message-pair", |reply| {
            SessionCommand::DeleteMessagePair { index, reply }
        })
        .await
    }

    pub async fn clear_history(&self) -> SessionResult<()> {
        self.request("clear-history", |reply| SessionCommand::ClearHistory { reply })
            .await
    }

    pub async fn add_attachments(&self, files: Vec<FileHandle>) -> SessionResult<usize> {
        self.request("add-attachments", |reply| SessionCommand::AddAttachments {
            files,
            reply,
        })
        .await
    }

    pub async fn remove_attachment(&self, index: usize) -> SessionResult<bool> {
        self.request("remove-attachment", |reply| SessionCommand::RemoveAttachment {
            index,
            reply,
        })
        .await
    }

    pub async fn cancel_response(&self) -> SessionResult<bool> {
        self.request("cancel-response", |reply| SessionCommand::CancelResponse { reply })
            .await
    }

    pub async fn switch_user(&self, user_id: UserId) -> SessionResult<()> {
        self.request("switch-user", |reply| SessionCommand::SwitchUser { user_id, reply })
            .await?
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&RenderModel) -> bool,
    ) -> SessionResult<RenderModel> {
        match self.render.wait_for(predicate).await {
            Ok(model) => Ok(model.clone()),
            Err(_) => RuntimeStoppedSnafu { stage: "wait-for-render" }.fail(),
        }
    }

    /// Tears the session down and waits for the runtime task to exit.
    pub async fn shutdown(self) {
        if self.commands.send(SessionCommand::Shutdown).await.is_err() {
            tracing::debug!("session runtime already stopped");
        }
        if let Err(error) = self.task.await {
            tracing::warn!(error = %error, "session runtime task failed");
        }
    }

    async fn request<T>(
        &self,
        stage: &'static str,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(command(reply_tx)).await.is_err() {
            return RuntimeStoppedSnafu { stage }.fail();
        }

        match reply_rx.await {
            Ok(value) => Ok(value),
            Err(_) => RuntimeStoppedSnafu { stage }.fail(),
        }
    }
}

async fn run(
    mut controller: SessionController,
    mut commands: mpsc::Receiver<SessionCommand>,
    render: watch::Sender<RenderModel>,
) {
    loop {
        let awaiting = controller.is_awaiting_response();

        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => handle_command(&mut controller, &render, command).await,
                }
            }
            Some(event) = controller.next_turn_event(), if awaiting => {
                tracing::trace!(?event, "applied stream update");
                publish(&controller, &render);
            }
        }
    }

    controller.teardown();
    publish(&controller, &render);
    tracing::info!("session runtime stopped");
}

fn publish(controller: &SessionController, render: &watch::Sender<RenderModel>) {
    render.send_replace(RenderModel::from_controller(controller));
}

/// Applies one command and publishes the new state before replying.
async fn handle_command(
    controller: &mut SessionController,
    render: &watch::Sender<RenderModel>,
    command: SessionCommand,
) {
    fn respond<T>(
        controller: &SessionController,
        render: &watch::Sender<RenderModel>,
        reply: oneshot::Sender<T>,
        value: T,
    ) {
        publish(controller, render);
        // A dropped receiver only means the caller stopped waiting.
        let _ = reply.send(value);
    }

    match command {
        SessionCommand::SubmitTurn { text, reply } => {
            let outcome = controller.submit_turn(&text);
            respond(controller, render, reply, outcome);
        }
        SessionCommand::DeleteMessagePair { index, reply } => {
            let removed = controller.delete_message_pair(index);
            respond(controller, render, reply, removed);
        }
        SessionCommand::ClearHistory { reply } => {
            controller.clear_history();
            respond(controller, render, reply, ());
        }
        SessionCommand::AddAttachments { files, reply } => {
            let added = controller.add_attachments(files);
            respond(controller, render, reply, added);
        }
        SessionCommand::RemoveAttachment { index, reply } => {
            let removed = controller.remove_attachment(index);
            respond(controller, render, reply, removed);
        }
        SessionCommand::CancelResponse { reply } => {
            let cancelled = controller.cancel_turn();
            respond(controller, render, reply, cancelled);
        }
        SessionCommand::SwitchUser { user_id, reply } => {
            let result = controller.reinitialize(user_id).await;
            respond(controller, render, reply, result);
        }
        SessionCommand::Shutdown => {}
    }
}
