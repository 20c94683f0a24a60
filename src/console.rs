//! Line-oriented console front end for the UI host
//!
//! Shows each ask on stdout and reads the user's reply from stdin. A plain
//! line answers the open ask; lines starting with `:` are commands.

use crate::host::{AskDispatcher, DialogSession, Presenter, ReopenOutcome, ReplyStatus};
use crate::process::ProcessControl;
use crate::protocol::AskPayload;
use crate::sweeper::Sweeper;
use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const HELP: &str = "\
Type an answer and press Enter to send it.
  :end       continue without input
  :cancel    cancel the ask
  :close     close the dialog (cancels the ask)
  :dismiss   hide the dialog, keep it for :reopen
  :reopen    show the last undelivered ask again
  :status    show service status
  :restart   restart the ask service
  :quit      stop the host";

/// One line of console input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Answer(String),
    End,
    Cancel,
    Close,
    Dismiss,
    Reopen,
    Status,
    Restart,
    Help,
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Some(command) = trimmed.strip_prefix(':') else {
            return Some(Self::Answer(trimmed.to_string()));
        };
        Some(match command.to_ascii_lowercase().as_str() {
            "end" | "continue" => Self::End,
            "cancel" => Self::Cancel,
            "close" => Self::Close,
            "dismiss" | "hide" => Self::Dismiss,
            "reopen" => Self::Reopen,
            "status" => Self::Status,
            "restart" => Self::Restart,
            "help" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            // `::text` sends a literal answer starting with ':'
            _ if command.starts_with(':') => Self::Answer(command.to_string()),
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Presents asks on the terminal; at most one is open at a time.
#[derive(Debug, Clone, Default)]
pub struct ConsolePresenter {
    active: Arc<Mutex<Option<DialogSession>>>,
}

impl ConsolePresenter {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, Option<DialogSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the open session, leaving none open.
    pub fn take(&self) -> Option<DialogSession> {
        self.active().take()
    }

    /// Put a session back unless another ask arrived in the meantime.
    pub fn restore(&self, session: DialogSession) {
        let mut active = self.active();
        if active.is_none() {
            *active = Some(session);
        }
    }

    pub fn has_open(&self) -> bool {
        self.active().is_some()
    }
}

impl Presenter for ConsolePresenter {
    fn present(&self, session: DialogSession) -> anyhow::Result<()> {
        println!("\n{}", render(&session));
        let previous = self.active().replace(session.clone());

        if let Some(previous) = previous {
            if previous.request().request_id != session.request().request_id {
                // The older dialog is gone from the screen; treat it as closed.
                info!(
                    "Ask {} replaced by {}",
                    previous.request().request_id,
                    session.request().request_id
                );
                tokio::spawn(async move {
                    previous.close().await;
                });
            }
        }
        Ok(())
    }
}

fn render(session: &DialogSession) -> String {
    let request = session.request();
    let mut text = format!(
        "=== {} [{}] ===\n{}",
        request.kind, request.request_id, request.reason
    );
    match &request.payload {
        Some(AskPayload::Image(image)) => {
            text.push_str(&format!(
                "\nImage: {} ({}, {} bytes)\nQuestion: {}",
                image.file_name, image.mime_type, image.size, image.question
            ));
        }
        Some(AskPayload::Files(files)) => {
            let (images, texts) = files.counts();
            text.push_str(&format!(
                "\nFiles: {} ({} images, {} other)",
                files.files.len(),
                images,
                texts
            ));
            for file in &files.files {
                text.push_str(&format!("\n  - {} ({} bytes)", file.file_path, file.size));
            }
            text.push_str(&format!("\nQuestion: {}", files.question));
        }
        None => {}
    }
    text.push_str("\n(type an answer, or :help)");
    text
}

fn describe(status: ReplyStatus) -> &'static str {
    match status {
        ReplyStatus::Delivered => "Delivered",
        ReplyStatus::Expired => "Requester is no longer waiting",
        ReplyStatus::AlreadyFinished => "Already answered",
    }
}

/// Drive the host from stdin until `:quit`, EOF or Ctrl-C.
///
/// Any dialog still open on exit is closed, which cancels its ask.
pub async fn run_console<P: ProcessControl>(
    mut dispatcher: AskDispatcher,
    presenter: ConsolePresenter,
    sweeper: Sweeper<P>,
) -> anyhow::Result<()> {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);

    // stdin has no async reader that cancels cleanly; read on a plain thread
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    println!("{HELP}");

    loop {
        let line = tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => line,
                None => {
                    debug!("stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };

        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };

        match command {
            ConsoleCommand::Answer(text) => match presenter.take() {
                Some(session) => match session.submit(text).await {
                    Ok(status) => println!("{}", describe(status)),
                    Err(e) => {
                        error!("Failed to send reply: {}", e);
                        println!("Reply not sent, try again");
                        presenter.restore(session);
                    }
                },
                None => println!("No dialog is open"),
            },
            ConsoleCommand::End => match presenter.take() {
                Some(session) => match session.end().await {
                    Ok(status) => println!("{}", describe(status)),
                    Err(e) => {
                        error!("Failed to send reply: {}", e);
                        presenter.restore(session);
                    }
                },
                None => println!("No dialog is open"),
            },
            ConsoleCommand::Cancel => match presenter.take() {
                Some(session) => println!("{}", describe(session.cancel().await)),
                None => println!("No dialog is open"),
            },
            ConsoleCommand::Close => match presenter.take() {
                Some(session) => println!("{}", describe(session.close().await)),
                None => println!("No dialog is open"),
            },
            ConsoleCommand::Dismiss => match presenter.take() {
                Some(session) => {
                    session.dismiss();
                    println!("Dismissed; use :reopen to show it again");
                }
                None => println!("No dialog is open"),
            },
            ConsoleCommand::Reopen => match dispatcher.reopen().await {
                ReopenOutcome::Reopened { .. } => {}
                ReopenOutcome::Expired => println!("The last ask is too old to reopen"),
                ReopenOutcome::NoPending => println!("Nothing to reopen"),
                ReopenOutcome::PresentFailed(e) => println!("Could not reopen: {e}"),
            },
            ConsoleCommand::Status => {
                let state = dispatcher.status();
                let running = if state.is_running() { "running" } else { "stopped" };
                println!(
                    "Ask service {} on port {}, {} asks presented, dialog {}",
                    running,
                    state.port(),
                    dispatcher.presented_count(),
                    if presenter.has_open() { "open" } else { "closed" }
                );
            }
            ConsoleCommand::Restart => match dispatcher.restart(&sweeper).await {
                Ok(port) => println!("Restarted on port {port}"),
                Err(e) => println!("Restart failed: {e}"),
            },
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Quit => break,
            ConsoleCommand::Unknown(command) => {
                warn!("Unknown command :{}", command);
                println!("Unknown command :{command}, try :help");
            }
        }
    }

    if let Some(session) = presenter.take() {
        session.close().await;
    }
    dispatcher.stop().await;
    Ok(())
}
